//! Consequence severity ranking
//!
//! [`Consequence`] is declared most severe first and its derived `Ord` is the
//! ranking; nothing else in the crate encodes severity. The order follows the
//! Ensembl/Sequence Ontology table except that `intron_variant` ranks above
//! the synonymous and UTR terms.
//!
//! Terms not in the table rank below every known term and order lexically
//! among themselves, which keeps sorting total and deterministic.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Consequence {
    // loss of function
    TranscriptAblation,
    SpliceAcceptorVariant,
    SpliceDonorVariant,
    StopGained,
    FrameshiftVariant,
    StopLost,
    StartLost,
    TranscriptAmplification,
    FeatureElongation,
    FeatureTruncation,
    // protein altering
    InframeInsertion,
    InframeDeletion,
    MissenseVariant,
    ProteinAlteringVariant,
    // splice region
    SpliceDonor5thBaseVariant,
    SpliceRegionVariant,
    SpliceDonorRegionVariant,
    SplicePolypyrimidineTractVariant,
    // intronic
    IntronVariant,
    // silent / UTR
    IncompleteTerminalCodonVariant,
    StartRetainedVariant,
    StopRetainedVariant,
    SynonymousVariant,
    CodingSequenceVariant,
    MatureMirnaVariant,
    FivePrimeUtrVariant,
    ThreePrimeUtrVariant,
    NonCodingTranscriptExonVariant,
    NmdTranscriptVariant,
    NonCodingTranscriptVariant,
    CodingTranscriptVariant,
    // flanking
    UpstreamGeneVariant,
    DownstreamGeneVariant,
    // regulatory
    TfbsAblation,
    TfbsAmplification,
    TfBindingSiteVariant,
    RegulatoryRegionAblation,
    RegulatoryRegionAmplification,
    RegulatoryRegionVariant,
    IntergenicVariant,
    SequenceVariant,
}

impl Consequence {
    /// Every known term, most severe first
    pub const ALL: [Consequence; 41] = [
        Consequence::TranscriptAblation,
        Consequence::SpliceAcceptorVariant,
        Consequence::SpliceDonorVariant,
        Consequence::StopGained,
        Consequence::FrameshiftVariant,
        Consequence::StopLost,
        Consequence::StartLost,
        Consequence::TranscriptAmplification,
        Consequence::FeatureElongation,
        Consequence::FeatureTruncation,
        Consequence::InframeInsertion,
        Consequence::InframeDeletion,
        Consequence::MissenseVariant,
        Consequence::ProteinAlteringVariant,
        Consequence::SpliceDonor5thBaseVariant,
        Consequence::SpliceRegionVariant,
        Consequence::SpliceDonorRegionVariant,
        Consequence::SplicePolypyrimidineTractVariant,
        Consequence::IntronVariant,
        Consequence::IncompleteTerminalCodonVariant,
        Consequence::StartRetainedVariant,
        Consequence::StopRetainedVariant,
        Consequence::SynonymousVariant,
        Consequence::CodingSequenceVariant,
        Consequence::MatureMirnaVariant,
        Consequence::FivePrimeUtrVariant,
        Consequence::ThreePrimeUtrVariant,
        Consequence::NonCodingTranscriptExonVariant,
        Consequence::NmdTranscriptVariant,
        Consequence::NonCodingTranscriptVariant,
        Consequence::CodingTranscriptVariant,
        Consequence::UpstreamGeneVariant,
        Consequence::DownstreamGeneVariant,
        Consequence::TfbsAblation,
        Consequence::TfbsAmplification,
        Consequence::TfBindingSiteVariant,
        Consequence::RegulatoryRegionAblation,
        Consequence::RegulatoryRegionAmplification,
        Consequence::RegulatoryRegionVariant,
        Consequence::IntergenicVariant,
        Consequence::SequenceVariant,
    ];

    /// Sequence Ontology term as written by the annotation engine
    pub fn as_str(&self) -> &'static str {
        match self {
            Consequence::TranscriptAblation => "transcript_ablation",
            Consequence::SpliceAcceptorVariant => "splice_acceptor_variant",
            Consequence::SpliceDonorVariant => "splice_donor_variant",
            Consequence::StopGained => "stop_gained",
            Consequence::FrameshiftVariant => "frameshift_variant",
            Consequence::StopLost => "stop_lost",
            Consequence::StartLost => "start_lost",
            Consequence::TranscriptAmplification => "transcript_amplification",
            Consequence::FeatureElongation => "feature_elongation",
            Consequence::FeatureTruncation => "feature_truncation",
            Consequence::InframeInsertion => "inframe_insertion",
            Consequence::InframeDeletion => "inframe_deletion",
            Consequence::MissenseVariant => "missense_variant",
            Consequence::ProteinAlteringVariant => "protein_altering_variant",
            Consequence::SpliceDonor5thBaseVariant => "splice_donor_5th_base_variant",
            Consequence::SpliceRegionVariant => "splice_region_variant",
            Consequence::SpliceDonorRegionVariant => "splice_donor_region_variant",
            Consequence::SplicePolypyrimidineTractVariant => {
                "splice_polypyrimidine_tract_variant"
            }
            Consequence::IntronVariant => "intron_variant",
            Consequence::IncompleteTerminalCodonVariant => "incomplete_terminal_codon_variant",
            Consequence::StartRetainedVariant => "start_retained_variant",
            Consequence::StopRetainedVariant => "stop_retained_variant",
            Consequence::SynonymousVariant => "synonymous_variant",
            Consequence::CodingSequenceVariant => "coding_sequence_variant",
            Consequence::MatureMirnaVariant => "mature_miRNA_variant",
            Consequence::FivePrimeUtrVariant => "5_prime_UTR_variant",
            Consequence::ThreePrimeUtrVariant => "3_prime_UTR_variant",
            Consequence::NonCodingTranscriptExonVariant => "non_coding_transcript_exon_variant",
            Consequence::NmdTranscriptVariant => "NMD_transcript_variant",
            Consequence::NonCodingTranscriptVariant => "non_coding_transcript_variant",
            Consequence::CodingTranscriptVariant => "coding_transcript_variant",
            Consequence::UpstreamGeneVariant => "upstream_gene_variant",
            Consequence::DownstreamGeneVariant => "downstream_gene_variant",
            Consequence::TfbsAblation => "TFBS_ablation",
            Consequence::TfbsAmplification => "TFBS_amplification",
            Consequence::TfBindingSiteVariant => "TF_binding_site_variant",
            Consequence::RegulatoryRegionAblation => "regulatory_region_ablation",
            Consequence::RegulatoryRegionAmplification => "regulatory_region_amplification",
            Consequence::RegulatoryRegionVariant => "regulatory_region_variant",
            Consequence::IntergenicVariant => "intergenic_variant",
            Consequence::SequenceVariant => "sequence_variant",
        }
    }

    pub fn from_term(term: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == term)
    }
}

impl fmt::Display for Consequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sort key for a consequence term; smaller is more severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TermRank<'a> {
    Known(Consequence),
    Unknown(&'a str),
    /// A transcript without any consequence term
    Absent,
}

impl<'a> TermRank<'a> {
    pub fn of(term: &'a str) -> Self {
        match Consequence::from_term(term) {
            Some(known) => TermRank::Known(known),
            None => TermRank::Unknown(term),
        }
    }

    /// Rank of the most severe term in a list
    pub fn most_severe<I>(terms: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        terms
            .into_iter()
            .map(TermRank::of)
            .min()
            .unwrap_or(TermRank::Absent)
    }
}

/// Distinct terms, most severe first
pub fn rank_terms<'a, I>(terms: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut ranked: Vec<&str> = terms.into_iter().collect();
    ranked.sort_by_key(|term| TermRank::of(*term));
    ranked.dedup();
    ranked.into_iter().map(str::to_string).collect()
}
