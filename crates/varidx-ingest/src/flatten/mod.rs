//! Raw annotation unit → flattened variant record
//!
//! [`VariantFlattener::flatten`] is pure: it reads nothing but its argument
//! and returns the same record for the same unit every time.

pub mod clinvar;
pub mod record;
pub mod severity;

pub use record::{
    ClinvarSummary, ConservationScores, FlattenedVariantRecord, PopulationFrequencies, VariantType,
};
pub use severity::{Consequence, TermRank};

use crate::error::{IngestError, Result};
use crate::nirvana::model::{RawAnnotationUnit, TranscriptEntry};
use std::collections::BTreeSet;

/// Flattens one annotation unit into one search document
#[derive(Debug, Clone, Copy, Default)]
pub struct VariantFlattener;

impl VariantFlattener {
    pub fn new() -> Self {
        Self
    }

    pub fn flatten(&self, unit: &RawAnnotationUnit) -> Result<FlattenedVariantRecord> {
        let context = &unit.context;
        let variant = &unit.variant;

        let position = context
            .position
            .ok_or_else(|| schema_error(unit, "position"))?;
        let chromosome = context
            .chromosome
            .clone()
            .or_else(|| variant.chromosome.clone())
            .ok_or_else(|| schema_error(unit, "chromosome"))?;
        let ref_allele = context
            .ref_allele
            .clone()
            .or_else(|| variant.ref_allele.clone())
            .ok_or_else(|| schema_error(unit, "ref"))?;
        let alt = unit
            .alt_allele
            .clone()
            .ok_or_else(|| schema_error(unit, "alt"))?;

        let vid = variant_id(&chromosome, position, &ref_allele, &alt);
        let variant_type = VariantType::classify(&ref_allele, &alt);

        let canonical = select_canonical(&variant.transcripts);
        let genes: BTreeSet<&str> = variant
            .transcripts
            .iter()
            .filter_map(|t| t.hgnc.as_deref())
            .collect();
        let all_consequences = severity::rank_terms(
            variant
                .transcripts
                .iter()
                .flat_map(|t| t.consequence.iter().map(String::as_str)),
        );

        let mut rsids: Vec<&str> = Vec::new();
        for id in variant.dbsnp.iter().flat_map(|dbsnp| dbsnp.ids()) {
            if !rsids.contains(&id.as_str()) {
                rsids.push(id);
            }
        }

        let population = PopulationFrequencies::extract(&variant.annotations);

        Ok(FlattenedVariantRecord {
            vid,
            chromosome,
            position,
            ref_allele,
            alt,
            variant_type,
            hgvsg: variant.hgvsg.clone(),
            begin: variant.begin,
            end: variant.end,
            rsid: (!rsids.is_empty()).then(|| rsids.join(",")),
            gene: canonical.and_then(|t| t.hgnc.clone()),
            genes: genes.into_iter().map(str::to_string).collect(),
            canonical_transcript: canonical.and_then(|t| t.transcript.clone()),
            n_transcripts: variant.transcripts.len() as i64,
            all_consequences,
            filters: (!context.filters.is_empty()).then(|| context.filters.join(",")),
            mapping_quality: context.mapping_quality.map(record::positive_zero),
            fisher_strand_bias: record::lookup(&variant.annotations, &["fisherStrandBias"]),
            quality: record::lookup(&variant.annotations, &["quality"]),
            cytogenetic_band: context.cytogenetic_band.clone(),
            conservation: ConservationScores::extract(&variant.annotations),
            max_gnomad_af: population.max_gnomad_af(),
            max_pop_af: population.max_pop_af(),
            population,
            clinvar: clinvar::summarize(variant),
        })
    }
}

/// `chrom-pos-ref-alt`, with any `chr` prefix dropped from the chromosome
pub fn variant_id(chromosome: &str, position: i64, ref_allele: &str, alt: &str) -> String {
    let chromosome = chromosome.strip_prefix("chr").unwrap_or(chromosome);
    format!("{chromosome}-{position}-{ref_allele}-{alt}")
}

/// Pick the transcript that represents the variant
///
/// Candidates are the transcripts flagged canonical, or all transcripts when
/// none is flagged. The candidate whose most severe consequence ranks highest
/// wins; on equal rank the earliest transcript wins.
pub fn select_canonical(transcripts: &[TranscriptEntry]) -> Option<&TranscriptEntry> {
    let flagged = transcripts.iter().any(|t| t.is_canonical == Some(true));
    transcripts
        .iter()
        .filter(|t| !flagged || t.is_canonical == Some(true))
        // min_by_key keeps the first of equal minima
        .min_by_key(|t| TermRank::most_severe(t.consequence.iter().map(String::as_str)))
}

fn schema_error(unit: &RawAnnotationUnit, field: &'static str) -> IngestError {
    let chromosome = unit.context.chromosome.as_deref().unwrap_or("?");
    let position = unit
        .context
        .position
        .map(|p| p.to_string())
        .unwrap_or_else(|| "?".to_string());
    IngestError::Schema {
        field,
        context: format!("#{} ({chromosome}:{position})", unit.position_index),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::nirvana::model::PositionEntry;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn units(position: Value) -> Vec<RawAnnotationUnit> {
        serde_json::from_value::<PositionEntry>(position)
            .unwrap()
            .into_units(0)
    }

    fn transcript(gene: &str, consequences: &[&str]) -> Value {
        json!({
            "transcript": format!("ENST_{gene}_{}", consequences.join("_")),
            "hgnc": gene,
            "consequence": consequences,
        })
    }

    fn flatten_one(transcripts: Vec<Value>) -> FlattenedVariantRecord {
        let unit = units(json!({
            "chromosome": "chr7", "position": 117559590, "refAllele": "A", "altAlleles": ["G"],
            "variants": [{"altAllele": "G", "transcripts": transcripts}]
        }))
        .remove(0);
        VariantFlattener::new().flatten(&unit).unwrap()
    }

    #[test]
    fn test_more_severe_transcript_wins_without_canonical_flag() {
        let record = flatten_one(vec![
            transcript("SILENT", &["synonymous_variant"]),
            transcript("CHANGED", &["missense_variant"]),
        ]);
        assert_eq!(record.gene.as_deref(), Some("CHANGED"));
    }

    #[test]
    fn test_skipped_star_allele_keeps_annotations_on_their_own_vid() {
        let unit = units(json!({
            "chromosome": "chr1", "position": 100, "refAllele": "A", "altAlleles": ["*", "T"],
            "variants": [{"altAllele": "T", "transcripts": [transcript("BRCA1", &["missense_variant"])]}]
        }))
        .remove(0);
        let record = VariantFlattener::new().flatten(&unit).unwrap();
        assert_eq!(record.vid, "1-100-A-T");
        assert_eq!(record.alt, "T");
        assert_eq!(record.gene.as_deref(), Some("BRCA1"));
    }

    #[test]
    fn test_three_transcript_scenario() {
        let record = flatten_one(vec![
            transcript("A", &["intron_variant"]),
            transcript("A", &["missense_variant"]),
            transcript("B", &["synonymous_variant"]),
        ]);
        assert_eq!(record.gene.as_deref(), Some("A"));
        assert_eq!(
            record.all_consequences,
            vec!["missense_variant", "intron_variant", "synonymous_variant"]
        );
        assert_eq!(record.genes, vec!["A", "B"]);
        assert_eq!(record.n_transcripts, 3);
        assert_eq!(
            record.canonical_transcript.as_deref(),
            Some("ENST_A_missense_variant")
        );
    }

    #[test]
    fn test_canonical_flag_beats_severity() {
        let mut flagged = transcript("QUIET", &["upstream_gene_variant"]);
        flagged["isCanonical"] = json!(true);
        let record = flatten_one(vec![transcript("LOUD", &["stop_gained"]), flagged]);
        assert_eq!(record.gene.as_deref(), Some("QUIET"));
        assert_eq!(
            record.all_consequences,
            vec!["stop_gained", "upstream_gene_variant"]
        );
    }

    #[test]
    fn test_equal_severity_keeps_first_transcript() {
        let record = flatten_one(vec![
            transcript("FIRST", &["missense_variant"]),
            transcript("SECOND", &["missense_variant"]),
        ]);
        assert_eq!(record.gene.as_deref(), Some("FIRST"));
    }

    #[test]
    fn test_core_fields() {
        let unit = units(json!({
            "chromosome": "chr17", "position": 43071077, "refAllele": "T", "altAlleles": ["C"],
            "filters": ["PASS"], "mappingQuality": 60.0, "cytogeneticBand": "17q21.31",
            "variants": [{
                "vid": "ignored", "altAllele": "C", "begin": 43071077, "end": 43071077,
                "hgvsg": "NC_000017.11:g.43071077T>C",
                "dbsnp": ["rs1799966", "rs1799966"],
                "quality": 812.3, "phylopScore": 0.0,
                "gnomad": {"allAf": 0.31, "nfeAf": 0.33},
                "gnomad-exome": {"allAf": 0.35}
            }]
        }))
        .remove(0);

        let record = VariantFlattener::new().flatten(&unit).unwrap();
        assert_eq!(record.vid, "17-43071077-T-C");
        assert_eq!(record.chromosome, "chr17");
        assert_eq!(record.variant_type, VariantType::Snv);
        assert_eq!(record.rsid.as_deref(), Some("rs1799966"));
        assert_eq!(record.filters.as_deref(), Some("PASS"));
        assert_eq!(record.quality, Some(812.3));
        assert_eq!(record.conservation.phylop_score, Some(0.0));
        assert_eq!(record.conservation.gerp_score, None);
        assert_eq!(record.max_gnomad_af, Some(0.35));
        assert_eq!(record.max_pop_af, Some(0.33));
        assert_eq!(record.gene, None);
        assert!(record.all_consequences.is_empty());
        assert_eq!(record.clinvar.clinvar_consensus, "Not provided");
    }

    #[test]
    fn test_missing_required_fields_are_schema_errors() {
        let flattener = VariantFlattener::new();

        let no_position = units(json!({"chromosome": "1", "refAllele": "A", "altAlleles": ["T"]}));
        let err = flattener.flatten(&no_position[0]).unwrap_err();
        assert_eq!(err.skip_reason(), Some("missing_position"));

        let no_alt = units(json!({"chromosome": "1", "position": 5, "refAllele": "A"}));
        let err = flattener.flatten(&no_alt[0]).unwrap_err();
        assert_eq!(err.skip_reason(), Some("missing_alt"));

        let no_ref = units(json!({"chromosome": "1", "position": 5, "altAlleles": ["T"]}));
        let err = flattener.flatten(&no_ref[0]).unwrap_err();
        assert_eq!(err.skip_reason(), Some("missing_ref"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_serialized_field_order_is_fixed() {
        let record = flatten_one(vec![transcript("A", &["missense_variant"])]);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.starts_with("{\"vid\":\"7-117559590-A-G\",\"chromosome\":\"chr7\""));
        assert!(json.contains("\"gnomad_af\":null"));
        assert!(json.ends_with("\"clinvar_consensus\":\"Not provided\"}"));
    }

    const TERMS: &[&str] = &[
        "stop_gained",
        "missense_variant",
        "synonymous_variant",
        "intron_variant",
        "upstream_gene_variant",
        "splice_region_variant",
        "unlisted_term",
    ];

    fn arb_transcript() -> impl Strategy<Value = Value> {
        (
            prop::sample::select(vec!["A", "B", "C"]),
            prop::collection::vec(prop::sample::select(TERMS.to_vec()), 0..3),
            any::<bool>(),
        )
            .prop_map(|(gene, terms, canonical)| {
                json!({"hgnc": gene, "consequence": terms, "isCanonical": canonical})
            })
    }

    proptest! {
        #[test]
        fn prop_flatten_is_deterministic(
            transcripts in prop::collection::vec(arb_transcript(), 0..6),
            af in prop::option::of(0.0f64..1.0),
        ) {
            let unit = units(json!({
                "chromosome": "3", "position": 100, "refAllele": "A", "altAlleles": ["AT"],
                "variants": [{"transcripts": transcripts, "gnomad": {"allAf": af}}]
            }))
            .remove(0);

            let flattener = VariantFlattener::new();
            let first = serde_json::to_vec(&flattener.flatten(&unit).unwrap()).unwrap();
            let second = serde_json::to_vec(&flattener.flatten(&unit).unwrap()).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_all_consequences_sorted_by_severity(
            transcripts in prop::collection::vec(arb_transcript(), 1..6),
        ) {
            let unit = units(json!({
                "chromosome": "3", "position": 100, "refAllele": "A", "altAlleles": ["G"],
                "variants": [{"transcripts": transcripts}]
            }))
            .remove(0);

            let record = VariantFlattener::new().flatten(&unit).unwrap();
            for pair in record.all_consequences.windows(2) {
                prop_assert!(TermRank::of(&pair[0]) < TermRank::of(&pair[1]));
            }
        }
    }
}
