//! ClinVar extraction and consensus labelling

use crate::flatten::record::ClinvarSummary;
use crate::nirvana::model::{ClinvarEntry, VariantEntry};
use serde_json::Value;
use std::collections::BTreeSet;

/// Consensus label for a set of germline classifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClinvarConsensus {
    Pathogenic,
    Benign,
    UncertainSignificance,
    Conflicting,
    DrugResponse,
    Affects,
    Protective,
    LowPenetrance,
    NotProvided,
    GwasHit,
    RiskFactor,
    Other,
}

/// Checked in order; a significance set gets the first label whose term
/// list contains every one of its terms
const CONSENSUS_SETS: &[(ClinvarConsensus, &[&str])] = &[
    (
        ClinvarConsensus::Pathogenic,
        &[
            "pathogenic",
            "likely pathogenic",
            "pathogenic/likely pathogenic",
            "likely pathogenic/pathogenic",
        ],
    ),
    (
        ClinvarConsensus::Benign,
        &[
            "benign",
            "likely benign",
            "benign/likely benign",
            "likely benign/benign",
        ],
    ),
    (ClinvarConsensus::UncertainSignificance, &["uncertain significance"]),
    (
        ClinvarConsensus::Conflicting,
        &["conflicting classifications of pathogenicity"],
    ),
    (ClinvarConsensus::DrugResponse, &["drug response"]),
    (ClinvarConsensus::Affects, &["affects"]),
    (ClinvarConsensus::Protective, &["protective"]),
    (
        ClinvarConsensus::LowPenetrance,
        &[
            "pathogenic/likely pathogenic/pathogenic, low penetrance",
            "pathogenic/pathogenic, low penetrance",
            "likely risk allele",
            "uncertain risk allele",
            "uncertain significance/uncertain risk allele",
        ],
    ),
    (ClinvarConsensus::NotProvided, &["not provided", "na", "nan"]),
    (ClinvarConsensus::GwasHit, &["association"]),
    (ClinvarConsensus::RiskFactor, &["risk factor"]),
];

impl ClinvarConsensus {
    /// Label a `;`-separated significance string
    ///
    /// Terms are trimmed and compared case-insensitively. Mixed sets (for
    /// example pathogenic and benign together) fall through to `Other`.
    pub fn from_significance(significance: Option<&str>) -> Self {
        let terms: BTreeSet<String> = significance
            .unwrap_or_default()
            .split(';')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();

        if terms.is_empty() {
            return ClinvarConsensus::NotProvided;
        }

        CONSENSUS_SETS
            .iter()
            .find(|(_, members)| terms.iter().all(|term| members.contains(&term.as_str())))
            .map(|(label, _)| *label)
            .unwrap_or(ClinvarConsensus::Other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClinvarConsensus::Pathogenic => "Likely pathogenic/Pathogenic",
            ClinvarConsensus::Benign => "Likely benign/Benign",
            ClinvarConsensus::UncertainSignificance => "Uncertain significance",
            ClinvarConsensus::Conflicting => "Conflicting classifications of pathogenicity",
            ClinvarConsensus::DrugResponse => "Drug response",
            ClinvarConsensus::Affects => "Affects a non-disease phenotype",
            ClinvarConsensus::Protective => "Protective",
            ClinvarConsensus::LowPenetrance => "Low penetrance for Mendelian diseases",
            ClinvarConsensus::NotProvided => "Not provided",
            ClinvarConsensus::GwasHit => "GWAS hits",
            ClinvarConsensus::RiskFactor => "Risk factor",
            ClinvarConsensus::Other => "Other",
        }
    }
}

fn join(values: Vec<String>) -> Option<String> {
    if values.is_empty() {
        None
    } else {
        Some(values.join(";"))
    }
}

fn entry_id(entry: &ClinvarEntry) -> Option<String> {
    let version = match &entry.version {
        Some(Value::String(v)) if !v.is_empty() => Some(v.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    match (&entry.accession, version) {
        (Some(accession), Some(version)) => Some(format!("{accession}.{version}")),
        (Some(accession), None) => Some(accession.clone()),
        (None, _) => entry.id.clone(),
    }
}

/// Summarise the allele-specific ClinVar entries of a variant
///
/// The current `clinvar-preview` block wins over the legacy `clinvar` block
/// when both are present.
pub fn summarize(variant: &VariantEntry) -> ClinvarSummary {
    let entries = variant
        .clinvar_preview
        .as_ref()
        .or(variant.clinvar.as_ref())
        .into_iter()
        .flat_map(|block| block.iter())
        .filter(|entry| entry.is_allele_specific == Some(true));

    let mut significances = Vec::new();
    let mut variant_types = Vec::new();
    let mut ids = Vec::new();

    for entry in entries {
        let germline = entry
            .classifications
            .as_ref()
            .and_then(|c| c.germline_classification.as_ref())
            .and_then(|g| g.classification.clone());
        match germline {
            Some(classification) => significances.push(classification),
            None => significances.extend(entry.significance.iter().cloned()),
        }
        if let Some(variant_type) = &entry.variant_type {
            variant_types.push(variant_type.clone());
        }
        if let Some(id) = entry_id(entry) {
            ids.push(id);
        }
    }

    let clinvar_significance = join(significances);
    let clinvar_consensus =
        ClinvarConsensus::from_significance(clinvar_significance.as_deref())
            .as_str()
            .to_string();

    ClinvarSummary {
        clinvar_significance,
        clinvar_variant_type: join(variant_types),
        clinvar_id: join(ids),
        clinvar_consensus,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn consensus(value: Option<&str>) -> &'static str {
        ClinvarConsensus::from_significance(value).as_str()
    }

    #[test]
    fn test_consensus_labels() {
        assert_eq!(consensus(Some("Pathogenic")), "Likely pathogenic/Pathogenic");
        assert_eq!(
            consensus(Some("Likely pathogenic; Pathogenic")),
            "Likely pathogenic/Pathogenic"
        );
        assert_eq!(consensus(Some("Benign;Likely benign")), "Likely benign/Benign");
        assert_eq!(consensus(Some("drug response")), "Drug response");
        assert_eq!(consensus(Some("association")), "GWAS hits");
        assert_eq!(consensus(Some("Pathogenic;Benign")), "Other");
    }

    #[test]
    fn test_consensus_empty_inputs() {
        assert_eq!(consensus(None), "Not provided");
        assert_eq!(consensus(Some("")), "Not provided");
        assert_eq!(consensus(Some("   ")), "Not provided");
        assert_eq!(consensus(Some(";")), "Not provided");
        assert_eq!(consensus(Some("not provided")), "Not provided");
    }

    #[test]
    fn test_summarize_keeps_only_allele_specific_entries() {
        let variant: VariantEntry = serde_json::from_value(json!({
            "clinvar-preview": [
                {
                    "accession": "RCV000031234", "version": 5,
                    "variantType": "single_nucleotide_variant",
                    "isAlleleSpecific": true,
                    "classifications": {"germlineClassification": {"classification": "Pathogenic"}}
                },
                {
                    "accession": "RCV000099999", "version": 1,
                    "isAlleleSpecific": false,
                    "classifications": {"germlineClassification": {"classification": "Benign"}}
                },
                {
                    "accession": "RCV000055555",
                    "isAlleleSpecific": true,
                    "classifications": {"germlineClassification": {"classification": "Likely pathogenic"}}
                }
            ]
        }))
        .unwrap();

        let summary = summarize(&variant);
        assert_eq!(
            summary.clinvar_significance.as_deref(),
            Some("Pathogenic;Likely pathogenic")
        );
        assert_eq!(
            summary.clinvar_id.as_deref(),
            Some("RCV000031234.5;RCV000055555")
        );
        assert_eq!(
            summary.clinvar_variant_type.as_deref(),
            Some("single_nucleotide_variant")
        );
        assert_eq!(summary.clinvar_consensus, "Likely pathogenic/Pathogenic");
    }

    #[test]
    fn test_summarize_single_object_and_legacy_block() {
        let preview: VariantEntry = serde_json::from_value(json!({
            "clinvar-preview": {
                "accession": "RCV1", "version": "2", "isAlleleSpecific": true,
                "classifications": {"germlineClassification": {"classification": "Uncertain significance"}}
            }
        }))
        .unwrap();
        let summary = summarize(&preview);
        assert_eq!(summary.clinvar_id.as_deref(), Some("RCV1.2"));
        assert_eq!(summary.clinvar_consensus, "Uncertain significance");

        let legacy: VariantEntry = serde_json::from_value(json!({
            "clinvar": [{"id": "RCV7", "isAlleleSpecific": true, "significance": ["benign", "likely benign"]}]
        }))
        .unwrap();
        let summary = summarize(&legacy);
        assert_eq!(summary.clinvar_id.as_deref(), Some("RCV7"));
        assert_eq!(summary.clinvar_consensus, "Likely benign/Benign");
    }

    #[test]
    fn test_summarize_without_clinvar() {
        let summary = summarize(&VariantEntry::default());
        assert_eq!(summary.clinvar_significance, None);
        assert_eq!(summary.clinvar_id, None);
        assert_eq!(summary.clinvar_consensus, "Not provided");
    }
}
