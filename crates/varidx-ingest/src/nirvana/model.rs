//! Raw annotation shapes as written by the Nirvana annotation engine
//!
//! Every field is optional here. Missing required fields are reported by the
//! flattener as schema errors so that one incomplete entry never aborts a run;
//! only entries that are not valid JSON for these shapes fail to decode.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// One element of the `positions` array
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionEntry {
    pub chromosome: Option<String>,
    pub position: Option<i64>,
    pub ref_allele: Option<String>,
    #[serde(default)]
    pub alt_alleles: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    pub mapping_quality: Option<f64>,
    pub cytogenetic_band: Option<String>,
    pub variants: Option<Vec<VariantEntry>>,
}

/// One alternate allele at a position, with its annotations
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantEntry {
    pub vid: Option<String>,
    pub chromosome: Option<String>,
    pub begin: Option<i64>,
    pub end: Option<i64>,
    pub ref_allele: Option<String>,
    pub alt_allele: Option<String>,
    pub variant_type: Option<String>,
    pub hgvsg: Option<String>,
    #[serde(default)]
    pub transcripts: Vec<TranscriptEntry>,
    pub dbsnp: Option<DbSnp>,
    #[serde(rename = "clinvar-preview")]
    pub clinvar_preview: Option<OneOrMany<ClinvarEntry>>,
    pub clinvar: Option<OneOrMany<ClinvarEntry>>,
    /// Everything else: population blocks (`gnomad`, `gnomad-exome`,
    /// `topmed`), conservation scores, quality metrics
    #[serde(flatten)]
    pub annotations: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub transcript: Option<String>,
    pub source: Option<String>,
    pub bio_type: Option<String>,
    pub gene_id: Option<String>,
    pub hgnc: Option<String>,
    #[serde(default)]
    pub consequence: Vec<String>,
    pub impact: Option<String>,
    pub is_canonical: Option<bool>,
}

/// dbSNP ids appear either as a bare list or wrapped in `{"ids": [...]}`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DbSnp {
    Ids(Vec<String>),
    Wrapped { ids: Vec<String> },
}

impl DbSnp {
    pub fn ids(&self) -> &[String] {
        match self {
            DbSnp::Ids(ids) | DbSnp::Wrapped { ids } => ids,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item).iter(),
            OneOrMany::Many(items) => items.iter(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinvarEntry {
    pub id: Option<String>,
    pub accession: Option<String>,
    /// Integer in current releases, string in some older dumps
    pub version: Option<Value>,
    pub variant_type: Option<String>,
    pub is_allele_specific: Option<bool>,
    pub classifications: Option<ClinvarClassifications>,
    /// Legacy `clinvar` block
    #[serde(default)]
    pub significance: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinvarClassifications {
    pub germline_classification: Option<GermlineClassification>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GermlineClassification {
    pub classification: Option<String>,
}

/// Position-level context shared by every variant at that position
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionContext {
    pub chromosome: Option<String>,
    pub position: Option<i64>,
    pub ref_allele: Option<String>,
    pub filters: Vec<String>,
    pub mapping_quality: Option<f64>,
    pub cytogenetic_band: Option<String>,
}

/// One variant's worth of annotation, the unit handed to the flattener
///
/// `alt_allele` is the VCF alternate allele for this variant; `variant` holds
/// the engine's annotations and is empty when the position carried only
/// `altAlleles`.
#[derive(Debug, Clone, Default)]
pub struct RawAnnotationUnit {
    /// Zero-based ordinal of the source position in the input
    pub position_index: u64,
    pub context: PositionContext,
    pub alt_allele: Option<String>,
    pub variant: VariantEntry,
}

impl PositionEntry {
    /// Split a position into one unit per variant
    ///
    /// A variant carries its own `altAllele`; non-annotatable alleles such as
    /// `*` get no variant entry, so `altAlleles` is only consulted by index
    /// when a variant lacks one. A position without a
    /// `variants` array yields one bare unit per alternate allele, and a
    /// position with neither yields a single unit without an alternate allele
    /// so that it is counted (and rejected) downstream instead of vanishing.
    pub fn into_units(self, position_index: u64) -> Vec<RawAnnotationUnit> {
        let PositionEntry {
            chromosome,
            position,
            ref_allele,
            alt_alleles,
            filters,
            mapping_quality,
            cytogenetic_band,
            variants,
        } = self;

        let context = PositionContext {
            chromosome,
            position,
            ref_allele,
            filters,
            mapping_quality,
            cytogenetic_band,
        };

        match variants {
            Some(variants) if !variants.is_empty() => variants
                .into_iter()
                .enumerate()
                .map(|(i, variant)| RawAnnotationUnit {
                    position_index,
                    context: context.clone(),
                    alt_allele: variant
                        .alt_allele
                        .clone()
                        .or_else(|| alt_alleles.get(i).cloned()),
                    variant,
                })
                .collect(),
            _ if !alt_alleles.is_empty() => alt_alleles
                .into_iter()
                .map(|alt| RawAnnotationUnit {
                    position_index,
                    context: context.clone(),
                    alt_allele: Some(alt),
                    variant: VariantEntry::default(),
                })
                .collect(),
            _ => vec![RawAnnotationUnit {
                position_index,
                context,
                alt_allele: None,
                variant: VariantEntry::default(),
            }],
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_position_with_variants_expands_in_order() {
        let entry: PositionEntry = serde_json::from_value(json!({
            "chromosome": "chr1",
            "position": 12345,
            "refAllele": "A",
            "altAlleles": ["G", "T"],
            "variants": [
                {"altAllele": "G", "gnomad": {"allAf": 0.1}},
                {"altAllele": "T", "phylopScore": 1.5}
            ]
        }))
        .unwrap();

        let units = entry.into_units(4);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].alt_allele.as_deref(), Some("G"));
        assert_eq!(units[1].alt_allele.as_deref(), Some("T"));
        assert_eq!(units[1].position_index, 4);
        assert!(units[0].variant.annotations.contains_key("gnomad"));
        assert!(units[1].variant.annotations.contains_key("phylopScore"));
    }

    #[test]
    fn test_variant_allele_wins_over_alt_allele_index() {
        // no variant entry is emitted for the spanning deletion
        let entry: PositionEntry = serde_json::from_value(json!({
            "chromosome": "chr1",
            "position": 100,
            "refAllele": "A",
            "altAlleles": ["*", "T"],
            "variants": [{"altAllele": "T", "transcripts": [{"hgnc": "BRCA1"}]}]
        }))
        .unwrap();

        let units = entry.into_units(0);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].alt_allele.as_deref(), Some("T"));
    }

    #[test]
    fn test_variant_without_allele_falls_back_to_index() {
        let entry: PositionEntry = serde_json::from_value(json!({
            "chromosome": "chr1", "position": 100, "refAllele": "A",
            "altAlleles": ["C", "T"], "variants": [{}, {}]
        }))
        .unwrap();
        let alts: Vec<_> = entry
            .into_units(0)
            .into_iter()
            .map(|u| u.alt_allele)
            .collect();
        assert_eq!(alts, vec![Some("C".to_string()), Some("T".to_string())]);
    }

    #[test]
    fn test_position_without_variants_uses_alt_alleles() {
        let entry: PositionEntry = serde_json::from_value(json!({
            "chromosome": "2", "position": 5, "refAllele": "C", "altAlleles": ["A"]
        }))
        .unwrap();
        let units = entry.into_units(0);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].alt_allele.as_deref(), Some("A"));
        assert!(units[0].variant.transcripts.is_empty());
    }

    #[test]
    fn test_empty_position_still_yields_a_unit() {
        let entry: PositionEntry = serde_json::from_value(json!({"chromosome": "2"})).unwrap();
        let units = entry.into_units(9);
        assert_eq!(units.len(), 1);
        assert!(units[0].alt_allele.is_none());
    }

    #[test]
    fn test_dbsnp_and_clinvar_shapes() {
        let bare: DbSnp = serde_json::from_value(json!(["rs1", "rs2"])).unwrap();
        let wrapped: DbSnp = serde_json::from_value(json!({"ids": ["rs3"]})).unwrap();
        assert_eq!(bare.ids(), ["rs1", "rs2"]);
        assert_eq!(wrapped.ids(), ["rs3"]);

        let one: OneOrMany<ClinvarEntry> =
            serde_json::from_value(json!({"accession": "RCV1", "version": 2})).unwrap();
        let many: OneOrMany<ClinvarEntry> =
            serde_json::from_value(json!([{"accession": "RCV1"}, {"accession": "RCV2"}])).unwrap();
        assert_eq!(one.iter().count(), 1);
        assert_eq!(many.iter().count(), 2);
    }
}
