//! Flattened variant document
//!
//! One [`FlattenedVariantRecord`] per variant, serialised with a fixed field
//! order. Population and conservation fields are declared through
//! [`annotation_fields!`], which keeps the output field, its source path in
//! the raw annotation, and its table column type in a single row of a table.

use rusqlite::types::ToSql;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A scalar that can be read out of raw annotation JSON and stored in a
/// typed table column
pub trait AnnotationValue: Sized {
    const SQL_TYPE: &'static str;

    /// `None` when the JSON value has another type
    fn from_json(value: &Value) -> Option<Self>;
}

impl AnnotationValue for f64 {
    const SQL_TYPE: &'static str = "REAL";

    fn from_json(value: &Value) -> Option<Self> {
        value.as_f64().map(positive_zero)
    }
}

impl AnnotationValue for i64 {
    const SQL_TYPE: &'static str = "INTEGER";

    fn from_json(value: &Value) -> Option<Self> {
        value.as_i64()
    }
}

impl AnnotationValue for bool {
    const SQL_TYPE: &'static str = "INTEGER";

    fn from_json(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

/// SQLite stores integral REALs as integers, which turns `-0.0` into `0.0`
pub fn positive_zero(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

/// Follow `path` through nested objects; absent keys stay absent
pub fn lookup<T: AnnotationValue>(annotations: &BTreeMap<String, Value>, path: &[&str]) -> Option<T> {
    let (first, rest) = path.split_first()?;
    let mut value = annotations.get(*first)?;
    for key in rest {
        value = value.get(key)?;
    }
    T::from_json(value)
}

/// Declare a block of optional annotation fields
///
/// Each line reads `field: type = ["source", "path"]`. The macro emits the
/// struct, its `MAPPING` table, extraction from raw annotations, and the
/// column list used by the batch table.
macro_rules! annotation_fields {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $field:ident : $ty:ty = [ $($path:literal),+ ] ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            $( pub $field: Option<$ty>, )*
        }

        impl $name {
            /// Output field name and source path for every field
            pub const MAPPING: &'static [(&'static str, &'static [&'static str])] = &[
                $( (stringify!($field), &[ $($path),+ ]), )*
            ];

            /// Column name and SQLite type for every field
            pub const COLUMNS: &'static [(&'static str, &'static str)] = &[
                $( (stringify!($field), <$ty as AnnotationValue>::SQL_TYPE), )*
            ];

            pub fn extract(annotations: &BTreeMap<String, Value>) -> Self {
                Self {
                    $( $field: lookup::<$ty>(annotations, &[ $($path),+ ]), )*
                }
            }

            /// Column values in `COLUMNS` order
            pub fn sql_values(&self) -> Vec<&dyn ToSql> {
                vec![ $( &self.$field as &dyn ToSql, )* ]
            }

            pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
                Ok(Self {
                    $( $field: row.get(stringify!($field))?, )*
                })
            }
        }
    };
}

annotation_fields! {
    /// Per-base conservation scores
    pub struct ConservationScores {
        phylop_score: f64 = ["phylopScore"],
        phylop_primate_score: f64 = ["phyloPPrimateScore"],
        gerp_score: f64 = ["gerpScore"],
        dann_score: f64 = ["dannScore"],
    }
}

annotation_fields! {
    /// gnomAD genome/exome and TOPMed allele frequencies and counts
    pub struct PopulationFrequencies {
        gnomad_af: f64 = ["gnomad", "allAf"],
        gnomad_ac: i64 = ["gnomad", "allAc"],
        gnomad_an: i64 = ["gnomad", "allAn"],
        gnomad_hc: i64 = ["gnomad", "allHc"],
        gnomad_afr_af: f64 = ["gnomad", "afrAf"],
        gnomad_amr_af: f64 = ["gnomad", "amrAf"],
        gnomad_eas_af: f64 = ["gnomad", "easAf"],
        gnomad_fin_af: f64 = ["gnomad", "finAf"],
        gnomad_nfe_af: f64 = ["gnomad", "nfeAf"],
        gnomad_asj_af: f64 = ["gnomad", "asjAf"],
        gnomad_sas_af: f64 = ["gnomad", "sasAf"],
        gnomad_oth_af: f64 = ["gnomad", "othAf"],
        gnomad_failed_filter: bool = ["gnomad", "failedFilter"],
        gnomad_exome_af: f64 = ["gnomad-exome", "allAf"],
        gnomad_exome_ac: i64 = ["gnomad-exome", "allAc"],
        gnomad_exome_an: i64 = ["gnomad-exome", "allAn"],
        gnomad_exome_hc: i64 = ["gnomad-exome", "allHc"],
        gnomad_exome_failed_filter: bool = ["gnomad-exome", "failedFilter"],
        topmed_af: f64 = ["topmed", "allAf"],
        topmed_ac: i64 = ["topmed", "allAc"],
        topmed_an: i64 = ["topmed", "allAn"],
        topmed_hc: i64 = ["topmed", "allHc"],
        topmed_failed_filter: bool = ["topmed", "failedFilter"],
    }
}

impl PopulationFrequencies {
    /// Highest global AF across gnomAD genomes and exomes
    pub fn max_gnomad_af(&self) -> Option<f64> {
        max_defined([self.gnomad_af, self.gnomad_exome_af])
    }

    /// Highest gnomAD sub-population AF
    pub fn max_pop_af(&self) -> Option<f64> {
        max_defined([
            self.gnomad_afr_af,
            self.gnomad_amr_af,
            self.gnomad_eas_af,
            self.gnomad_fin_af,
            self.gnomad_nfe_af,
            self.gnomad_asj_af,
            self.gnomad_sas_af,
            self.gnomad_oth_af,
        ])
    }
}

fn max_defined<const N: usize>(values: [Option<f64>; N]) -> Option<f64> {
    values.into_iter().flatten().reduce(f64::max)
}

/// Variant class derived from allele lengths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariantType {
    #[serde(rename = "SNV")]
    Snv,
    #[serde(rename = "insertion")]
    Insertion,
    #[serde(rename = "deletion")]
    Deletion,
    #[serde(rename = "complex")]
    Complex,
}

impl VariantType {
    /// `-` is the engine's spelling of an empty allele
    pub fn classify(reference: &str, alternate: &str) -> Self {
        let allele_len = |allele: &str| if allele == "-" { 0 } else { allele.len() };
        match (allele_len(reference), allele_len(alternate)) {
            (1, 1) => VariantType::Snv,
            (r, a) if a > r => VariantType::Insertion,
            (r, a) if a < r => VariantType::Deletion,
            _ => VariantType::Complex,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VariantType::Snv => "SNV",
            VariantType::Insertion => "insertion",
            VariantType::Deletion => "deletion",
            VariantType::Complex => "complex",
        }
    }
}

impl fmt::Display for VariantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SNV" => Ok(VariantType::Snv),
            "insertion" => Ok(VariantType::Insertion),
            "deletion" => Ok(VariantType::Deletion),
            "complex" => Ok(VariantType::Complex),
            other => Err(format!("unknown variant type '{other}'")),
        }
    }
}

/// Allele-specific ClinVar assertions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinvarSummary {
    /// Germline classifications joined with `;`
    pub clinvar_significance: Option<String>,
    pub clinvar_variant_type: Option<String>,
    /// `accession.version` ids joined with `;`
    pub clinvar_id: Option<String>,
    pub clinvar_consensus: String,
}

/// The search document for one variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlattenedVariantRecord {
    pub vid: String,
    pub chromosome: String,
    pub position: i64,
    #[serde(rename = "ref")]
    pub ref_allele: String,
    pub alt: String,
    pub variant_type: VariantType,
    pub hgvsg: Option<String>,
    pub begin: Option<i64>,
    pub end: Option<i64>,
    pub rsid: Option<String>,
    pub gene: Option<String>,
    pub genes: Vec<String>,
    pub canonical_transcript: Option<String>,
    pub n_transcripts: i64,
    pub all_consequences: Vec<String>,
    pub filters: Option<String>,
    pub mapping_quality: Option<f64>,
    pub fisher_strand_bias: Option<f64>,
    pub quality: Option<f64>,
    pub cytogenetic_band: Option<String>,
    #[serde(flatten)]
    pub conservation: ConservationScores,
    #[serde(flatten)]
    pub population: PopulationFrequencies,
    pub max_gnomad_af: Option<f64>,
    pub max_pop_af: Option<f64>,
    #[serde(flatten)]
    pub clinvar: ClinvarSummary,
}
