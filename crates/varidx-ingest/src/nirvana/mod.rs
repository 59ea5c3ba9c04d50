//! Nirvana annotation input
//!
//! - `model`: serde shapes for positions, variants and transcripts
//! - `reader`: streaming decoder producing one unit per variant

pub mod model;
pub mod reader;

pub use model::{PositionContext, RawAnnotationUnit, TranscriptEntry, VariantEntry};
pub use reader::{AnnotationStreamParser, InputLayout};
