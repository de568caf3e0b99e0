//! Embedding artifacts: the matrices, the image index and the offline builder
//! that produces them.
//!
//! # Architecture
//!
//! - `matrix`: Dense embedding matrix and its checksummed binary file format
//! - `artifacts`: The persisted artifact set with its row-alignment checks
//! - `builder`: Offline index builder (catalog -> artifacts)

mod artifacts;
mod builder;
mod matrix;

pub use artifacts::{Artifacts, ImageIndexEntry, ProductRef, PRODUCTS_FILE};
pub use builder::IndexBuilder;
pub use matrix::EmbeddingMatrix;
