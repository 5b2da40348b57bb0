//! Assembly metadata
//!
//! The model is a small view of CLI metadata: the assemblies, modules, types, methods,
//! references, and heaps that span injection reads or writes. Method bodies are kept as raw IL
//! ([`RawBody`]) until something decides to rewrite them, and everything the model doesn't
//! cover stays in the loaded image, so untouched parts of an assembly are written back
//! byte-for-byte.
//!
//! [0]: ECMA-335, Partition II, 22-25

mod flags;
mod heaps;
mod image;
mod model;
pub mod pe;
mod raw_body;
pub mod root;
mod signature;
pub mod tables;
mod token;

pub use flags::*;
pub use heaps::*;
pub use model::*;
pub use raw_body::*;
pub use signature::*;
pub use tables::{RowCounts, TableStream};
pub use token::*;
