//! Atoll core — pure domain logic shared by the server and CLI.
//!
//! Everything here is deterministic and store-free: entity types, the
//! scope resolver that turns locators into `(project_id, dataset)` pairs,
//! content hashing and chunk identity, reciprocal rank fusion, and the
//! auto-scope config file.

pub mod autoscope;
pub mod fusion;
pub mod hash;
pub mod scope;
pub mod types;
