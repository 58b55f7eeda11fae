// (c) 2025 The cachegw authors

//! General utility code

pub mod io;
mod tracing;

pub use tracing::{setup_tracing, tracing_is_initialised};
