//! Injects runtime not-null checks into compiled JVM class files.
//!
//! [`instrument`] is the pure single-class entry point. [`instrument_directory`] drives it over
//! a directory of class files and rewrites the ones that changed.

mod annotations;
mod bytes;
mod code;
mod config;
mod constant_pool;
mod dataflow;
mod descriptor;
mod engine;
mod error;
mod ir;
mod opcodes;
mod reader;
mod rewriter;
mod scan;
mod selector;
mod stackmap;
pub mod telemetry;
#[cfg(test)]
mod test_harness;
#[cfg(test)]
mod test_support;
mod writer;

pub use config::{ClassPattern, Configuration, DEFAULT_NOT_NULL, DEFAULT_NULLABLE, Settings};
pub use engine::{InstrumentationResult, UnmodifiedReason, instrument};
pub use error::InstrumentError;
pub use scan::{DriverReport, instrument_directory};
