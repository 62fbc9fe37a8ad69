use tracing::{debug, trace};

use crate::config::Configuration;
use crate::error::Result;
use crate::reader::{ParsedClass, parse_class_bytes};
use crate::rewriter::rewrite_method;
use crate::selector::{ClassSelection, select};
use crate::writer::write_class;

/// Why a class was left as it was.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnmodifiedReason {
    /// No method carries a check.
    NoSelections,
    /// The class matched an exclusion pattern.
    Excluded,
    /// Class file version predates annotations.
    UnsupportedVersion(u16),
}

/// Outcome of instrumenting one class file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstrumentationResult {
    Unmodified(UnmodifiedReason),
    Modified(Vec<u8>),
}

/// Instrument a single class file held in memory.
///
/// Classes without any selected method are reported as unmodified and never re-serialized, so
/// their bytes stay exactly as read. Errors leave the input untouched as well; callers decide
/// whether to skip the class ([`InstrumentError::MalformedClassFile`]) or abort the run
/// ([`InstrumentError::InvariantViolation`]).
///
/// [`InstrumentError::MalformedClassFile`]: crate::InstrumentError::MalformedClassFile
/// [`InstrumentError::InvariantViolation`]: crate::InstrumentError::InvariantViolation
pub fn instrument(bytes: &[u8], config: &Configuration) -> Result<InstrumentationResult> {
    let mut class = match parse_class_bytes(bytes)? {
        ParsedClass::Unsupported { major_version } => {
            trace!(major_version, "class file version predates annotations");
            return Ok(InstrumentationResult::Unmodified(
                UnmodifiedReason::UnsupportedVersion(major_version),
            ));
        }
        ParsedClass::Model(class) => class,
    };

    let selections = match select(&class, config)? {
        ClassSelection::Excluded => {
            debug!(class = %class.name, "class excluded");
            return Ok(InstrumentationResult::Unmodified(UnmodifiedReason::Excluded));
        }
        ClassSelection::Methods(selections) if selections.is_empty() => {
            trace!(class = %class.name, "no checks selected");
            return Ok(InstrumentationResult::Unmodified(
                UnmodifiedReason::NoSelections,
            ));
        }
        ClassSelection::Methods(selections) => selections,
    };

    for selection in &selections {
        rewrite_method(&mut class, selection)?;
    }
    debug!(class = %class.name, methods = selections.len(), "class instrumented");
    Ok(InstrumentationResult::Modified(write_class(&class)))
}
