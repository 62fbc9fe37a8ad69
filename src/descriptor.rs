use std::str::FromStr;

use jdescriptor::{MethodDescriptor, TypeDescriptor};

use crate::error::{InstrumentError, Result};

/// Verifier-relevant shape of a declared type.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueType {
    Void,
    Primitive,
    /// `long` or `double`, occupying two local/stack slots.
    WidePrimitive,
    Object,
    Array,
}

impl ValueType {
    fn of(ty: &TypeDescriptor) -> Self {
        match ty {
            TypeDescriptor::Void => ValueType::Void,
            TypeDescriptor::Long | TypeDescriptor::Double => ValueType::WidePrimitive,
            TypeDescriptor::Object(_) => ValueType::Object,
            TypeDescriptor::Array(_, _) => ValueType::Array,
            _ => ValueType::Primitive,
        }
    }

    pub fn is_reference(self) -> bool {
        matches!(self, ValueType::Object | ValueType::Array)
    }

    pub(crate) fn slot_size(self) -> u16 {
        match self {
            ValueType::Void => 0,
            ValueType::WidePrimitive => 2,
            _ => 1,
        }
    }
}

/// Parsed method descriptor with per-parameter local-variable layout.
#[derive(Clone, Debug)]
pub(crate) struct MethodSignature {
    pub(crate) parameters: Vec<ValueType>,
    pub(crate) return_type: ValueType,
}

impl MethodSignature {
    pub(crate) fn parse(descriptor: &str) -> Result<Self> {
        let parsed = MethodDescriptor::from_str(descriptor).map_err(|err| {
            InstrumentError::malformed(format!("invalid method descriptor {descriptor}: {err}"))
        })?;
        Ok(Self {
            parameters: parsed.parameter_types().iter().map(ValueType::of).collect(),
            return_type: ValueType::of(parsed.return_type()),
        })
    }

    /// Local variable slot of each parameter, counting `this` for instance methods.
    pub(crate) fn parameter_slots(&self, is_static: bool) -> Vec<u16> {
        let mut slot: u16 = if is_static { 0 } else { 1 };
        self.parameters
            .iter()
            .map(|param| {
                let current = slot;
                slot += param.slot_size();
                current
            })
            .collect()
    }

    /// Operand stack slots consumed by the arguments.
    pub(crate) fn argument_size(&self) -> u16 {
        self.parameters.iter().map(|param| param.slot_size()).sum()
    }

    pub(crate) fn return_size(&self) -> u16 {
        self.return_type.slot_size()
    }
}

/// Field descriptor of each parameter, such as `I`, `Ljava/lang/String;` or `[[J`.
pub(crate) fn parameter_descriptors(descriptor: &str) -> Result<Vec<&str>> {
    let invalid = || InstrumentError::malformed(format!("invalid method descriptor {descriptor}"));
    let (parameters, _) = descriptor
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .ok_or_else(invalid)?;
    let mut result = Vec::new();
    let mut start = 0;
    let mut index = 0;
    while index < parameters.len() {
        match parameters.as_bytes()[index] {
            b'[' => {
                index += 1;
                continue;
            }
            b'L' => index += parameters[index..].find(';').ok_or_else(invalid)?,
            _ => {}
        }
        index += 1;
        result.push(&parameters[start..index]);
        start = index;
    }
    if start != parameters.len() {
        return Err(invalid());
    }
    Ok(result)
}

/// Operand stack size of a field descriptor.
pub(crate) fn field_size(descriptor: &str) -> u16 {
    match descriptor.as_bytes().first() {
        Some(b'J') | Some(b'D') => 2,
        _ => 1,
    }
}

/// Convert a dotted or slashed type name into a field descriptor (`Lpkg/Name;`).
pub(crate) fn annotation_descriptor(name: &str) -> String {
    if name.starts_with('L') && name.ends_with(';') {
        return name.to_string();
    }
    format!("L{};", name.replace('.', "/"))
}
