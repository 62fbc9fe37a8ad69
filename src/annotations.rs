//! Annotation metadata extracted from method attributes.

use crate::bytes::ByteReader;
use crate::constant_pool::ConstantPool;
use crate::error::{InstrumentError, Result};

pub(crate) const RUNTIME_VISIBLE_ANNOTATIONS: &str = "RuntimeVisibleAnnotations";
pub(crate) const RUNTIME_INVISIBLE_ANNOTATIONS: &str = "RuntimeInvisibleAnnotations";
pub(crate) const RUNTIME_VISIBLE_PARAMETER_ANNOTATIONS: &str = "RuntimeVisibleParameterAnnotations";
pub(crate) const RUNTIME_INVISIBLE_PARAMETER_ANNOTATIONS: &str =
    "RuntimeInvisibleParameterAnnotations";
pub(crate) const RUNTIME_VISIBLE_TYPE_ANNOTATIONS: &str = "RuntimeVisibleTypeAnnotations";
pub(crate) const RUNTIME_INVISIBLE_TYPE_ANNOTATIONS: &str = "RuntimeInvisibleTypeAnnotations";
pub(crate) const DEPRECATED: &str = "Deprecated";

/// Descriptor recorded for the legacy `Deprecated` attribute.
pub(crate) const DEPRECATED_DESCRIPTOR: &str = "Ljava/lang/Deprecated;";

const TARGET_METHOD_RETURN: u8 = 0x14;
const TARGET_METHOD_FORMAL_PARAMETER: u8 = 0x16;

/// Annotation type descriptors attached to a method, its return type and its parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MethodAnnotations {
    /// Method-level and return-type annotations; both describe the return slot.
    pub return_annotations: Vec<String>,
    /// Parameter annotations in the attribute's own index space.
    pub parameter_annotations: Vec<Vec<String>>,
    /// `num_parameters` declared by a parameter-annotation attribute, when one is present.
    pub declared_parameter_count: Option<usize>,
}

impl MethodAnnotations {
    /// Whether the method carries any annotation metadata at all.
    pub fn is_empty(&self) -> bool {
        self.return_annotations.is_empty()
            && self.declared_parameter_count.is_none()
            && self.parameter_annotations.iter().all(|list| list.is_empty())
    }

    /// Annotations of the parameter with the given attribute index.
    pub fn parameter(&self, index: usize) -> &[String] {
        self.parameter_annotations
            .get(index)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    /// Record one annotation-bearing attribute. Unrelated attributes are ignored.
    pub(crate) fn absorb(&mut self, name: &str, info: &[u8], pool: &ConstantPool) -> Result<()> {
        match name {
            RUNTIME_VISIBLE_ANNOTATIONS | RUNTIME_INVISIBLE_ANNOTATIONS => {
                let names = parse_annotations(info, pool)?;
                self.return_annotations.extend(names);
            }
            RUNTIME_VISIBLE_PARAMETER_ANNOTATIONS | RUNTIME_INVISIBLE_PARAMETER_ANNOTATIONS => {
                let parameters = parse_parameter_annotations(info, pool)?;
                let declared = self.declared_parameter_count.unwrap_or(0);
                self.declared_parameter_count = Some(declared.max(parameters.len()));
                for (index, names) in parameters.into_iter().enumerate() {
                    self.parameter_slot(index).extend(names);
                }
            }
            RUNTIME_VISIBLE_TYPE_ANNOTATIONS | RUNTIME_INVISIBLE_TYPE_ANNOTATIONS => {
                for (target, name) in parse_type_annotations(info, pool)? {
                    match target {
                        TypeTarget::Return => self.return_annotations.push(name),
                        TypeTarget::FormalParameter(index) => {
                            self.parameter_slot(index as usize).push(name)
                        }
                    }
                }
            }
            DEPRECATED => {
                if !self
                    .return_annotations
                    .iter()
                    .any(|existing| existing == DEPRECATED_DESCRIPTOR)
                {
                    self.return_annotations
                        .push(DEPRECATED_DESCRIPTOR.to_string());
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn parameter_slot(&mut self, index: usize) -> &mut Vec<String> {
        if self.parameter_annotations.len() <= index {
            self.parameter_annotations.resize_with(index + 1, Vec::new);
        }
        &mut self.parameter_annotations[index]
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TypeTarget {
    Return,
    FormalParameter(u8),
}

fn parse_annotations(info: &[u8], pool: &ConstantPool) -> Result<Vec<String>> {
    let mut reader = ByteReader::new(info);
    let count = reader.read_u16()?;
    let mut names = Vec::with_capacity(count as usize);
    for _ in 0..count {
        names.push(read_annotation(&mut reader, pool)?);
    }
    ensure_consumed(&reader, "annotations")?;
    Ok(names)
}

fn parse_parameter_annotations(info: &[u8], pool: &ConstantPool) -> Result<Vec<Vec<String>>> {
    let mut reader = ByteReader::new(info);
    let parameters = reader.read_u8()?;
    let mut result = Vec::with_capacity(parameters as usize);
    for _ in 0..parameters {
        let count = reader.read_u16()?;
        let mut names = Vec::with_capacity(count as usize);
        for _ in 0..count {
            names.push(read_annotation(&mut reader, pool)?);
        }
        result.push(names);
    }
    ensure_consumed(&reader, "parameter annotations")?;
    Ok(result)
}

/// Type annotations on the method return or a formal parameter, without a type path.
fn parse_type_annotations(info: &[u8], pool: &ConstantPool) -> Result<Vec<(TypeTarget, String)>> {
    let mut reader = ByteReader::new(info);
    let count = reader.read_u16()?;
    let mut result = Vec::new();
    for _ in 0..count {
        let target_type = reader.read_u8()?;
        let target = match target_type {
            TARGET_METHOD_RETURN => Some(TypeTarget::Return),
            TARGET_METHOD_FORMAL_PARAMETER => Some(TypeTarget::FormalParameter(reader.read_u8()?)),
            _ => {
                skip_target_info(&mut reader, target_type)?;
                None
            }
        };
        let path_length = reader.read_u8()?;
        reader.skip(path_length as usize * 2)?;
        let name = read_annotation(&mut reader, pool)?;
        if let Some(target) = target {
            if path_length == 0 {
                result.push((target, name));
            }
        }
    }
    ensure_consumed(&reader, "type annotations")?;
    Ok(result)
}

fn skip_target_info(reader: &mut ByteReader<'_>, target_type: u8) -> Result<()> {
    match target_type {
        0x00 | 0x01 | 0x16 => reader.skip(1),
        0x10 | 0x17 | 0x42..=0x46 => reader.skip(2),
        0x11 | 0x12 => reader.skip(2),
        0x13..=0x15 => Ok(()),
        0x40 | 0x41 => {
            let entries = reader.read_u16()?;
            reader.skip(entries as usize * 6)
        }
        0x47..=0x4b => reader.skip(3),
        _ => Err(InstrumentError::malformed(format!(
            "unknown type annotation target 0x{target_type:02x}"
        ))),
    }
}

/// Read an annotation structure and return its type descriptor.
fn read_annotation(reader: &mut ByteReader<'_>, pool: &ConstantPool) -> Result<String> {
    let type_index = reader.read_u16()?;
    let descriptor = pool.utf8(type_index)?;
    let pairs = reader.read_u16()?;
    for _ in 0..pairs {
        reader.skip(2)?;
        skip_element_value(reader, pool)?;
    }
    Ok(descriptor)
}

fn skip_element_value(reader: &mut ByteReader<'_>, pool: &ConstantPool) -> Result<()> {
    let tag = reader.read_u8()?;
    match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => reader.skip(2),
        b'e' => reader.skip(4),
        b'@' => read_annotation(reader, pool).map(|_| ()),
        b'[' => {
            let count = reader.read_u16()?;
            for _ in 0..count {
                skip_element_value(reader, pool)?;
            }
            Ok(())
        }
        _ => Err(InstrumentError::malformed(format!(
            "unknown annotation element tag {:?}",
            tag as char
        ))),
    }
}

fn ensure_consumed(reader: &ByteReader<'_>, what: &str) -> Result<()> {
    if reader.is_empty() {
        Ok(())
    } else {
        Err(InstrumentError::malformed(format!(
            "{} trailing bytes in {what} attribute",
            reader.remaining()
        )))
    }
}
