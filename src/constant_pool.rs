//! Constant pool with append-only, de-duplicating mutation.

use crate::bytes::{ByteReader, write_u16, write_u32};
use crate::error::{InstrumentError, Result};

mod tags {
    pub(super) const UTF8: u8 = 1;
    pub(super) const INTEGER: u8 = 3;
    pub(super) const FLOAT: u8 = 4;
    pub(super) const LONG: u8 = 5;
    pub(super) const DOUBLE: u8 = 6;
    pub(super) const CLASS: u8 = 7;
    pub(super) const STRING: u8 = 8;
    pub(super) const FIELDREF: u8 = 9;
    pub(super) const METHODREF: u8 = 10;
    pub(super) const INTERFACE_METHODREF: u8 = 11;
    pub(super) const NAME_AND_TYPE: u8 = 12;
    pub(super) const METHOD_HANDLE: u8 = 15;
    pub(super) const METHOD_TYPE: u8 = 16;
    pub(super) const DYNAMIC: u8 = 17;
    pub(super) const INVOKE_DYNAMIC: u8 = 18;
    pub(super) const MODULE: u8 = 19;
    pub(super) const PACKAGE: u8 = 20;
}

/// A single constant pool entry. UTF-8 entries keep their raw modified UTF-8 bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Constant {
    /// Index 0 and the second slot of Long/Double entries.
    Unusable,
    Utf8(Vec<u8>),
    Integer(u32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class(u16),
    String(u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
    NameAndType(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
    Dynamic(u16, u16),
    InvokeDynamic(u16, u16),
    Module(u16),
    Package(u16),
}

/// Field or method reference resolved to names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MemberRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ConstantPool {
    entries: Vec<Constant>,
}

const MAX_ENTRIES: usize = u16::MAX as usize;

impl ConstantPool {
    pub(crate) fn parse(reader: &mut ByteReader<'_>) -> Result<Self> {
        let count = reader.read_u16()? as usize;
        if count == 0 {
            return Err(InstrumentError::malformed("constant pool count is zero"));
        }
        let mut entries = Vec::with_capacity(count);
        entries.push(Constant::Unusable);
        while entries.len() < count {
            let tag = reader.read_u8()?;
            let entry = match tag {
                tags::UTF8 => {
                    let len = reader.read_u16()? as usize;
                    Constant::Utf8(reader.read_bytes(len)?.to_vec())
                }
                tags::INTEGER => Constant::Integer(reader.read_u32()?),
                tags::FLOAT => Constant::Float(reader.read_u32()?),
                tags::LONG | tags::DOUBLE => {
                    let high = reader.read_u32()? as u64;
                    let low = reader.read_u32()? as u64;
                    let value = (high << 32) | low;
                    if entries.len() + 1 >= count {
                        return Err(InstrumentError::malformed(
                            "8-byte constant overruns the constant pool",
                        ));
                    }
                    entries.push(if tag == tags::LONG {
                        Constant::Long(value)
                    } else {
                        Constant::Double(value)
                    });
                    entries.push(Constant::Unusable);
                    continue;
                }
                tags::CLASS => Constant::Class(reader.read_u16()?),
                tags::STRING => Constant::String(reader.read_u16()?),
                tags::FIELDREF => Constant::FieldRef(reader.read_u16()?, reader.read_u16()?),
                tags::METHODREF => Constant::MethodRef(reader.read_u16()?, reader.read_u16()?),
                tags::INTERFACE_METHODREF => {
                    Constant::InterfaceMethodRef(reader.read_u16()?, reader.read_u16()?)
                }
                tags::NAME_AND_TYPE => {
                    Constant::NameAndType(reader.read_u16()?, reader.read_u16()?)
                }
                tags::METHOD_HANDLE => Constant::MethodHandle(reader.read_u8()?, reader.read_u16()?),
                tags::METHOD_TYPE => Constant::MethodType(reader.read_u16()?),
                tags::DYNAMIC => Constant::Dynamic(reader.read_u16()?, reader.read_u16()?),
                tags::INVOKE_DYNAMIC => {
                    Constant::InvokeDynamic(reader.read_u16()?, reader.read_u16()?)
                }
                tags::MODULE => Constant::Module(reader.read_u16()?),
                tags::PACKAGE => Constant::Package(reader.read_u16()?),
                _ => {
                    return Err(InstrumentError::malformed(format!(
                        "unsupported constant pool tag {tag} at entry {}",
                        entries.len()
                    )));
                }
            };
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    pub(crate) fn write(&self, bytes: &mut Vec<u8>) {
        write_u16(bytes, self.entries.len() as u16);
        for entry in &self.entries {
            match entry {
                Constant::Unusable => {}
                Constant::Utf8(raw) => {
                    bytes.push(tags::UTF8);
                    write_u16(bytes, raw.len() as u16);
                    bytes.extend_from_slice(raw);
                }
                Constant::Integer(value) => {
                    bytes.push(tags::INTEGER);
                    write_u32(bytes, *value);
                }
                Constant::Float(value) => {
                    bytes.push(tags::FLOAT);
                    write_u32(bytes, *value);
                }
                Constant::Long(value) | Constant::Double(value) => {
                    let tag = if matches!(entry, Constant::Long(_)) {
                        tags::LONG
                    } else {
                        tags::DOUBLE
                    };
                    bytes.push(tag);
                    bytes.extend_from_slice(&value.to_be_bytes());
                }
                Constant::Class(index) => write_u16_entry(bytes, tags::CLASS, *index),
                Constant::String(index) => write_u16_entry(bytes, tags::STRING, *index),
                Constant::MethodType(index) => write_u16_entry(bytes, tags::METHOD_TYPE, *index),
                Constant::Module(index) => write_u16_entry(bytes, tags::MODULE, *index),
                Constant::Package(index) => write_u16_entry(bytes, tags::PACKAGE, *index),
                Constant::FieldRef(a, b) => write_pair_entry(bytes, tags::FIELDREF, *a, *b),
                Constant::MethodRef(a, b) => write_pair_entry(bytes, tags::METHODREF, *a, *b),
                Constant::InterfaceMethodRef(a, b) => {
                    write_pair_entry(bytes, tags::INTERFACE_METHODREF, *a, *b)
                }
                Constant::NameAndType(a, b) => {
                    write_pair_entry(bytes, tags::NAME_AND_TYPE, *a, *b)
                }
                Constant::Dynamic(a, b) => write_pair_entry(bytes, tags::DYNAMIC, *a, *b),
                Constant::InvokeDynamic(a, b) => {
                    write_pair_entry(bytes, tags::INVOKE_DYNAMIC, *a, *b)
                }
                Constant::MethodHandle(kind, index) => {
                    bytes.push(tags::METHOD_HANDLE);
                    bytes.push(*kind);
                    write_u16(bytes, *index);
                }
            }
        }
    }

    /// Empty pool holding only the reserved index 0.
    #[cfg(test)]
    pub(crate) fn empty() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, index: u16) -> Result<&Constant> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(InstrumentError::malformed(format!(
                "invalid constant pool index {index}"
            ))),
            Some(entry) => Ok(entry),
        }
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::Utf8(raw) => decode_modified_utf8(raw),
            _ => Err(InstrumentError::malformed(format!(
                "constant pool entry {index} is not UTF-8"
            ))),
        }
    }

    pub(crate) fn class_name(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::Class(name_index) => self.utf8(*name_index),
            _ => Err(InstrumentError::malformed(format!(
                "constant pool entry {index} is not a class"
            ))),
        }
    }

    pub(crate) fn name_and_type(&self, index: u16) -> Result<(String, String)> {
        match self.get(index)? {
            Constant::NameAndType(name, descriptor) => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            _ => Err(InstrumentError::malformed(format!(
                "constant pool entry {index} is not a name-and-type"
            ))),
        }
    }

    /// Resolve a field, method, or interface method reference.
    pub(crate) fn member_ref(&self, index: u16) -> Result<MemberRef> {
        let (class_index, name_and_type) = match self.get(index)? {
            Constant::FieldRef(class, nat)
            | Constant::MethodRef(class, nat)
            | Constant::InterfaceMethodRef(class, nat) => (*class, *nat),
            _ => {
                return Err(InstrumentError::malformed(format!(
                    "constant pool entry {index} is not a member reference"
                )));
            }
        };
        let (name, descriptor) = self.name_and_type(name_and_type)?;
        Ok(MemberRef {
            owner: self.class_name(class_index)?,
            name,
            descriptor,
        })
    }

    /// Descriptor of an invokedynamic or dynamic constant call site.
    pub(crate) fn dynamic_descriptor(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::InvokeDynamic(_, nat) | Constant::Dynamic(_, nat) => {
                Ok(self.name_and_type(*nat)?.1)
            }
            _ => Err(InstrumentError::malformed(format!(
                "constant pool entry {index} is not a dynamic call site"
            ))),
        }
    }

    pub(crate) fn utf8_index(&mut self, value: &str) -> Result<u16> {
        let raw = encode_modified_utf8(value);
        if raw.len() > u16::MAX as usize {
            return Err(overflow("UTF-8 constant longer than 65535 bytes"));
        }
        if let Some(index) = self.position(|entry| matches!(entry, Constant::Utf8(existing) if *existing == raw)) {
            return Ok(index);
        }
        self.push(Constant::Utf8(raw))
    }

    pub(crate) fn class_index(&mut self, internal_name: &str) -> Result<u16> {
        let name = self.utf8_index(internal_name)?;
        self.find_or_push(Constant::Class(name))
    }

    pub(crate) fn string_index(&mut self, value: &str) -> Result<u16> {
        let utf8 = self.utf8_index(value)?;
        self.find_or_push(Constant::String(utf8))
    }

    pub(crate) fn name_and_type_index(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name = self.utf8_index(name)?;
        let descriptor = self.utf8_index(descriptor)?;
        self.find_or_push(Constant::NameAndType(name, descriptor))
    }

    pub(crate) fn method_ref_index(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16> {
        let class = self.class_index(owner)?;
        let name_and_type = self.name_and_type_index(name, descriptor)?;
        self.find_or_push(Constant::MethodRef(class, name_and_type))
    }

    #[cfg(test)]
    pub(crate) fn field_ref_index(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16> {
        let class = self.class_index(owner)?;
        let name_and_type = self.name_and_type_index(name, descriptor)?;
        self.find_or_push(Constant::FieldRef(class, name_and_type))
    }

    fn find_or_push(&mut self, constant: Constant) -> Result<u16> {
        if let Some(index) = self.position(|entry| *entry == constant) {
            return Ok(index);
        }
        self.push(constant)
    }

    fn position(&self, predicate: impl Fn(&Constant) -> bool) -> Option<u16> {
        self.entries
            .iter()
            .position(predicate)
            .map(|index| index as u16)
    }

    fn push(&mut self, constant: Constant) -> Result<u16> {
        if self.entries.len() >= MAX_ENTRIES {
            return Err(overflow("constant pool exceeds 65535 entries"));
        }
        self.entries.push(constant);
        Ok((self.entries.len() - 1) as u16)
    }
}

fn overflow(reason: &str) -> InstrumentError {
    InstrumentError::invariant("<constant pool>", reason)
}

fn write_u16_entry(bytes: &mut Vec<u8>, tag: u8, index: u16) {
    bytes.push(tag);
    write_u16(bytes, index);
}

fn write_pair_entry(bytes: &mut Vec<u8>, tag: u8, first: u16, second: u16) {
    bytes.push(tag);
    write_u16(bytes, first);
    write_u16(bytes, second);
}

/// Decode the JVM's modified UTF-8 (CESU-8 with a two-byte NUL).
pub(crate) fn decode_modified_utf8(raw: &[u8]) -> Result<String> {
    let mut units = Vec::with_capacity(raw.len());
    let mut index = 0;
    while index < raw.len() {
        let byte = raw[index];
        let unit = if byte & 0x80 == 0 {
            index += 1;
            byte as u16
        } else if byte & 0xe0 == 0xc0 {
            let next = continuation(raw, index + 1)?;
            index += 2;
            (((byte & 0x1f) as u16) << 6) | next
        } else if byte & 0xf0 == 0xe0 {
            let second = continuation(raw, index + 1)?;
            let third = continuation(raw, index + 2)?;
            index += 3;
            (((byte & 0x0f) as u16) << 12) | (second << 6) | third
        } else {
            return Err(InstrumentError::malformed(format!(
                "invalid modified UTF-8 lead byte 0x{byte:02x}"
            )));
        };
        units.push(unit);
    }
    String::from_utf16(&units)
        .map_err(|_| InstrumentError::malformed("unpaired surrogate in modified UTF-8"))
}

fn continuation(raw: &[u8], index: usize) -> Result<u16> {
    match raw.get(index) {
        Some(byte) if byte & 0xc0 == 0x80 => Ok((byte & 0x3f) as u16),
        _ => Err(InstrumentError::malformed(
            "truncated modified UTF-8 sequence",
        )),
    }
}

pub(crate) fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut raw = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => raw.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                raw.push(0xc0 | (unit >> 6) as u8);
                raw.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                raw.push(0xe0 | (unit >> 12) as u8);
                raw.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                raw.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    raw
}
