//! StackMapTable frames (JVMS 4.7.4) with absolute offsets.

use crate::bytes::{ByteReader, write_u16};
use crate::error::{InstrumentError, Result};

pub(crate) const STACK_MAP_TABLE: &str = "StackMapTable";

/// VerificationTypeInfo as defined in JVMS 4.7.4.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Constant pool index of a CONSTANT_Class entry.
    Object(u16),
    /// Bytecode offset of the `new` instruction that created the value.
    Uninitialized(u16),
}

impl VerificationType {
    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let tag = reader.read_u8()?;
        let value = match tag {
            0 => VerificationType::Top,
            1 => VerificationType::Integer,
            2 => VerificationType::Float,
            3 => VerificationType::Double,
            4 => VerificationType::Long,
            5 => VerificationType::Null,
            6 => VerificationType::UninitializedThis,
            7 => VerificationType::Object(reader.read_u16()?),
            8 => VerificationType::Uninitialized(reader.read_u16()?),
            _ => {
                return Err(InstrumentError::malformed(format!(
                    "unknown verification type tag {tag}"
                )));
            }
        };
        Ok(value)
    }

    fn write(&self, bytes: &mut Vec<u8>) {
        match self {
            VerificationType::Top => bytes.push(0),
            VerificationType::Integer => bytes.push(1),
            VerificationType::Float => bytes.push(2),
            VerificationType::Double => bytes.push(3),
            VerificationType::Long => bytes.push(4),
            VerificationType::Null => bytes.push(5),
            VerificationType::UninitializedThis => bytes.push(6),
            VerificationType::Object(index) => {
                bytes.push(7);
                write_u16(bytes, *index);
            }
            VerificationType::Uninitialized(offset) => {
                bytes.push(8);
                write_u16(bytes, *offset);
            }
        }
    }
}

/// Frame payload, relative to the previous frame where the JVMS says so.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Same,
    SameLocals1StackItem(VerificationType),
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

impl FrameKind {
    /// Operand stack declared by the frame.
    pub(crate) fn stack(&self) -> Vec<VerificationType> {
        match self {
            FrameKind::SameLocals1StackItem(item) => vec![item.clone()],
            FrameKind::Full { stack, .. } => stack.clone(),
            FrameKind::Same | FrameKind::Chop(_) | FrameKind::Append(_) => Vec::new(),
        }
    }
}

/// Locals of every frame in table order, starting from the method's implicit first frame.
pub(crate) fn absolute_locals(
    frames: &[StackMapFrame],
    initial: &[VerificationType],
) -> Result<Vec<Vec<VerificationType>>> {
    let mut current = initial.to_vec();
    let mut result = Vec::with_capacity(frames.len());
    for frame in frames {
        match &frame.kind {
            FrameKind::Same | FrameKind::SameLocals1StackItem(_) => {}
            FrameKind::Chop(count) => {
                let count = *count as usize;
                if count > current.len() {
                    return Err(InstrumentError::malformed(format!(
                        "frame at offset {} chops {count} of {} locals",
                        frame.offset,
                        current.len()
                    )));
                }
                current.truncate(current.len() - count);
            }
            FrameKind::Append(locals) => current.extend(locals.iter().cloned()),
            FrameKind::Full { locals, .. } => current = locals.clone(),
        }
        result.push(current.clone());
    }
    Ok(result)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StackMapFrame {
    pub(crate) offset: u32,
    pub(crate) kind: FrameKind,
}

impl StackMapFrame {
    /// Apply `remap` to every bytecode offset the frame carries.
    pub(crate) fn remap(&mut self, remap: &impl Fn(u32) -> Result<u32>) -> Result<()> {
        self.offset = remap(self.offset)?;
        let types: Vec<&mut VerificationType> = match &mut self.kind {
            FrameKind::Same | FrameKind::Chop(_) => Vec::new(),
            FrameKind::SameLocals1StackItem(item) => vec![item],
            FrameKind::Append(locals) => locals.iter_mut().collect(),
            FrameKind::Full { locals, stack } => locals.iter_mut().chain(stack.iter_mut()).collect(),
        };
        for ty in types {
            if let VerificationType::Uninitialized(offset) = ty {
                *offset = remap(*offset as u32)? as u16;
            }
        }
        Ok(())
    }
}

pub(crate) fn parse_stack_map_table(info: &[u8]) -> Result<Vec<StackMapFrame>> {
    let mut reader = ByteReader::new(info);
    let count = reader.read_u16()?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut previous: Option<u32> = None;
    for _ in 0..count {
        let frame_type = reader.read_u8()?;
        let (delta, kind) = match frame_type {
            0..=63 => (frame_type as u32, FrameKind::Same),
            64..=127 => (
                (frame_type - 64) as u32,
                FrameKind::SameLocals1StackItem(VerificationType::read(&mut reader)?),
            ),
            247 => {
                let delta = reader.read_u16()? as u32;
                (
                    delta,
                    FrameKind::SameLocals1StackItem(VerificationType::read(&mut reader)?),
                )
            }
            248..=250 => (reader.read_u16()? as u32, FrameKind::Chop(251 - frame_type)),
            251 => (reader.read_u16()? as u32, FrameKind::Same),
            252..=254 => {
                let delta = reader.read_u16()? as u32;
                let mut locals = Vec::new();
                for _ in 0..(frame_type - 251) {
                    locals.push(VerificationType::read(&mut reader)?);
                }
                (delta, FrameKind::Append(locals))
            }
            255 => {
                let delta = reader.read_u16()? as u32;
                let locals = read_types(&mut reader)?;
                let stack = read_types(&mut reader)?;
                (delta, FrameKind::Full { locals, stack })
            }
            _ => {
                return Err(InstrumentError::malformed(format!(
                    "reserved stack map frame type {frame_type}"
                )));
            }
        };
        let offset = match previous {
            None => delta,
            Some(previous) => previous + delta + 1,
        };
        previous = Some(offset);
        frames.push(StackMapFrame { offset, kind });
    }
    if !reader.is_empty() {
        return Err(InstrumentError::malformed(
            "trailing bytes in StackMapTable attribute",
        ));
    }
    Ok(frames)
}

fn read_types(reader: &mut ByteReader<'_>) -> Result<Vec<VerificationType>> {
    let count = reader.read_u16()?;
    (0..count).map(|_| VerificationType::read(reader)).collect()
}

/// Encode frames sorted by strictly increasing offset.
pub(crate) fn encode_stack_map_table(frames: &[StackMapFrame]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    write_u16(&mut bytes, frames.len() as u16);
    let mut previous: Option<u32> = None;
    for frame in frames {
        let delta = match previous {
            None => frame.offset,
            Some(previous) if frame.offset > previous => frame.offset - previous - 1,
            Some(previous) => {
                return Err(InstrumentError::invariant(
                    "<stack map>",
                    format!(
                        "frame at offset {} does not follow frame at offset {previous}",
                        frame.offset
                    ),
                ));
            }
        };
        let delta = u16::try_from(delta).map_err(|_| {
            InstrumentError::invariant("<stack map>", "frame offset delta exceeds 65535")
        })?;
        previous = Some(frame.offset);
        match &frame.kind {
            FrameKind::Same if delta <= 63 => bytes.push(delta as u8),
            FrameKind::Same => {
                bytes.push(251);
                write_u16(&mut bytes, delta);
            }
            FrameKind::SameLocals1StackItem(item) => {
                if delta <= 63 {
                    bytes.push(64 + delta as u8);
                } else {
                    bytes.push(247);
                    write_u16(&mut bytes, delta);
                }
                item.write(&mut bytes);
            }
            FrameKind::Chop(k) => {
                bytes.push(251 - k);
                write_u16(&mut bytes, delta);
            }
            FrameKind::Append(locals) => {
                bytes.push(251 + locals.len() as u8);
                write_u16(&mut bytes, delta);
                for local in locals {
                    local.write(&mut bytes);
                }
            }
            FrameKind::Full { locals, stack } => {
                bytes.push(255);
                write_u16(&mut bytes, delta);
                write_u16(&mut bytes, locals.len() as u16);
                for local in locals {
                    local.write(&mut bytes);
                }
                write_u16(&mut bytes, stack.len() as u16);
                for item in stack {
                    item.write(&mut bytes);
                }
            }
        }
    }
    Ok(bytes)
}
