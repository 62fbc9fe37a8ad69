//! Instruction arena used to insert code without patching raw offsets in place.
//!
//! Bytecode is decoded into a flat list of nodes. Each original instruction is preceded by a
//! zero-width [`Mark::Original`] carrying its old offset, and a final mark stands for the end
//! of the original code. Branches refer to marks instead of offsets. A single layout pass
//! assigns new offsets (recomputing switch padding) and every offset-bearing table is then
//! remapped through the marks.

use std::collections::HashMap;

use crate::bytes::{write_i32, write_u16};
use crate::error::{InstrumentError, Result};
use crate::opcodes;

/// Zero-width position in the instruction list.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum Mark {
    /// Byte offset in the original code.
    Original(u32),
    /// Label introduced by the rewriter.
    Label(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Insn {
    /// Instruction without branch offsets, copied verbatim.
    Plain(Vec<u8>),
    Branch {
        opcode: u8,
        target: Mark,
    },
    WideBranch {
        opcode: u8,
        target: Mark,
    },
    TableSwitch {
        default: Mark,
        low: i32,
        high: i32,
        targets: Vec<Mark>,
    },
    LookupSwitch {
        default: Mark,
        pairs: Vec<(i32, Mark)>,
    },
}

impl Insn {
    fn size(&self, offset: u32) -> u32 {
        match self {
            Insn::Plain(bytes) => bytes.len() as u32,
            Insn::Branch { .. } => 3,
            Insn::WideBranch { .. } => 5,
            Insn::TableSwitch { targets, .. } => {
                1 + padding(offset as usize) as u32 + 12 + 4 * targets.len() as u32
            }
            Insn::LookupSwitch { pairs, .. } => {
                1 + padding(offset as usize) as u32 + 8 + 8 * pairs.len() as u32
            }
        }
    }

    /// Every mark the instruction may jump to.
    pub(crate) fn targets(&self) -> Vec<Mark> {
        match self {
            Insn::Plain(_) => Vec::new(),
            Insn::Branch { target, .. } | Insn::WideBranch { target, .. } => vec![*target],
            Insn::TableSwitch {
                default, targets, ..
            } => std::iter::once(*default).chain(targets.iter().copied()).collect(),
            Insn::LookupSwitch { default, pairs } => std::iter::once(*default)
                .chain(pairs.iter().map(|(_, target)| *target))
                .collect(),
        }
    }

    fn opcode(&self) -> u8 {
        match self {
            Insn::Plain(bytes) => bytes[0],
            Insn::Branch { opcode, .. } | Insn::WideBranch { opcode, .. } => *opcode,
            Insn::TableSwitch { .. } => opcodes::TABLESWITCH,
            Insn::LookupSwitch { .. } => opcodes::LOOKUPSWITCH,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Node {
    Mark(Mark),
    Insn(Insn),
}

#[derive(Clone, Debug)]
pub(crate) struct InstructionList {
    nodes: Vec<Node>,
    next_label: u32,
}

/// Offsets assigned by [`InstructionList::layout`].
#[derive(Debug)]
pub(crate) struct Layout {
    positions: HashMap<Mark, u32>,
    length: u32,
}

impl Layout {
    pub(crate) fn resolve(&self, mark: Mark, method: &str) -> Result<u32> {
        self.positions.get(&mark).copied().ok_or_else(|| {
            InstrumentError::invariant(method, format!("no position recorded for {mark:?}"))
        })
    }

    pub(crate) fn length(&self) -> u32 {
        self.length
    }
}

impl InstructionList {
    pub(crate) fn decode(code: &[u8]) -> Result<Self> {
        let mut nodes = Vec::new();
        let mut boundaries = vec![false; code.len()];
        let mut offset = 0;
        while offset < code.len() {
            let length = opcode_length(code, offset)?;
            if offset + length > code.len() {
                return Err(InstrumentError::malformed(format!(
                    "instruction at offset {offset} overruns the code array"
                )));
            }
            boundaries[offset] = true;
            nodes.push(Node::Mark(Mark::Original(offset as u32)));
            nodes.push(Node::Insn(decode_instruction(code, offset, length)?));
            offset += length;
        }
        nodes.push(Node::Mark(Mark::Original(code.len() as u32)));

        let list = Self {
            nodes,
            next_label: 0,
        };
        for target in list.branch_targets() {
            let valid = matches!(target, Mark::Original(at) if boundaries.get(at as usize) == Some(&true));
            if !valid {
                return Err(InstrumentError::malformed(format!(
                    "branch target {target:?} is not an instruction boundary"
                )));
            }
        }
        Ok(list)
    }

    fn branch_targets(&self) -> Vec<Mark> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Insn(insn) => Some(insn.targets()),
                Node::Mark(_) => None,
            })
            .flatten()
            .collect()
    }

    pub(crate) fn new_label(&mut self) -> Mark {
        let label = Mark::Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Original offsets of every instruction with the given opcode.
    pub(crate) fn original_offsets(&self, opcode: u8) -> Vec<u32> {
        let mut offsets = Vec::new();
        let mut current = None;
        for node in &self.nodes {
            match node {
                Node::Mark(Mark::Original(offset)) => current = Some(*offset),
                Node::Mark(Mark::Label(_)) => {}
                Node::Insn(insn) => {
                    if let Some(offset) = current.take()
                        && insn.opcode() == opcode
                    {
                        offsets.push(offset);
                    }
                }
            }
        }
        offsets
    }

    pub(crate) fn insert_before(&mut self, mark: Mark, nodes: Vec<Node>) -> Result<()> {
        let index = self.position(mark)?;
        self.nodes.splice(index..index, nodes);
        Ok(())
    }

    pub(crate) fn insert_after(&mut self, mark: Mark, nodes: Vec<Node>) -> Result<()> {
        let index = self.position(mark)? + 1;
        self.nodes.splice(index..index, nodes);
        Ok(())
    }

    pub(crate) fn append(&mut self, nodes: Vec<Node>) {
        self.nodes.extend(nodes);
    }

    fn position(&self, mark: Mark) -> Result<usize> {
        self.nodes
            .iter()
            .position(|node| *node == Node::Mark(mark))
            .ok_or_else(|| {
                InstrumentError::invariant("<code>", format!("{mark:?} is not in the instruction list"))
            })
    }

    pub(crate) fn layout(&self, method: &str) -> Result<Layout> {
        let mut positions = HashMap::new();
        let mut offset: u32 = 0;
        for node in &self.nodes {
            match node {
                Node::Mark(mark) => {
                    positions.insert(*mark, offset);
                }
                Node::Insn(insn) => offset += insn.size(offset),
            }
        }
        if offset > u16::MAX as u32 {
            return Err(InstrumentError::invariant(
                method,
                format!("code length {offset} exceeds 65535 bytes"),
            ));
        }
        Ok(Layout {
            positions,
            length: offset,
        })
    }

    pub(crate) fn encode(&self, layout: &Layout, method: &str) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(layout.length() as usize);
        for node in &self.nodes {
            let Node::Insn(insn) = node else {
                continue;
            };
            let at = bytes.len() as u32;
            let relative = |target: Mark| -> Result<i64> {
                Ok(layout.resolve(target, method)? as i64 - at as i64)
            };
            match insn {
                Insn::Plain(raw) => bytes.extend_from_slice(raw),
                Insn::Branch { opcode, target } => {
                    let delta = relative(*target)?;
                    let delta = i16::try_from(delta).map_err(|_| {
                        InstrumentError::invariant(
                            method,
                            format!("branch offset {delta} at {at} does not fit in 16 bits"),
                        )
                    })?;
                    bytes.push(*opcode);
                    write_u16(&mut bytes, delta as u16);
                }
                Insn::WideBranch { opcode, target } => {
                    bytes.push(*opcode);
                    write_i32(&mut bytes, relative(*target)? as i32);
                }
                Insn::TableSwitch {
                    default,
                    low,
                    high,
                    targets,
                } => {
                    bytes.push(opcodes::TABLESWITCH);
                    bytes.resize(bytes.len() + padding(at as usize), 0);
                    write_i32(&mut bytes, relative(*default)? as i32);
                    write_i32(&mut bytes, *low);
                    write_i32(&mut bytes, *high);
                    for target in targets {
                        write_i32(&mut bytes, relative(*target)? as i32);
                    }
                }
                Insn::LookupSwitch { default, pairs } => {
                    bytes.push(opcodes::LOOKUPSWITCH);
                    bytes.resize(bytes.len() + padding(at as usize), 0);
                    write_i32(&mut bytes, relative(*default)? as i32);
                    write_i32(&mut bytes, pairs.len() as i32);
                    for (key, target) in pairs {
                        write_i32(&mut bytes, *key);
                        write_i32(&mut bytes, relative(*target)? as i32);
                    }
                }
            }
        }
        Ok(bytes)
    }
}

pub(crate) fn decode_instruction(code: &[u8], offset: usize, length: usize) -> Result<Insn> {
    let opcode = code[offset];
    let target = |relative: i64| -> Result<Mark> {
        let absolute = offset as i64 + relative;
        if absolute < 0 || absolute >= code.len() as i64 {
            return Err(InstrumentError::malformed(format!(
                "branch at offset {offset} targets {absolute} outside the code array"
            )));
        }
        Ok(Mark::Original(absolute as u32))
    };
    let insn = if opcodes::is_short_branch(opcode) {
        Insn::Branch {
            opcode,
            target: target(read_u16(code, offset + 1)? as i16 as i64)?,
        }
    } else if opcodes::is_wide_branch(opcode) {
        Insn::WideBranch {
            opcode,
            target: target(read_i32(code, offset + 1)? as i64)?,
        }
    } else if opcode == opcodes::TABLESWITCH {
        let base = offset + 1 + padding(offset);
        let default = target(read_i32(code, base)? as i64)?;
        let low = read_i32(code, base + 4)?;
        let high = read_i32(code, base + 8)?;
        let mut targets = Vec::new();
        for case in 0..(high as i64 - low as i64 + 1) as usize {
            targets.push(target(read_i32(code, base + 12 + case * 4)? as i64)?);
        }
        Insn::TableSwitch {
            default,
            low,
            high,
            targets,
        }
    } else if opcode == opcodes::LOOKUPSWITCH {
        let base = offset + 1 + padding(offset);
        let default = target(read_i32(code, base)? as i64)?;
        let count = read_i32(code, base + 4)? as usize;
        let mut pairs = Vec::with_capacity(count);
        for pair in 0..count {
            let key = read_i32(code, base + 8 + pair * 8)?;
            pairs.push((key, target(read_i32(code, base + 12 + pair * 8)? as i64)?));
        }
        Insn::LookupSwitch { default, pairs }
    } else {
        Insn::Plain(code[offset..offset + length].to_vec())
    };
    Ok(insn)
}

pub(crate) fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code[offset];
    let length = match opcode {
        0x00..=0x0f => 1,
        opcodes::BIPUSH => 2,
        opcodes::SIPUSH => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        opcodes::ILOAD..=opcodes::ALOAD => 2,
        0x1a..=0x35 => 1,
        opcodes::ISTORE..=opcodes::ASTORE => 2,
        0x3b..=0x83 => 1,
        opcodes::IINC => 3,
        0x85..=0x98 => 1,
        opcodes::IFEQ..=opcodes::JSR => 3,
        opcodes::RET => 2,
        opcodes::TABLESWITCH => tableswitch_length(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        opcodes::IRETURN..=opcodes::RETURN => 1,
        opcodes::GETSTATIC..=opcodes::PUTFIELD => 3,
        opcodes::INVOKEVIRTUAL | opcodes::INVOKESPECIAL | opcodes::INVOKESTATIC => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        opcodes::NEW => 3,
        opcodes::NEWARRAY => 2,
        opcodes::ANEWARRAY => 3,
        opcodes::ARRAYLENGTH | opcodes::ATHROW => 1,
        opcodes::CHECKCAST | opcodes::INSTANCEOF => 3,
        opcodes::MONITORENTER | opcodes::MONITOREXIT => 1,
        opcodes::WIDE => wide_length(code, offset)?,
        opcodes::MULTIANEWARRAY => 4,
        opcodes::IFNULL | opcodes::IFNONNULL => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        _ => {
            return Err(InstrumentError::malformed(format!(
                "unsupported opcode 0x{opcode:02x} at offset {offset}"
            )));
        }
    };
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high as i64 - low as i64 + 1;
    if count < 0 {
        return Err(InstrumentError::malformed(format!(
            "invalid tableswitch range at offset {offset}"
        )));
    }
    Ok(1 + padding + 12 + (count as usize) * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        return Err(InstrumentError::malformed(format!(
            "invalid lookupswitch pair count at offset {offset}"
        )));
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    match code.get(offset + 1) {
        Some(&opcodes::IINC) => Ok(6),
        Some(_) => Ok(4),
        None => Err(InstrumentError::malformed("missing opcode after wide")),
    }
}

pub(crate) fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

pub(crate) fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let slice = code
        .get(offset..offset + 2)
        .ok_or_else(|| InstrumentError::malformed("bytecode u16 out of bounds"))?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let slice = code
        .get(offset..offset + 4)
        .ok_or_else(|| InstrumentError::malformed("bytecode i32 out of bounds"))?;
    Ok(i32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}
