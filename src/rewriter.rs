//! Inserts null checks into a method body and recomputes everything that depends on offsets.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::bytes::{ByteReader, write_u16};
use crate::code::{Insn, InstructionList, Mark, Node};
use crate::constant_pool::ConstantPool;
use crate::dataflow::stack_depth;
use crate::descriptor::parameter_descriptors;
use crate::error::{InstrumentError, Result};
use crate::ir::{CONSTRUCTOR, ClassModel, CodeModel, ExceptionEntry, RawAttribute};
use crate::opcodes;
use crate::selector::{CheckOrigin, MethodSelection, method_identity};
use crate::stackmap::{
    FrameKind, STACK_MAP_TABLE, StackMapFrame, VerificationType, absolute_locals,
    encode_stack_map_table, parse_stack_map_table,
};

const LINE_NUMBER_TABLE: &str = "LineNumberTable";
const LOCAL_VARIABLE_TABLE: &str = "LocalVariableTable";
const LOCAL_VARIABLE_TYPE_TABLE: &str = "LocalVariableTypeTable";

const ILLEGAL_ARGUMENT: &str = "java/lang/IllegalArgumentException";
const ILLEGAL_STATE: &str = "java/lang/IllegalStateException";
const OBJECT: &str = "java/lang/Object";
const MESSAGE_CONSTRUCTOR: &str = "(Ljava/lang/String;)V";

/// First class file version whose verifier requires a StackMapTable.
const FIRST_TYPE_CHECKED_MAJOR_VERSION: u16 = 51;

/// Operand stack used by `new; dup; ldc`.
const THROW_SEQUENCE_STACK: u16 = 3;

pub(crate) fn parameter_message(owner: &str, method: &str, index: usize, origin: CheckOrigin) -> String {
    let label = match origin {
        CheckOrigin::Annotation => "@NotNull",
        CheckOrigin::Implicit => "implicit 'NotNull'",
    };
    format!("Argument {index} for {label} parameter of {owner}.{method} must not be null")
}

pub(crate) fn return_message(owner: &str, method: &str) -> String {
    format!("NotNull method {owner}.{method} must not return null")
}

/// Constant pool indices of an exception class and its `(String)` constructor.
#[derive(Clone, Copy, Debug)]
struct ExceptionRefs {
    class: u16,
    constructor: u16,
}

impl ExceptionRefs {
    fn intern(pool: &mut ConstantPool, class_name: &str) -> Result<Self> {
        Ok(Self {
            class: pool.class_index(class_name)?,
            constructor: pool.method_ref_index(class_name, CONSTRUCTOR, MESSAGE_CONSTRUCTOR)?,
        })
    }

    /// `new; dup; ldc message; invokespecial <init>; athrow`
    fn throw_sequence(&self, message: u16) -> Vec<Node> {
        let [class_high, class_low] = self.class.to_be_bytes();
        let [init_high, init_low] = self.constructor.to_be_bytes();
        vec![
            plain(vec![opcodes::NEW, class_high, class_low]),
            plain(vec![opcodes::DUP]),
            plain(load_constant(message)),
            plain(vec![opcodes::INVOKESPECIAL, init_high, init_low]),
            plain(vec![opcodes::ATHROW]),
        ]
    }
}

fn plain(bytes: Vec<u8>) -> Node {
    Node::Insn(Insn::Plain(bytes))
}

fn load_reference(slot: u16) -> Vec<u8> {
    match slot {
        0..=3 => vec![opcodes::ALOAD_0 + slot as u8],
        4..=255 => vec![opcodes::ALOAD, slot as u8],
        _ => {
            let [high, low] = slot.to_be_bytes();
            vec![opcodes::WIDE, opcodes::ALOAD, high, low]
        }
    }
}

fn load_constant(index: u16) -> Vec<u8> {
    match u8::try_from(index) {
        Ok(short) => vec![opcodes::LDC, short],
        Err(_) => {
            let [high, low] = index.to_be_bytes();
            vec![opcodes::LDC_W, high, low]
        }
    }
}

/// Rewrite the selected method of `class` in place.
pub(crate) fn rewrite_method(class: &mut ClassModel, selection: &MethodSelection) -> Result<()> {
    let method = &class.methods[selection.method_index];
    let identity = method_identity(class, method);
    let method_name = method.name.clone();
    let (is_constructor, is_static) = (method.is_constructor(), method.is_static());
    let descriptor = method.descriptor.clone();
    let Some(original) = method.code().cloned() else {
        return Err(InstrumentError::invariant(
            identity,
            "selected method has no Code attribute",
        ));
    };
    let owner = class.name.clone();
    let major_version = class.major_version;
    let pool = &mut class.constant_pool;

    let mut list = InstructionList::decode(&original.code)?;
    let mut max_stack = original.max_stack;

    let mut skip_labels = Vec::new();
    if !selection.parameters.is_empty() {
        let refs = ExceptionRefs::intern(pool, ILLEGAL_ARGUMENT)?;
        let mut prologue = Vec::new();
        for check in &selection.parameters {
            let message = pool.string_index(&parameter_message(
                &owner,
                &method_name,
                check.index,
                check.origin,
            ))?;
            trace!(
                method = %identity,
                index = check.index,
                slot = check.slot,
                value_type = ?check.value_type,
                "parameter check"
            );
            let skip = list.new_label();
            prologue.push(plain(load_reference(check.slot)));
            prologue.push(Node::Insn(Insn::Branch {
                opcode: opcodes::IFNONNULL,
                target: skip,
            }));
            prologue.extend(refs.throw_sequence(message));
            prologue.push(Node::Mark(skip));
            skip_labels.push(skip);
        }
        list.insert_before(Mark::Original(0), prologue)?;
        max_stack = max_stack.max(THROW_SEQUENCE_STACK);
    }

    let mut throw_blocks = Vec::new();
    if selection.return_check.is_some() {
        let depths = stack_depth::analyze(&original.code, &original.exception_table, pool)?;
        trace!(method = %identity, max_depth = depths.max(), "stack depths computed");
        let mut guarded = Vec::new();
        for offset in list.original_offsets(opcodes::ARETURN) {
            match depths.at(offset) {
                Some(depth) => guarded.push((offset, depth)),
                None => trace!(method = %identity, offset, "unreachable return left unguarded"),
            }
        }
        if !guarded.is_empty() {
            let refs = ExceptionRefs::intern(pool, ILLEGAL_STATE)?;
            let message = pool.string_index(&return_message(&owner, &method_name))?;
            for (offset, depth) in guarded {
                let label = list.new_label();
                list.insert_after(
                    Mark::Original(offset),
                    vec![
                        plain(vec![opcodes::DUP]),
                        Node::Insn(Insn::Branch {
                            opcode: opcodes::IFNULL,
                            target: label,
                        }),
                    ],
                )?;
                // Nothing falls through an areturn, so the block sits right behind it.
                let resume = Mark::Original(offset + 1);
                let mut block = vec![Node::Mark(label)];
                block.extend(refs.throw_sequence(message));
                list.insert_before(resume, block)?;
                throw_blocks.push(ThrowBlock {
                    label,
                    resume,
                    depth,
                });
                max_stack = max_stack.max(depth.saturating_add(THROW_SEQUENCE_STACK));
            }
        }
    }

    let layout = list.layout(&identity)?;
    let code = list.encode(&layout, &identity)?;
    let remap = |offset: u32| layout.resolve(Mark::Original(offset), &identity);

    let mut block_ranges = Vec::with_capacity(throw_blocks.len());
    for block in &throw_blocks {
        block_ranges.push((
            layout.resolve(block.label, &identity)?,
            layout.resolve(block.resume, &identity)?,
        ));
    }
    let mut exception_table = Vec::with_capacity(original.exception_table.len());
    for entry in &original.exception_table {
        let handler_pc = remap(entry.handler_pc as u32)? as u16;
        let start = remap(entry.start_pc as u32)?;
        let end = remap(entry.end_pc as u32)?;
        for (start_pc, end_pc) in uncovered_ranges(start, end, &block_ranges) {
            exception_table.push(ExceptionEntry {
                start_pc: start_pc as u16,
                end_pc: end_pc as u16,
                handler_pc,
                catch_type: entry.catch_type,
            });
        }
    }
    if exception_table.len() > u16::MAX as usize {
        return Err(InstrumentError::invariant(
            identity.as_str(),
            format!("{} exception table entries", exception_table.len()),
        ));
    }

    let mut new_frames = Vec::new();
    for label in &skip_labels {
        new_frames.push(StackMapFrame {
            offset: layout.resolve(*label, &identity)?,
            kind: FrameKind::Same,
        });
    }
    if !throw_blocks.is_empty() {
        let object = pool.class_index(OBJECT)?;
        for block in &throw_blocks {
            let mut stack = vec![VerificationType::Top; (block.depth as usize).saturating_sub(1)];
            stack.push(VerificationType::Object(object));
            new_frames.push(StackMapFrame {
                offset: layout.resolve(block.label, &identity)?,
                kind: FrameKind::Full {
                    locals: Vec::new(),
                    stack,
                },
            });
        }
    }

    // Relative frames behind a throw block are rewritten against these.
    let mut initial_locals = Vec::new();
    if !throw_blocks.is_empty() && has_attribute(pool, &original, STACK_MAP_TABLE)? {
        initial_locals =
            implicit_frame_locals(pool, &owner, is_constructor, is_static, &descriptor)?;
    }

    let mut attributes = Vec::with_capacity(original.attributes.len());
    let mut has_stack_map = false;
    for attribute in &original.attributes {
        let name = pool.utf8(attribute.name_index)?;
        let info = match name.as_str() {
            LINE_NUMBER_TABLE => remap_line_numbers(&attribute.info, &remap)?,
            LOCAL_VARIABLE_TABLE | LOCAL_VARIABLE_TYPE_TABLE => {
                remap_local_variables(&attribute.info, &remap)?
            }
            STACK_MAP_TABLE => {
                has_stack_map = true;
                let frames = parse_stack_map_table(&attribute.info)?;
                merge_frames(frames, &new_frames, &initial_locals, &remap)?
            }
            _ => {
                debug!(method = %identity, attribute = %name, "dropping offset-dependent code attribute");
                continue;
            }
        };
        attributes.push(RawAttribute {
            name_index: attribute.name_index,
            info,
        });
    }
    if !has_stack_map && major_version >= FIRST_TYPE_CHECKED_MAJOR_VERSION && !new_frames.is_empty()
    {
        attributes.push(RawAttribute {
            name_index: pool.utf8_index(STACK_MAP_TABLE)?,
            info: merge_frames(Vec::new(), &new_frames, &[], &remap)?,
        });
    }

    debug!(
        method = %identity,
        parameters = selection.parameters.len(),
        return_guards = throw_blocks.len(),
        code_length = layout.length(),
        "instrumented method"
    );

    let rewritten = CodeModel {
        max_stack,
        max_locals: original.max_locals,
        code,
        exception_table,
        attributes,
    };
    let Some(slot) = class.methods[selection.method_index].code_mut() else {
        return Err(InstrumentError::invariant(
            identity,
            "Code attribute disappeared during rewrite",
        ));
    };
    *slot = rewritten;
    Ok(())
}

/// `IllegalStateException` block placed directly behind a guarded `areturn`.
#[derive(Clone, Copy, Debug)]
struct ThrowBlock {
    label: Mark,
    /// Mark of the instruction following the `areturn`, where the block ends.
    resume: Mark,
    /// Operand stack depth at the `areturn`, including the returned reference.
    depth: u16,
}

/// Parts of `[start, end)` outside every block; `blocks` is sorted and disjoint.
fn uncovered_ranges(start: u32, end: u32, blocks: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    let mut from = start;
    for &(block_start, block_end) in blocks {
        if block_end <= from || block_start >= end {
            continue;
        }
        if block_start > from {
            ranges.push((from, block_start));
        }
        from = block_end;
    }
    if from < end {
        ranges.push((from, end));
    }
    ranges
}

fn has_attribute(pool: &ConstantPool, code: &CodeModel, name: &str) -> Result<bool> {
    for attribute in &code.attributes {
        if pool.utf8(attribute.name_index)? == name {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Locals of the frame the verifier derives from the method descriptor.
fn implicit_frame_locals(
    pool: &mut ConstantPool,
    owner: &str,
    is_constructor: bool,
    is_static: bool,
    descriptor: &str,
) -> Result<Vec<VerificationType>> {
    let mut locals = Vec::new();
    if !is_static {
        locals.push(if is_constructor && owner != OBJECT {
            VerificationType::UninitializedThis
        } else {
            VerificationType::Object(pool.class_index(owner)?)
        });
    }
    for parameter in parameter_descriptors(descriptor)? {
        let local = match parameter.as_bytes().first() {
            Some(b'J') => VerificationType::Long,
            Some(b'D') => VerificationType::Double,
            Some(b'F') => VerificationType::Float,
            Some(b'L') => {
                VerificationType::Object(pool.class_index(&parameter[1..parameter.len() - 1])?)
            }
            Some(b'[') => VerificationType::Object(pool.class_index(parameter)?),
            _ => VerificationType::Integer,
        };
        locals.push(local);
    }
    Ok(locals)
}

/// Merge inserted frames into the remapped original ones. An original frame that directly
/// follows a throw block's full frame can no longer be encoded relative to it and becomes a
/// full frame itself.
fn merge_frames(
    existing: Vec<StackMapFrame>,
    inserted: &[StackMapFrame],
    initial_locals: &[VerificationType],
    remap: &impl Fn(u32) -> Result<u32>,
) -> Result<Vec<u8>> {
    let displacing = inserted
        .iter()
        .any(|frame| matches!(frame.kind, FrameKind::Full { .. }));
    let resolved = if displacing {
        absolute_locals(&existing, initial_locals)?
    } else {
        Vec::new()
    };

    // Original frames carry their index into `resolved`.
    let mut frames: Vec<(StackMapFrame, Option<usize>)> =
        Vec::with_capacity(existing.len() + inserted.len());
    for (index, mut frame) in existing.into_iter().enumerate() {
        frame.remap(remap)?;
        frames.push((frame, Some(index)));
    }
    let occupied: BTreeSet<u32> = frames.iter().map(|(frame, _)| frame.offset).collect();
    frames.extend(
        inserted
            .iter()
            .filter(|frame| !occupied.contains(&frame.offset))
            .map(|frame| (frame.clone(), None)),
    );
    frames.sort_by_key(|(frame, _)| frame.offset);

    let mut merged = Vec::with_capacity(frames.len());
    let mut after_throw_block = false;
    for (mut frame, original) in frames {
        match original {
            None => after_throw_block = matches!(frame.kind, FrameKind::Full { .. }),
            Some(index) => {
                if after_throw_block && !matches!(frame.kind, FrameKind::Full { .. }) {
                    let Some(locals) = resolved.get(index) else {
                        return Err(InstrumentError::invariant(
                            "<stack map>",
                            format!("no locals resolved for frame at {}", frame.offset),
                        ));
                    };
                    frame.kind = FrameKind::Full {
                        locals: locals.clone(),
                        stack: frame.kind.stack(),
                    };
                }
                after_throw_block = false;
            }
        }
        merged.push(frame);
    }
    encode_stack_map_table(&merged)
}

fn remap_line_numbers(info: &[u8], remap: &impl Fn(u32) -> Result<u32>) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(info);
    let count = reader.read_u16()?;
    let mut bytes = Vec::with_capacity(info.len());
    write_u16(&mut bytes, count);
    for _ in 0..count {
        let start = reader.read_u16()?;
        let line = reader.read_u16()?;
        write_u16(&mut bytes, remap(start as u32)? as u16);
        write_u16(&mut bytes, line);
    }
    Ok(bytes)
}

/// Shared by `LocalVariableTable` and `LocalVariableTypeTable`, which have the same layout.
fn remap_local_variables(info: &[u8], remap: &impl Fn(u32) -> Result<u32>) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(info);
    let count = reader.read_u16()?;
    let mut bytes = Vec::with_capacity(info.len());
    write_u16(&mut bytes, count);
    for _ in 0..count {
        let start = reader.read_u16()? as u32;
        let length = reader.read_u16()? as u32;
        let new_start = remap(start)?;
        let new_end = remap(start + length)?;
        write_u16(&mut bytes, new_start as u16);
        write_u16(&mut bytes, (new_end - new_start) as u16);
        bytes.extend_from_slice(reader.read_bytes(6)?);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ValueType;
    use crate::reader::{ParsedClass, parse_class_bytes};
    use crate::selector::ParameterCheck;
    use crate::test_support::{ACC_PUBLIC, ACC_STATIC, ClassFileBuilder, MethodSpec, high, low};

    fn model(bytes: &[u8]) -> ClassModel {
        match parse_class_bytes(bytes).expect("parse") {
            ParsedClass::Model(model) => model,
            ParsedClass::Unsupported { .. } => panic!("unsupported"),
        }
    }

    fn parameter(index: usize, slot: u16) -> ParameterCheck {
        ParameterCheck {
            index,
            slot,
            value_type: ValueType::Object,
            origin: CheckOrigin::Annotation,
        }
    }

    fn code(class: &ClassModel, method_index: usize) -> &CodeModel {
        class.methods[method_index].code().expect("code")
    }

    fn attribute<'a>(class: &ClassModel, code: &'a CodeModel, name: &str) -> Option<&'a [u8]> {
        code.attributes
            .iter()
            .find(|attribute| class.constant_pool.utf8(attribute.name_index).expect("name") == name)
            .map(|attribute| attribute.info.as_slice())
    }

    #[test]
    fn messages_follow_the_established_wording() {
        assert_eq!(
            parameter_message("pkg/Cls", "run", 1, CheckOrigin::Annotation),
            "Argument 1 for @NotNull parameter of pkg/Cls.run must not be null"
        );
        assert_eq!(
            parameter_message("pkg/Cls$Foo", "<init>", 0, CheckOrigin::Implicit),
            "Argument 0 for implicit 'NotNull' parameter of pkg/Cls$Foo.<init> must not be null"
        );
        assert_eq!(
            return_message("pkg/Cls", "get"),
            "NotNull method pkg/Cls.get must not return null"
        );
    }

    #[test]
    fn parameter_prologue_precedes_the_original_body() {
        let mut builder = ClassFileBuilder::new("pkg/Params", "java/lang/Object");
        builder.add_method(
            MethodSpec::new(ACC_PUBLIC | ACC_STATIC, "run", "(Ljava/lang/String;)V")
                .code(0, 1, vec![0xb1]),
        );
        let mut class = model(&builder.finish());
        let selection = MethodSelection {
            method_index: 0,
            parameters: vec![parameter(0, 0)],
            return_check: None,
        };

        rewrite_method(&mut class, &selection).expect("rewrite");

        let pool = &mut class.constant_pool;
        let iae = pool.class_index(ILLEGAL_ARGUMENT).expect("class");
        let init = pool
            .method_ref_index(ILLEGAL_ARGUMENT, CONSTRUCTOR, MESSAGE_CONSTRUCTOR)
            .expect("init");
        let message = pool
            .string_index("Argument 0 for @NotNull parameter of pkg/Params.run must not be null")
            .expect("message");
        let rewritten = code(&class, 0);
        assert_eq!(
            rewritten.code,
            vec![
                0x2a, 0xc7, 0x00, 0x0d, 0xbb, high(iae), low(iae), 0x59, 0x12, message as u8,
                0xb7, high(init), low(init), 0xbf, 0xb1,
            ]
        );
        assert_eq!(rewritten.max_stack, 3);
        let frames = parse_stack_map_table(
            attribute(&class, rewritten, STACK_MAP_TABLE).expect("stack map created"),
        )
        .expect("frames");
        assert_eq!(
            frames,
            vec![StackMapFrame {
                offset: 14,
                kind: FrameKind::Same,
            }]
        );
    }

    #[test]
    fn each_return_gets_a_throw_block_behind_it() {
        let mut builder = ClassFileBuilder::new("pkg/Returns", "java/lang/Object");
        // 0: aload_0; 1: ifnonnull 6; 4: aconst_null; 5: areturn; 6: aload_0; 7: areturn
        builder.add_method(
            MethodSpec::new(ACC_PUBLIC | ACC_STATIC, "pick", "(Ljava/lang/Object;)Ljava/lang/Object;")
                .code(1, 1, vec![0x2a, 0xc7, 0x00, 0x05, 0x01, 0xb0, 0x2a, 0xb0]),
        );
        let mut class = model(&builder.finish());
        let selection = MethodSelection {
            method_index: 0,
            parameters: Vec::new(),
            return_check: Some(CheckOrigin::Annotation),
        };

        rewrite_method(&mut class, &selection).expect("rewrite");

        let rewritten = code(&class, 0).clone();
        // Each guard skips its areturn and lands on the 10-byte block that follows it.
        assert_eq!(
            &rewritten.code[..10],
            &[0x2a, 0xc7, 0x00, 0x13, 0x01, 0x59, 0xc6, 0x00, 0x04, 0xb0][..]
        );
        assert_eq!(rewritten.code[10], opcodes::NEW);
        assert_eq!(&rewritten.code[20..26], &[0x2a, 0x59, 0xc6, 0x00, 0x04, 0xb0][..]);
        assert_eq!(rewritten.code[26], opcodes::NEW);
        assert_eq!(rewritten.code.len(), 36);
        assert_eq!(rewritten.max_stack, 4);
        let frames = parse_stack_map_table(
            attribute(&class, &rewritten, STACK_MAP_TABLE).expect("stack map"),
        )
        .expect("frames");
        let object = class.constant_pool.class_index(OBJECT).expect("object");
        let throw_frame = |offset| StackMapFrame {
            offset,
            kind: FrameKind::Full {
                locals: Vec::new(),
                stack: vec![VerificationType::Object(object)],
            },
        };
        assert_eq!(frames, vec![throw_frame(10), throw_frame(26)]);
    }

    #[test]
    fn early_returns_in_large_methods_stay_within_branch_range() {
        let mut builder = ClassFileBuilder::new("pkg/Large", "java/lang/Object");
        // 0: iload_0; 1: ifeq 6; 4: aconst_null; 5: areturn; 6: nop...; aconst_null; areturn
        let mut body = vec![0x1a, 0x99, 0x00, 0x05, 0x01, 0xb0];
        body.extend(std::iter::repeat_n(0x00, 40_000));
        body.extend([0x01, 0xb0]);
        builder.add_method(
            MethodSpec::new(ACC_STATIC, "big", "(I)Ljava/lang/Object;").code(1, 1, body),
        );
        let mut class = model(&builder.finish());
        let selection = MethodSelection {
            method_index: 0,
            parameters: Vec::new(),
            return_check: Some(CheckOrigin::Implicit),
        };

        rewrite_method(&mut class, &selection).expect("rewrite");

        let rewritten = code(&class, 0);
        assert_eq!(
            &rewritten.code[..10],
            &[0x1a, 0x99, 0x00, 0x13, 0x01, 0x59, 0xc6, 0x00, 0x04, 0xb0][..]
        );
        assert_eq!(rewritten.code[10], opcodes::NEW);
        assert_eq!(rewritten.code.len(), 40_008 + 2 * 4 + 2 * 10);
    }

    #[test]
    fn handler_ranges_skip_throw_blocks() {
        assert_eq!(uncovered_ranges(0, 40, &[(10, 20), (30, 35)]), vec![(0, 10), (20, 30), (35, 40)]);
        assert_eq!(uncovered_ranges(12, 18, &[(10, 20)]), Vec::new());
        assert_eq!(uncovered_ranges(20, 30, &[(10, 20), (30, 35)]), vec![(20, 30)]);
    }

    #[test]
    fn tables_are_shifted_past_the_prologue() {
        let mut builder = ClassFileBuilder::new("pkg/Tables", "java/lang/Object");
        let object_class = builder.class(OBJECT);
        // 0: aload_1; 1: areturn; 2: astore_2; 3: aload_1; 4: areturn
        let mut line_numbers = Vec::new();
        for value in [2u16, 0, 10, 2, 11] {
            write_u16(&mut line_numbers, value);
        }
        let name = builder.utf8("value");
        let descriptor = builder.utf8("Ljava/lang/Object;");
        let mut locals = Vec::new();
        for value in [1u16, 0, 5, name, descriptor, 1] {
            write_u16(&mut locals, value);
        }
        let mut stack_map = Vec::new();
        write_u16(&mut stack_map, 1);
        stack_map.extend_from_slice(&[64 + 2, 7, high(object_class), low(object_class)]);
        builder.add_method(
            MethodSpec::new(ACC_PUBLIC, "get", "(Ljava/lang/Object;)Ljava/lang/Object;")
                .code(1, 3, vec![0x2b, 0xb0, 0x4d, 0x2b, 0xb0])
                .handler(0, 2, 2, 0)
                .code_attribute(LINE_NUMBER_TABLE, line_numbers)
                .code_attribute(LOCAL_VARIABLE_TABLE, locals)
                .code_attribute(STACK_MAP_TABLE, stack_map)
                .code_attribute("RuntimeInvisibleTypeAnnotations", vec![0, 0]),
        );
        let mut class = model(&builder.finish());
        let selection = MethodSelection {
            method_index: 0,
            parameters: vec![parameter(0, 1)],
            return_check: Some(CheckOrigin::Implicit),
        };

        rewrite_method(&mut class, &selection).expect("rewrite");

        let rewritten = code(&class, 0).clone();
        // Prologue is 14 bytes; each guard adds 4 bytes before its areturn and a 10-byte
        // throw block after it.
        assert_eq!(
            rewritten.exception_table,
            vec![ExceptionEntry {
                start_pc: 14,
                end_pc: 20,
                handler_pc: 30,
                catch_type: 0,
            }]
        );
        assert_eq!(rewritten.attributes.len(), 3);
        let mut lines = ByteReader::new(
            attribute(&class, &rewritten, LINE_NUMBER_TABLE).expect("lines"),
        );
        assert_eq!(lines.read_u16().expect("count"), 2);
        assert_eq!(lines.read_u16().expect("pc"), 14);
        assert_eq!(lines.read_u16().expect("line"), 10);
        assert_eq!(lines.read_u16().expect("pc"), 30);
        let mut variables = ByteReader::new(
            attribute(&class, &rewritten, LOCAL_VARIABLE_TABLE).expect("locals"),
        );
        assert_eq!(variables.read_u16().expect("count"), 1);
        assert_eq!(variables.read_u16().expect("start"), 14);
        assert_eq!(variables.read_u16().expect("length"), 33);
        let frames = parse_stack_map_table(
            attribute(&class, &rewritten, STACK_MAP_TABLE).expect("stack map"),
        )
        .expect("frames");
        let offsets: Vec<u32> = frames.iter().map(|frame| frame.offset).collect();
        assert_eq!(offsets, vec![14, 20, 30, 37]);
        // The handler frame follows a throw block and is spelled out in full.
        let tables = class.constant_pool.class_index("pkg/Tables").expect("class");
        assert_eq!(
            frames[2].kind,
            FrameKind::Full {
                locals: vec![
                    VerificationType::Object(tables),
                    VerificationType::Object(object_class),
                ],
                stack: vec![VerificationType::Object(object_class)],
            }
        );
    }

    #[test]
    fn branches_into_a_return_hit_the_guard() {
        let mut builder = ClassFileBuilder::new("pkg/Branch", "java/lang/Object");
        // 0: aload_0; 1: goto 4; 4: areturn
        builder.add_method(
            MethodSpec::new(ACC_STATIC, "id", "(Ljava/lang/Object;)Ljava/lang/Object;")
                .code(1, 1, vec![0x2a, 0xa7, 0x00, 0x03, 0xb0]),
        );
        let mut class = model(&builder.finish());
        let selection = MethodSelection {
            method_index: 0,
            parameters: Vec::new(),
            return_check: Some(CheckOrigin::Annotation),
        };

        rewrite_method(&mut class, &selection).expect("rewrite");

        assert_eq!(
            &code(&class, 0).code[..8],
            &[0x2a, 0xa7, 0x00, 0x03, 0x59, 0xc6, 0x00, 0x04][..]
        );
    }

    #[test]
    fn constructor_prologue_runs_before_the_super_call() {
        let mut builder = ClassFileBuilder::new("pkg/Ctor", "java/lang/Object");
        let super_init = builder.method_ref("java/lang/Object", "<init>", "()V");
        builder.add_method(
            MethodSpec::new(ACC_PUBLIC, "<init>", "(Ljava/lang/String;)V").code(
                1,
                2,
                vec![0x2a, 0xb7, high(super_init), low(super_init), 0xb1],
            ),
        );
        let mut class = model(&builder.finish());
        let selection = MethodSelection {
            method_index: 0,
            parameters: vec![parameter(0, 1)],
            return_check: None,
        };

        rewrite_method(&mut class, &selection).expect("rewrite");

        let rewritten = code(&class, 0).clone();
        assert_eq!(rewritten.code[0], 0x2b);
        assert_eq!(
            &rewritten.code[14..],
            &[0x2a, 0xb7, high(super_init), low(super_init), 0xb1][..]
        );
        let frames = parse_stack_map_table(
            attribute(&class, &rewritten, STACK_MAP_TABLE).expect("stack map"),
        )
        .expect("frames");
        assert_eq!(
            frames,
            vec![StackMapFrame {
                offset: 14,
                kind: FrameKind::Same,
            }]
        );
    }

    #[test]
    fn old_versions_without_stack_maps_get_none() {
        let mut builder = ClassFileBuilder::new("pkg/Old", "java/lang/Object").version(49);
        builder.add_method(
            MethodSpec::new(ACC_STATIC, "run", "(Ljava/lang/String;)V").code(0, 1, vec![0xb1]),
        );
        let mut class = model(&builder.finish());
        let selection = MethodSelection {
            method_index: 0,
            parameters: vec![parameter(0, 0)],
            return_check: None,
        };

        rewrite_method(&mut class, &selection).expect("rewrite");

        assert!(code(&class, 0).attributes.is_empty());
    }

    #[test]
    fn wide_slots_use_wide_loads() {
        assert_eq!(load_reference(2), vec![0x2c]);
        assert_eq!(load_reference(7), vec![opcodes::ALOAD, 7]);
        assert_eq!(load_reference(300), vec![opcodes::WIDE, opcodes::ALOAD, 1, 44]);
        assert_eq!(load_constant(12), vec![opcodes::LDC, 12]);
        assert_eq!(load_constant(400), vec![opcodes::LDC_W, 1, 144]);
    }
}
