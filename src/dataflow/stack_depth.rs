use std::collections::{BTreeMap, VecDeque};

use crate::code::{Mark, decode_instruction, opcode_length};
use crate::constant_pool::ConstantPool;
use crate::descriptor::{MethodSignature, field_size};
use crate::error::{InstrumentError, Result};
use crate::ir::ExceptionEntry;
use crate::opcodes;

/// Operand stack depth (in slots) before each reachable instruction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct StackDepths {
    depths: BTreeMap<u32, u16>,
    max: u16,
}

impl StackDepths {
    pub(crate) fn at(&self, offset: u32) -> Option<u16> {
        self.depths.get(&offset).copied()
    }

    pub(crate) fn max(&self) -> u16 {
        self.max
    }
}

/// Stack slots popped and pushed by one instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Effect {
    pop: u16,
    push: u16,
}

const fn fixed(pop: u16, push: u16) -> Effect {
    Effect { pop, push }
}

/// Worklist propagation of stack depths over the original code.
pub(crate) fn analyze(
    code: &[u8],
    handlers: &[ExceptionEntry],
    constant_pool: &ConstantPool,
) -> Result<StackDepths> {
    let mut result = StackDepths::default();
    let mut worklist = VecDeque::new();
    merge(&mut result, &mut worklist, 0, 0)?;
    for handler in handlers {
        merge(&mut result, &mut worklist, handler.handler_pc as u32, 1)?;
    }

    while let Some(offset) = worklist.pop_front() {
        let Some(depth) = result.at(offset) else {
            continue;
        };
        let at = offset as usize;
        if at >= code.len() {
            return Err(InstrumentError::malformed(format!(
                "control flow reaches offset {offset} past the end of the code"
            )));
        }
        let opcode = code[at];
        let length = opcode_length(code, at)?;
        let effect = effect(code, at, constant_pool)?;
        if depth < effect.pop {
            return Err(InstrumentError::malformed(format!(
                "operand stack underflow at offset {offset}"
            )));
        }
        let after = depth - effect.pop + effect.push;
        result.max = result.max.max(after);

        let targets: Vec<u32> = decode_instruction(code, at, length)?
            .targets()
            .into_iter()
            .filter_map(|mark| match mark {
                Mark::Original(target) => Some(target),
                Mark::Label(_) => None,
            })
            .collect();
        let next = offset + length as u32;
        match opcode {
            opcodes::JSR | opcodes::JSR_W => {
                for target in targets {
                    merge(&mut result, &mut worklist, target, depth + 1)?;
                }
                result.max = result.max.max(depth + 1);
                merge(&mut result, &mut worklist, next, depth)?;
            }
            opcodes::RET => {}
            opcodes::WIDE if code.get(at + 1) == Some(&opcodes::RET) => {}
            _ => {
                for target in targets {
                    merge(&mut result, &mut worklist, target, after)?;
                }
                if !opcodes::ends_flow(opcode) {
                    merge(&mut result, &mut worklist, next, after)?;
                }
            }
        }
    }
    Ok(result)
}

fn merge(
    result: &mut StackDepths,
    worklist: &mut VecDeque<u32>,
    offset: u32,
    depth: u16,
) -> Result<()> {
    match result.depths.get(&offset) {
        Some(existing) if *existing == depth => Ok(()),
        Some(existing) => Err(InstrumentError::malformed(format!(
            "inconsistent stack depth at offset {offset}: {existing} vs {depth}"
        ))),
        None => {
            result.depths.insert(offset, depth);
            result.max = result.max.max(depth);
            worklist.push_back(offset);
            Ok(())
        }
    }
}

fn effect(code: &[u8], offset: usize, constant_pool: &ConstantPool) -> Result<Effect> {
    let opcode = code[offset];
    let effect = match opcode {
        opcodes::NOP => fixed(0, 0),
        // aconst_null, iconst_*, fconst_*
        opcodes::ACONST_NULL..=0x08 | 0x0b..=0x0d => fixed(0, 1),
        // lconst_*, dconst_*
        0x09 | 0x0a | 0x0e | 0x0f => fixed(0, 2),
        opcodes::BIPUSH | opcodes::SIPUSH | opcodes::LDC | opcodes::LDC_W => fixed(0, 1),
        opcodes::LDC2_W => fixed(0, 2),
        // iload, fload, aload and their short forms.
        opcodes::ILOAD | opcodes::FLOAD | opcodes::ALOAD | 0x1a..=0x1d | 0x22..=0x25 | 0x2a..=0x2d => {
            fixed(0, 1)
        }
        opcodes::LLOAD | opcodes::DLOAD | 0x1e..=0x21 | 0x26..=0x29 => fixed(0, 2),
        // laload, daload
        0x2f | 0x31 => fixed(2, 2),
        0x2e..=0x35 => fixed(2, 1),
        opcodes::ISTORE | opcodes::FSTORE | opcodes::ASTORE | 0x3b..=0x3e | 0x43..=0x46 | 0x4b..=0x4e => {
            fixed(1, 0)
        }
        opcodes::LSTORE | opcodes::DSTORE | 0x3f..=0x42 | 0x47..=0x4a => fixed(2, 0),
        // lastore, dastore
        0x50 | 0x52 => fixed(4, 0),
        0x4f..=0x56 => fixed(3, 0),
        opcodes::POP => fixed(1, 0),
        opcodes::POP2 => fixed(2, 0),
        opcodes::DUP => fixed(1, 2),
        opcodes::DUP_X1 => fixed(2, 3),
        opcodes::DUP_X2 => fixed(3, 4),
        opcodes::DUP2 => fixed(2, 4),
        opcodes::DUP2_X1 => fixed(3, 5),
        opcodes::DUP2_X2 => fixed(4, 6),
        opcodes::SWAP => fixed(2, 2),
        // add, sub, mul, div, rem in int/long/float/double order.
        0x60..=0x73 => {
            if (opcode - 0x60) % 2 == 1 {
                fixed(4, 2)
            } else {
                fixed(2, 1)
            }
        }
        // ineg, fneg / lneg, dneg
        0x74 | 0x76 => fixed(1, 1),
        0x75 | 0x77 => fixed(2, 2),
        // ishl, ishr, iushr / lshl, lshr, lushr
        0x78 | 0x7a | 0x7c => fixed(2, 1),
        0x79 | 0x7b | 0x7d => fixed(3, 2),
        // iand, ior, ixor / land, lor, lxor
        0x7e | 0x80 | 0x82 => fixed(2, 1),
        0x7f | 0x81 | 0x83 => fixed(4, 2),
        opcodes::IINC => fixed(0, 0),
        // i2l, i2d, f2l, f2d
        0x85 | 0x87 | 0x8c | 0x8d => fixed(1, 2),
        // i2f, f2i, i2b, i2c, i2s
        0x86 | 0x8b | 0x91..=0x93 => fixed(1, 1),
        // l2i, l2f, d2i, d2f
        0x88 | 0x89 | 0x8e | 0x90 => fixed(2, 1),
        // l2d, d2l
        0x8a | 0x8f => fixed(2, 2),
        // lcmp, dcmpl, dcmpg
        0x94 | 0x97 | 0x98 => fixed(4, 1),
        // fcmpl, fcmpg
        0x95 | 0x96 => fixed(2, 1),
        // if<cond>
        0x99..=0x9e => fixed(1, 0),
        // if_icmp<cond>, if_acmp<cond>
        0x9f..=opcodes::IF_ACMPNE => fixed(2, 0),
        opcodes::GOTO | opcodes::GOTO_W | opcodes::RET => fixed(0, 0),
        opcodes::JSR | opcodes::JSR_W => fixed(0, 0),
        opcodes::TABLESWITCH | opcodes::LOOKUPSWITCH => fixed(1, 0),
        // ireturn, freturn, areturn / lreturn, dreturn
        0xac | 0xae | opcodes::ARETURN => fixed(1, 0),
        0xad | 0xaf => fixed(2, 0),
        opcodes::RETURN => fixed(0, 0),
        opcodes::GETSTATIC | opcodes::PUTSTATIC | opcodes::GETFIELD | opcodes::PUTFIELD => {
            let index = crate::code::read_u16(code, offset + 1)?;
            let size = field_size(&constant_pool.member_ref(index)?.descriptor);
            match opcode {
                opcodes::GETSTATIC => fixed(0, size),
                opcodes::PUTSTATIC => fixed(size, 0),
                opcodes::GETFIELD => fixed(1, size),
                _ => fixed(1 + size, 0),
            }
        }
        opcodes::INVOKEVIRTUAL
        | opcodes::INVOKESPECIAL
        | opcodes::INVOKESTATIC
        | opcodes::INVOKEINTERFACE => {
            let index = crate::code::read_u16(code, offset + 1)?;
            let signature = MethodSignature::parse(&constant_pool.member_ref(index)?.descriptor)?;
            let receiver = if opcode == opcodes::INVOKESTATIC { 0 } else { 1 };
            fixed(
                signature.argument_size() + receiver,
                signature.return_size(),
            )
        }
        opcodes::INVOKEDYNAMIC => {
            let index = crate::code::read_u16(code, offset + 1)?;
            let signature = MethodSignature::parse(&constant_pool.dynamic_descriptor(index)?)?;
            fixed(signature.argument_size(), signature.return_size())
        }
        opcodes::NEW => fixed(0, 1),
        opcodes::NEWARRAY
        | opcodes::ANEWARRAY
        | opcodes::ARRAYLENGTH
        | opcodes::CHECKCAST
        | opcodes::INSTANCEOF => fixed(1, 1),
        opcodes::ATHROW | opcodes::MONITORENTER | opcodes::MONITOREXIT => fixed(1, 0),
        opcodes::WIDE => match code.get(offset + 1).copied() {
            Some(opcodes::ILOAD | opcodes::FLOAD | opcodes::ALOAD) => fixed(0, 1),
            Some(opcodes::LLOAD | opcodes::DLOAD) => fixed(0, 2),
            Some(opcodes::ISTORE | opcodes::FSTORE | opcodes::ASTORE) => fixed(1, 0),
            Some(opcodes::LSTORE | opcodes::DSTORE) => fixed(2, 0),
            Some(opcodes::IINC | opcodes::RET) => fixed(0, 0),
            other => {
                return Err(InstrumentError::malformed(format!(
                    "invalid wide operand {other:?} at offset {offset}"
                )));
            }
        },
        opcodes::MULTIANEWARRAY => {
            let dimensions = code.get(offset + 3).copied().ok_or_else(|| {
                InstrumentError::malformed("truncated multianewarray")
            })?;
            fixed(dimensions as u16, 1)
        }
        opcodes::IFNULL | opcodes::IFNONNULL => fixed(1, 0),
        _ => {
            return Err(InstrumentError::malformed(format!(
                "unsupported opcode 0x{opcode:02x} at offset {offset}"
            )));
        }
    };
    Ok(effect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::ByteReader;
    use crate::test_support::ClassFileBuilder;

    fn pool_with(refs: impl FnOnce(&mut ClassFileBuilder)) -> ConstantPool {
        let mut builder = ClassFileBuilder::new("T", "java/lang/Object");
        refs(&mut builder);
        let bytes = builder.finish();
        ConstantPool::parse(&mut ByteReader::new(&bytes[8..])).expect("pool")
    }

    #[test]
    fn tracks_depth_through_calls_and_wide_values() {
        let mut concat = 0;
        let pool = pool_with(|builder| {
            concat = builder.method_ref("T", "join", "(JLjava/lang/String;)Ljava/lang/String;");
        });
        // lconst_1; aload_0; invokestatic join; areturn
        let code = vec![0x0a, 0x2a, 0xb8, 0, concat as u8, 0xb0];

        let depths = analyze(&code, &[], &pool).expect("analyze");

        assert_eq!(depths.at(0), Some(0));
        assert_eq!(depths.at(1), Some(2));
        assert_eq!(depths.at(2), Some(3));
        assert_eq!(depths.at(5), Some(1));
        assert_eq!(depths.max(), 3);
    }

    #[test]
    fn field_access_uses_the_field_width() {
        let mut count = 0;
        let pool = pool_with(|builder| {
            count = builder.field_ref("T", "count", "J");
        });
        // aload_0; getfield count; pop2; aload_0; areturn
        let code = vec![0x2a, 0xb4, 0, count as u8, 0x58, 0x2a, 0xb0];

        let depths = analyze(&code, &[], &pool).expect("analyze");

        assert_eq!(depths.at(1), Some(1));
        assert_eq!(depths.at(4), Some(2));
        assert_eq!(depths.at(5), Some(0));
        assert_eq!(depths.at(6), Some(1));
    }

    #[test]
    fn handlers_start_with_the_exception_on_the_stack() {
        let pool = pool_with(|_| {});
        // 0: aconst_null; 1: areturn; 2: astore_1; 3: aconst_null; 4: areturn
        let code = vec![0x01, 0xb0, 0x4c, 0x01, 0xb0];
        let handlers = [ExceptionEntry {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 2,
            catch_type: 0,
        }];

        let depths = analyze(&code, &handlers, &pool).expect("analyze");

        assert_eq!(depths.at(2), Some(1));
        assert_eq!(depths.at(4), Some(1));
    }

    #[test]
    fn branches_propagate_and_unreachable_code_has_no_depth() {
        let pool = pool_with(|_| {});
        // 0: aload_0; 1: ifnonnull 6; 4: aconst_null; 5: areturn; 6: aload_0; 7: areturn; 8: aconst_null; 9: areturn
        let code = vec![0x2a, 0xc7, 0x00, 0x05, 0x01, 0xb0, 0x2a, 0xb0, 0x01, 0xb0];

        let depths = analyze(&code, &[], &pool).expect("analyze");

        assert_eq!(depths.at(6), Some(0));
        assert_eq!(depths.at(7), Some(1));
        assert_eq!(depths.at(9), None);
    }

    #[test]
    fn underflow_is_malformed() {
        let pool = pool_with(|_| {});

        let err = analyze(&[0x57, 0xb1], &[], &pool).expect_err("underflow");

        assert!(matches!(err, InstrumentError::MalformedClassFile { .. }));
    }
}
