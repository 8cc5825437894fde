//! Constant folding

use crate::error::{CodegenError, CompileError};
use crate::ir::context::IrContext;
use crate::ir::inst::{BinOp, InstKind};
use crate::ir::value::{ValueId, ValueType};

use tracing::debug;

/// Fold operations over interned constants in `func`. Returns whether
/// anything changed.
pub fn fold_constants(ctx: &mut IrContext, func: ValueId) -> Result<bool, CompileError> {
    let mut changed = false;
    let blocks = ctx.value(func).function().blocks.clone();

    for block in blocks {
        let insts = ctx.value(block).block().insts.clone();
        for inst in insts {
            if ctx.inst(inst).dead {
                continue;
            }
            match ctx.inst(inst).kind.clone() {
                InstKind::BinaryOp { dest, op, lhs, rhs } => {
                    let (Some(a), Some(b)) =
                        (ctx.value(lhs).as_const_int(), ctx.value(rhs).as_const_int())
                    else {
                        continue;
                    };
                    let ty = ctx.value(lhs).ty;
                    debug_assert_eq!(ty, ctx.value(rhs).ty);
                    debug_assert!(ty.is_integer());

                    let result = evaluate(op, a, b, ty)?;
                    let konst = ctx.const_int(ty, result);
                    ctx.remove_inst(inst);
                    ctx.replace_references(dest, konst);
                    changed = true;
                }
                InstKind::Tag { dest, src } => {
                    let Some(raw) = ctx.value(src).as_const_int() else {
                        continue;
                    };
                    let konst =
                        ctx.const_int(ValueType::BoxOrInt, raw.wrapping_mul(2).wrapping_add(1));
                    ctx.remove_inst(inst);
                    ctx.replace_references(dest, konst);
                    changed = true;
                }
                InstKind::Untag { dest, src } => {
                    let Some(tagged) = ctx.value(src).as_const_int() else {
                        continue;
                    };
                    let konst = ctx.const_int(ValueType::I64, tagged >> 1);
                    ctx.remove_inst(inst);
                    ctx.replace_references(dest, konst);
                    changed = true;
                }
                InstKind::Copy { dest, src } => {
                    let Some(value) = ctx.value(src).as_const_int() else {
                        continue;
                    };
                    let from = ctx.value(src).ty;
                    let to = ctx.value(dest).ty;
                    let konst = ctx.const_int(to, convert(value, from, to));
                    ctx.remove_inst(inst);
                    ctx.replace_references(dest, konst);
                    changed = true;
                }
                _ => {}
            }
        }
    }

    if changed {
        debug!(function = ?func, "folded constants");
    }
    Ok(changed)
}

/// Evaluate `a op b` in `ty`, wrapping at the declared width. Signed
/// and unsigned semantics differ only for division and remainder.
pub fn evaluate(op: BinOp, a: i64, b: i64, ty: ValueType) -> Result<i64, CompileError> {
    let ua = a as u64;
    let ub = b as u64;

    let wide = match op {
        BinOp::Add => ua.wrapping_add(ub),
        BinOp::Sub => ua.wrapping_sub(ub),
        BinOp::Mul => ua.wrapping_mul(ub),
        BinOp::And => ua & ub,
        BinOp::Shl => {
            if ub >= 64 {
                return Err(CodegenError::new("constant shift amount out of range").into());
            }
            ua.wrapping_shl(ub as u32)
        }
        BinOp::Shr => {
            if ub >= 64 {
                return Err(CodegenError::new("constant shift amount out of range").into());
            }
            // Arithmetic shift; the builder rejects unsigned >>.
            (a >> ub) as u64
        }
        BinOp::Div | BinOp::Mod => {
            // The divisor is zero when it is zero at the declared
            // width, not just as a full word.
            if narrow(ub, ty.bits()) == 0 {
                return Err(CodegenError::new("division by zero in constant expression").into());
            }
            if ty.is_signed() {
                let sa = sign_extend(ua, ty.bits());
                let sb = sign_extend(ub, ty.bits());
                if op == BinOp::Div {
                    sa.wrapping_div(sb) as u64
                } else {
                    sa.wrapping_rem(sb) as u64
                }
            } else {
                let na = narrow(ua, ty.bits());
                let nb = narrow(ub, ty.bits());
                if op == BinOp::Div {
                    na / nb
                } else {
                    na % nb
                }
            }
        }
    };

    Ok(narrow(wide, ty.bits()) as i64)
}

/// Truncate to the declared width, keeping the low bits.
fn narrow(value: u64, bits: u8) -> u64 {
    match bits {
        64 => value,
        32 => value as u32 as u64,
        16 => value as u16 as u64,
        8 => value as u8 as u64,
        _ => unreachable!("unsupported bit width"),
    }
}

fn sign_extend(value: u64, bits: u8) -> i64 {
    match bits {
        64 => value as i64,
        32 => value as u32 as i32 as i64,
        16 => value as u16 as i16 as i64,
        8 => value as u8 as i8 as i64,
        _ => unreachable!("unsupported bit width"),
    }
}

/// Re-type a constant across a copy, extending or truncating as the
/// destination width requires.
fn convert(value: i64, from: ValueType, to: ValueType) -> i64 {
    if to.bits() >= from.bits() {
        if from.is_signed() {
            sign_extend(value as u64, from.bits())
        } else {
            narrow(value as u64, from.bits()) as i64
        }
    } else {
        narrow(value as u64, to.bits()) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn addition_wraps_at_width(a: i64, b: i64) -> bool {
        let r8 = evaluate(BinOp::Add, a, b, ValueType::U8).unwrap();
        let r32 = evaluate(BinOp::Add, a, b, ValueType::U32).unwrap();
        r8 == (a as u8).wrapping_add(b as u8) as i64
            && r32 == (a as u32).wrapping_add(b as u32) as i64
    }

    #[quickcheck]
    fn multiplication_wraps_at_width(a: i64, b: i64) -> bool {
        let r16 = evaluate(BinOp::Mul, a, b, ValueType::U16).unwrap();
        let r64 = evaluate(BinOp::Mul, a, b, ValueType::I64).unwrap();
        r16 == (a as u16).wrapping_mul(b as u16) as i64
            && r64 == a.wrapping_mul(b)
    }

    #[quickcheck]
    fn division_honors_signedness(a: i64, b: i64) -> bool {
        if b as i32 == 0 {
            return true;
        }
        let signed = evaluate(BinOp::Div, a, b, ValueType::I32).unwrap();
        let unsigned = evaluate(BinOp::Div, a, b, ValueType::U32).unwrap();
        signed == ((a as i32).wrapping_div(b as i32)) as u32 as i64
            && unsigned == ((a as u32) / (b as u32)) as i64
    }

    #[quickcheck]
    fn remainder_honors_signedness(a: i64, b: i64) -> bool {
        if b as i16 == 0 {
            return true;
        }
        let signed = evaluate(BinOp::Mod, a, b, ValueType::I16).unwrap();
        let unsigned = evaluate(BinOp::Mod, a, b, ValueType::U16).unwrap();
        signed == ((a as i16).wrapping_rem(b as i16)) as u16 as i64
            && unsigned == ((a as u16) % (b as u16)) as i64
    }

    #[test]
    fn division_by_zero_is_rejected() {
        assert!(evaluate(BinOp::Div, 1, 0, ValueType::I64).is_err());
        assert!(evaluate(BinOp::Mod, 1, 0, ValueType::U8).is_err());
    }
}
