//! Lowering from TAC to machine IR
//!
//! One pass per function in IR order. Operand legalization for the
//! x86-64 (macOS) quirks happens here: no `MOV reg, [addr64]`, no
//! 64-bit immediate stores, no `CMP imm, imm`, no `IMUL r8, r8`, and
//! division pinned to RAX/RDX.

use crate::consts::{C_REGISTER_ARGS, WORD_SIZE};
use crate::error::{CodegenError, CompileError};
use crate::ir::context::IrContext;
use crate::ir::inst::{BinOp, CmpOp, InstKind};
use crate::ir::value::{ValueId, ValueKind, ValueType};
use crate::machine::inst::{
    HwReg, MachineFunction, MachineInst, MachineModule, MachineOperand, MbbId, Opcode, VregId,
};
use crate::mangle::mangle;

use std::collections::BTreeMap;

/// Lower every function in the context.
pub fn lower_module(ctx: &IrContext) -> Result<MachineModule, CompileError> {
    let mut module = MachineModule::default();

    for &func in &ctx.functions {
        module.functions.push(lower_function(ctx, func)?);
    }
    for &global in &ctx.globals {
        let name = ctx.value(global).name.as_deref().unwrap_or("?");
        module.globals.push(mangle(name));
    }
    for (value, contents) in &ctx.static_strings {
        let name = ctx.value(*value).name.as_deref().unwrap_or("?");
        module.static_strings.push((mangle(name), contents.clone()));
    }
    for &ext in &ctx.externs {
        let name = ctx.value(ext).name.as_deref().unwrap_or("?");
        module.externs.push(name.to_string());
    }

    Ok(module)
}

/// Lower one function to machine IR.
pub fn lower_function(ctx: &IrContext, func: ValueId) -> Result<MachineFunction, CompileError> {
    let name = ctx.value(func).name.clone().unwrap_or_default();
    let mut f = MachineFunction::new(&name);

    let vrsp = f.create_precolored(HwReg::Rsp, ValueType::U64);
    let vrbp = f.create_precolored(HwReg::Rbp, ValueType::U64);

    let mut lowerer = Lowerer {
        ctx,
        f,
        vregs: BTreeMap::new(),
        blocks: BTreeMap::new(),
        params: BTreeMap::new(),
        cur: MbbId(0),
        vrsp,
        vrbp,
    };

    // Parameters live above the saved frame pointer and return
    // address, pushed right-to-left by the caller.
    let params = ctx.value(func).function().params.clone();
    for (i, param) in params.iter().enumerate() {
        let ty = ctx.value(*param).ty;
        lowerer.params.insert(
            *param,
            MachineOperand::Stack {
                offset: (2 * WORD_SIZE + WORD_SIZE * i as i64) as i32,
                ty,
            },
        );
    }

    let blocks = ctx.value(func).function().blocks.clone();
    for (index, &block) in blocks.iter().enumerate() {
        lowerer.cur = lowerer.get_block(block);

        if index == 0 {
            let rbp = MachineOperand::Vreg(vrbp);
            let rsp = MachineOperand::Vreg(vrsp);
            lowerer.emit(Opcode::Push, vec![], vec![rbp.clone()]);
            lowerer.emit_mov_rd(rbp, rsp)?;
        }

        let insts = ctx.value(block).block().insts.clone();
        for inst in insts {
            let kind = ctx.inst(inst).kind.clone();
            lowerer.lower_inst(&kind)?;
        }
    }

    Ok(lowerer.f)
}

struct Lowerer<'a> {
    ctx: &'a IrContext,
    f: MachineFunction,
    vregs: BTreeMap<ValueId, VregId>,
    blocks: BTreeMap<ValueId, MbbId>,
    params: BTreeMap<ValueId, MachineOperand>,
    cur: MbbId,
    vrsp: VregId,
    vrbp: VregId,
}

/// Whether a 64-bit immediate sign-extends from 32 bits.
fn is_32bit(x: i64) -> bool {
    x == (x as i32) as i64
}

impl<'a> Lowerer<'a> {
    fn emit(&mut self, opcode: Opcode, outputs: Vec<MachineOperand>, inputs: Vec<MachineOperand>) {
        self.f.blocks[self.cur.index()].insts.push(MachineInst {
            opcode,
            outputs,
            inputs,
        });
    }

    fn get_block(&mut self, block: ValueId) -> MbbId {
        if let Some(&mbb) = self.blocks.get(&block) {
            return mbb;
        }
        let seq = self.ctx.value(block).seq.unwrap_or(-1);
        let mbb = self.f.create_block(seq);
        self.blocks.insert(block, mbb);
        mbb
    }

    /// The machine operand for an IR value.
    fn operand(&mut self, value: ValueId) -> Result<MachineOperand, CompileError> {
        let v = self.ctx.value(value);
        match &v.kind {
            ValueKind::ConstInt(c) => Ok(MachineOperand::Imm {
                value: *c,
                ty: v.ty,
            }),
            ValueKind::Global(_) => Ok(MachineOperand::Address {
                name: v.name.clone().unwrap_or_default(),
                ty: v.ty,
                clinkage: false,
            }),
            ValueKind::Function(data) => Ok(MachineOperand::Address {
                name: v.name.clone().unwrap_or_default(),
                ty: v.ty,
                clinkage: data.is_extern,
            }),
            ValueKind::Local => {
                Err(CodegenError::new("local variable reached machine lowering").into())
            }
            ValueKind::Argument => Ok(self.params[&value].clone()),
            ValueKind::Block(_) => {
                let mbb = self.get_block(value);
                Ok(MachineOperand::Label(mbb))
            }
            ValueKind::Temp => {
                if let Some(&vreg) = self.vregs.get(&value) {
                    return Ok(MachineOperand::Vreg(vreg));
                }
                let vreg = self.f.create_vreg(v.ty);
                self.vregs.insert(value, vreg);
                Ok(MachineOperand::Vreg(vreg))
            }
        }
    }

    fn size(&self, operand: &MachineOperand) -> u8 {
        self.f.operand_size(operand)
    }

    fn ty(&self, operand: &MachineOperand) -> ValueType {
        self.f.operand_type(operand)
    }

    fn precolored(&mut self, reg: HwReg, ty: ValueType) -> MachineOperand {
        MachineOperand::Vreg(self.f.create_precolored(reg, ty))
    }

    /// Move into a register, legalizing the source as needed.
    fn emit_mov_rd(
        &mut self,
        dest: MachineOperand,
        src: MachineOperand,
    ) -> Result<(), CompileError> {
        debug_assert!(dest.is_register());

        if src.is_address() {
            // MOV reg, addr64 is rejected by the macOS assembler.
            debug_assert_eq!(self.size(&dest), 64);
            self.emit(Opcode::Lea, vec![dest], vec![src]);
        } else if src.is_register() {
            if self.size(&dest) <= self.size(&src) {
                self.emit(Opcode::MovRd, vec![dest], vec![src]);
            } else if self.ty(&src).is_signed() {
                self.emit(Opcode::Movsx, vec![dest], vec![src]);
            } else {
                self.emit(Opcode::Movzx, vec![dest], vec![src]);
            }
        } else if let MachineOperand::Imm { value, .. } = src {
            let dest_ty = self.ty(&dest);
            let src = if self.size(&dest) < self.size(&src) {
                let narrowed = match dest_ty.bits() {
                    32 => value as u32 as i64,
                    16 => value as u16 as i64,
                    8 => value as u8 as i64,
                    other => {
                        return Err(CodegenError::new(format!(
                            "unsupported move width {}",
                            other
                        ))
                        .into())
                    }
                };
                MachineOperand::Imm {
                    value: narrowed,
                    ty: dest_ty,
                }
            } else {
                src
            };
            self.emit(Opcode::MovRd, vec![dest], vec![src]);
        } else {
            return Err(CodegenError::new("unsupported move source").into());
        }
        Ok(())
    }

    /// Move into memory, materializing sources the encoding forbids.
    fn emit_mov_md(
        &mut self,
        base: MachineOperand,
        src: MachineOperand,
        offset: Option<MachineOperand>,
    ) -> Result<(), CompileError> {
        debug_assert!(base.is_address() || base.is_register() || base.is_stack());

        // MOV [mem], imm64 and MOV [mem], addr64 are illegal.
        let src = if src.is_address()
            || matches!(src.imm_value(), Some(v) if self.size(&src) == 64 && !is_32bit(v))
        {
            let tmp = MachineOperand::Vreg(self.f.create_vreg(self.ty(&src)));
            self.emit_mov_rd(tmp.clone(), src)?;
            tmp
        } else {
            src
        };

        match offset {
            Some(offset) => {
                debug_assert_eq!(self.size(&offset), 64);
                self.emit(Opcode::MovMd, vec![], vec![base, src, offset]);
            }
            None => self.emit(Opcode::MovMd, vec![], vec![base, src]),
        }
        Ok(())
    }

    fn lower_inst(&mut self, kind: &InstKind) -> Result<(), CompileError> {
        match kind {
            InstKind::BinaryOp { dest, op, lhs, rhs } => {
                self.lower_binary(*dest, *op, *lhs, *rhs)
            }
            InstKind::Copy { dest, src } => {
                let dest = self.operand(*dest)?;
                let src = self.operand(*src)?;
                self.emit_mov_rd(dest, src)
            }
            InstKind::Load { dest, src } => {
                let dest = self.operand(*dest)?;
                let base = self.operand(*src)?;
                self.emit(Opcode::MovRm, vec![dest], vec![base]);
                Ok(())
            }
            InstKind::Store { dest, src } => {
                let base = self.operand(*dest)?;
                let src = self.operand(*src)?;
                self.emit_mov_md(base, src, None)
            }
            InstKind::IndexedLoad { dest, base, offset } => {
                let dest = self.operand(*dest)?;
                let base = self.operand(*base)?;
                let offset = self.operand(*offset)?;
                self.emit(Opcode::MovRm, vec![dest], vec![base, offset]);
                Ok(())
            }
            InstKind::IndexedStore { base, offset, src } => {
                let base = self.operand(*base)?;
                let offset = self.operand(*offset)?;
                let src = self.operand(*src)?;
                self.emit_mov_md(base, src, Some(offset))
            }
            InstKind::Call {
                dest,
                target,
                args,
                regpass,
                ccall,
            } => self.lower_call(*dest, *target, args, *regpass, *ccall),
            InstKind::ConditionalJump {
                op,
                lhs,
                rhs,
                if_true,
                if_false,
            } => self.lower_cond_jump(*op, *lhs, *rhs, *if_true, *if_false),
            InstKind::JumpIf {
                cond,
                if_true,
                if_false,
            } => self.lower_jump_if(*cond, *if_true, *if_false),
            InstKind::Jump { target } => {
                let target = self.operand(*target)?;
                self.emit(Opcode::Jmp, vec![], vec![target]);
                Ok(())
            }
            InstKind::Return { value } => self.lower_return(*value),
            InstKind::Phi { .. } => {
                Err(CodegenError::new("phi reached machine lowering").into())
            }
            InstKind::Tag { dest, src } => {
                let dest = self.operand(*dest)?;
                let src = self.operand(*src)?;
                self.emit_mov_rd(dest.clone(), src)?;
                let one = MachineOperand::Imm {
                    value: 1,
                    ty: ValueType::U8,
                };
                self.emit(Opcode::Sal, vec![dest.clone()], vec![dest.clone(), one]);
                self.emit(Opcode::Inc, vec![dest.clone()], vec![dest]);
                Ok(())
            }
            InstKind::Untag { dest, src } => {
                let dest = self.operand(*dest)?;
                let src = self.operand(*src)?;
                self.emit_mov_rd(dest.clone(), src)?;
                let one = MachineOperand::Imm {
                    value: 1,
                    ty: ValueType::U8,
                };
                self.emit(Opcode::Sar, vec![dest.clone()], vec![dest, one]);
                Ok(())
            }
            InstKind::Memset {
                base,
                offset,
                count,
                value,
            } => self.lower_memset(*base, *offset, *count, *value),
            InstKind::Unreachable => Ok(()),
        }
    }

    fn lower_binary(
        &mut self,
        dest: ValueId,
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<(), CompileError> {
        let dest = self.operand(dest)?;
        let lhs = self.operand(lhs)?;
        let rhs = self.operand(rhs)?;

        debug_assert!(dest.is_register());
        debug_assert!(lhs.is_register() || lhs.is_immediate());
        debug_assert!(rhs.is_register() || rhs.is_immediate());

        match op {
            BinOp::Add => {
                self.emit_mov_rd(dest.clone(), lhs)?;
                self.emit(Opcode::Add, vec![dest.clone()], vec![dest, rhs]);
            }
            BinOp::Sub => {
                self.emit_mov_rd(dest.clone(), lhs)?;
                self.emit(Opcode::Sub, vec![dest.clone()], vec![dest, rhs]);
            }
            BinOp::And => {
                self.emit_mov_rd(dest.clone(), lhs)?;
                self.emit(Opcode::And, vec![dest.clone()], vec![dest, rhs]);
            }
            BinOp::Mul => {
                if self.size(&dest) == 8 {
                    // IMUL r8, r8 does not exist; go through AL.
                    let al = self.precolored(HwReg::Rax, self.ty(&dest));
                    self.emit_mov_rd(al.clone(), lhs)?;
                    self.emit(Opcode::Imul, vec![al.clone()], vec![al.clone(), rhs]);
                    self.emit_mov_rd(dest, al)?;
                } else {
                    self.emit_mov_rd(dest.clone(), lhs)?;
                    self.emit(Opcode::Imul, vec![dest.clone()], vec![dest, rhs]);
                }
            }
            BinOp::Shl | BinOp::Shr => {
                let amount = rhs.imm_value().ok_or_else(|| {
                    CodegenError::new("shift amount must be a compile-time constant")
                })?;
                if !(0..64).contains(&amount) {
                    return Err(CodegenError::new("shift amount out of range").into());
                }
                if op == BinOp::Shr && !self.ty(&lhs).is_signed() {
                    return Err(
                        CodegenError::new("unsigned right shift is not supported").into()
                    );
                }
                let opcode = if op == BinOp::Shl { Opcode::Sal } else { Opcode::Sar };
                self.emit_mov_rd(dest.clone(), lhs)?;
                self.emit(opcode, vec![dest.clone()], vec![dest, rhs]);
            }
            BinOp::Div | BinOp::Mod => self.lower_division(op, dest, lhs, rhs)?,
        }
        Ok(())
    }

    /// Division is pinned to RAX/RDX, with a separate dance for the
    /// 8-bit form where the remainder lands in AH.
    fn lower_division(
        &mut self,
        op: BinOp,
        dest: MachineOperand,
        lhs: MachineOperand,
        rhs: MachineOperand,
    ) -> Result<(), CompileError> {
        let ty = self.ty(&dest);
        debug_assert!(ty.is_integer());

        // No DIV/IDIV with an immediate operand.
        let rhs = if rhs.is_immediate() {
            let tmp = MachineOperand::Vreg(self.f.create_vreg(ty));
            self.emit_mov_rd(tmp.clone(), rhs)?;
            tmp
        } else {
            rhs
        };

        if self.size(&dest) != 8 {
            let vrax = self.precolored(HwReg::Rax, ty);
            let vrdx = self.precolored(HwReg::Rdx, ty);

            self.emit_mov_rd(vrax.clone(), lhs)?;

            if ty.is_signed() {
                self.emit(Opcode::Cqo, vec![vrdx.clone()], vec![vrax.clone()]);
                self.emit(
                    Opcode::Idiv,
                    vec![vrdx.clone(), vrax.clone()],
                    vec![vrdx.clone(), vrax.clone(), rhs],
                );
            } else {
                let zero = MachineOperand::Imm { value: 0, ty };
                self.emit_mov_rd(vrdx.clone(), zero)?;
                self.emit(
                    Opcode::Div,
                    vec![vrdx.clone(), vrax.clone()],
                    vec![vrdx.clone(), vrax.clone(), rhs],
                );
            }

            if op == BinOp::Div {
                self.emit_mov_rd(dest, vrax)?;
            } else {
                self.emit_mov_rd(dest, vrdx)?;
            }
        } else {
            let ax = self.precolored(HwReg::Rax, ValueType::U16);
            let al = self.precolored(HwReg::Rax, ty);

            // Zero- or sign-extends as the type requires.
            self.emit_mov_rd(ax.clone(), lhs)?;

            let opcode = if ty.is_signed() { Opcode::Idiv } else { Opcode::Div };
            if op == BinOp::Div {
                self.emit(opcode, vec![al.clone()], vec![ax, rhs]);
                self.emit_mov_rd(dest, al)?;
            } else {
                self.emit(opcode, vec![ax.clone()], vec![ax.clone(), rhs]);
                // No direct reference to AH: shift it down through AX.
                let eight = MachineOperand::Imm {
                    value: 8,
                    ty: ValueType::U8,
                };
                self.emit(Opcode::Sar, vec![al.clone()], vec![ax, eight]);
                self.emit_mov_rd(dest, al)?;
            }
        }
        Ok(())
    }

    fn lower_call(
        &mut self,
        dest: ValueId,
        target: ValueId,
        args: &[ValueId],
        regpass: bool,
        ccall: bool,
    ) -> Result<(), CompileError> {
        let dest = self.operand(dest)?;
        let target = self.operand(target)?;
        debug_assert!(dest.is_register());

        let vrax = self.precolored(HwReg::Rax, self.ty(&dest));

        if regpass {
            // C convention: the first six arguments ride in registers.
            if args.len() > C_REGISTER_ARGS {
                return Err(CodegenError::new(format!(
                    "C call with {} arguments; at most {} are supported",
                    args.len(),
                    C_REGISTER_ARGS
                ))
                .into());
            }

            let mut inputs: Vec<MachineOperand> = vec![target.clone()];
            for (i, &arg) in args.iter().enumerate() {
                let param = self.operand(arg)?;
                debug_assert!(
                    param.is_address() || param.is_immediate() || param.is_register()
                );
                let ty = self.ty(&param);
                let reg = self.precolored(HwReg::C_ARGS[i], ty);
                self.emit_mov_rd(reg.clone(), param)?;
                inputs.push(reg);
            }

            if ccall {
                // Indirect call so the runtime can switch to the C
                // stack; the real target rides in RAX.
                debug_assert!(target.is_address());
                let vrax2 = self.precolored(HwReg::Rax, ValueType::CodeAddress);
                self.emit_mov_rd(vrax2.clone(), target)?;
                inputs[0] = MachineOperand::Address {
                    name: "ccall".to_string(),
                    ty: ValueType::CodeAddress,
                    clinkage: true,
                };
                inputs.push(vrax2);
            }

            self.emit(Opcode::Call, vec![vrax.clone()], inputs);
            self.emit_mov_rd(dest, vrax)?;
        } else {
            // Native convention: everything on the stack, right to
            // left, 16-byte aligned.
            debug_assert!(!ccall);
            debug_assert!(target.is_address() || target.is_register());

            let mut params_on_stack = args.len();
            if params_on_stack % 2 == 1 {
                let pad = MachineOperand::Imm {
                    value: 0,
                    ty: ValueType::U64,
                };
                self.emit(Opcode::Push, vec![], vec![pad]);
                params_on_stack += 1;
            }

            for &arg in args.iter().rev() {
                let param = self.operand(arg)?;

                // There is no 64-bit immediate or address push.
                if param.is_address()
                    || matches!(param.imm_value(), Some(v) if self.size(&param) == 64 && !is_32bit(v))
                {
                    let tmp = MachineOperand::Vreg(self.f.create_vreg(self.ty(&param)));
                    self.emit_mov_rd(tmp.clone(), param)?;
                    self.emit(Opcode::Push, vec![], vec![tmp]);
                } else if param.is_register() || param.is_immediate() {
                    self.emit(Opcode::Push, vec![], vec![param]);
                } else {
                    return Err(
                        CodegenError::new("unsupported operand pushed to the stack").into()
                    );
                }
            }

            self.emit(Opcode::Call, vec![vrax.clone()], vec![target]);
            self.emit_mov_rd(dest, vrax)?;

            if params_on_stack > 0 {
                let rsp = MachineOperand::Vreg(self.vrsp);
                let amount = MachineOperand::Imm {
                    value: WORD_SIZE * params_on_stack as i64,
                    ty: ValueType::U64,
                };
                self.emit(Opcode::Add, vec![rsp.clone()], vec![rsp, amount]);
            }
        }
        Ok(())
    }

    fn lower_cond_jump(
        &mut self,
        op: CmpOp,
        lhs: ValueId,
        rhs: ValueId,
        if_true: ValueId,
        if_false: ValueId,
    ) -> Result<(), CompileError> {
        let lhs_ty = self.ctx.value(lhs).ty;
        let mut op = op;
        let mut lhs = self.operand(lhs)?;
        let mut rhs = self.operand(rhs)?;
        debug_assert!(lhs.is_register() || lhs.is_immediate());
        debug_assert!(rhs.is_register() || rhs.is_immediate());

        // CMP imm, imm is illegal; force the left side to a register.
        if lhs.is_immediate() && rhs.is_immediate() {
            let tmp = MachineOperand::Vreg(self.f.create_vreg(self.ty(&lhs)));
            self.emit_mov_rd(tmp.clone(), lhs)?;
            lhs = tmp;
        }

        // Immediates may only appear on the right.
        if lhs.is_immediate() {
            std::mem::swap(&mut lhs, &mut rhs);
            op = op.swapped();
        }

        // And they must sign-extend from 32 bits.
        if matches!(rhs.imm_value(), Some(v) if self.size(&rhs) == 64 && !is_32bit(v)) {
            let tmp = MachineOperand::Vreg(self.f.create_vreg(self.ty(&rhs)));
            self.emit_mov_rd(tmp.clone(), rhs)?;
            rhs = tmp;
        }

        self.emit(Opcode::Cmp, vec![], vec![lhs, rhs]);

        let if_true = self.operand(if_true)?;
        let if_false = self.operand(if_false)?;
        debug_assert!(if_true.is_label() && if_false.is_label());

        // Tagged words order like signed integers.
        let signed = lhs_ty.is_signed() || lhs_ty == ValueType::BoxOrInt;
        let opcode = match op {
            CmpOp::Eq => Opcode::Je,
            CmpOp::Ne => Opcode::Jne,
            CmpOp::Gt => {
                if signed {
                    Opcode::Jg
                } else {
                    Opcode::Ja
                }
            }
            CmpOp::Ge => {
                if signed {
                    Opcode::Jge
                } else {
                    Opcode::Jae
                }
            }
            CmpOp::Lt => {
                if signed {
                    Opcode::Jl
                } else {
                    Opcode::Jb
                }
            }
            CmpOp::Le => {
                if signed {
                    Opcode::Jle
                } else {
                    Opcode::Jbe
                }
            }
        };

        self.emit(opcode, vec![], vec![if_true]);
        self.emit(Opcode::Jmp, vec![], vec![if_false]);
        Ok(())
    }

    fn lower_jump_if(
        &mut self,
        cond: ValueId,
        if_true: ValueId,
        if_false: ValueId,
    ) -> Result<(), CompileError> {
        let cond = self.operand(cond)?;
        let if_true = self.operand(if_true)?;
        let if_false = self.operand(if_false)?;
        debug_assert!(cond.is_register() || cond.is_immediate());
        debug_assert!(if_true.is_label() && if_false.is_label());

        // CMP imm, imm is illegal; a constant condition is just a jump.
        if let Some(value) = cond.imm_value() {
            let target = if value == 1 { if_true } else { if_false };
            self.emit(Opcode::Jmp, vec![], vec![target]);
        } else {
            let one = MachineOperand::Imm {
                value: 1,
                ty: ValueType::I64,
            };
            self.emit(Opcode::Cmp, vec![], vec![cond, one]);
            self.emit(Opcode::Je, vec![], vec![if_true]);
            self.emit(Opcode::Jmp, vec![], vec![if_false]);
        }
        Ok(())
    }

    fn lower_return(&mut self, value: Option<ValueId>) -> Result<(), CompileError> {
        let rsp = MachineOperand::Vreg(self.vrsp);
        let rbp = MachineOperand::Vreg(self.vrbp);

        match value {
            Some(value) => {
                let value = self.operand(value)?;
                debug_assert!(
                    value.is_register() || value.is_immediate() || value.is_address()
                );
                let vrax = self.precolored(HwReg::Rax, self.ty(&value));
                self.emit_mov_rd(vrax.clone(), value)?;
                self.emit_mov_rd(rsp, rbp.clone())?;
                self.emit(Opcode::Pop, vec![rbp], vec![]);
                self.emit(Opcode::Ret, vec![], vec![vrax]);
            }
            None => {
                self.emit_mov_rd(rsp, rbp.clone())?;
                self.emit(Opcode::Pop, vec![rbp], vec![]);
                self.emit(Opcode::Ret, vec![], vec![]);
            }
        }
        Ok(())
    }

    /// `REP STOS` with RDI/RCX/RAX pinned. The destination may point
    /// into the interior of an object, so it stays a raw word.
    fn lower_memset(
        &mut self,
        base: ValueId,
        offset: ValueId,
        count: ValueId,
        value: ValueId,
    ) -> Result<(), CompileError> {
        let base = self.operand(base)?;
        let offset = self.operand(offset)?;
        let count = self.operand(count)?;
        let value = self.operand(value)?;

        let vrdi = self.precolored(HwReg::Rdi, ValueType::U64);
        self.emit_mov_rd(vrdi.clone(), base)?;
        self.emit(Opcode::Add, vec![vrdi.clone()], vec![vrdi.clone(), offset]);

        let vrcx = self.precolored(HwReg::Rcx, ValueType::U64);
        self.emit_mov_rd(vrcx.clone(), count)?;

        let value_ty = self.ty(&value);
        let vrax = self.precolored(HwReg::Rax, value_ty);
        self.emit_mov_rd(vrax.clone(), value)?;

        self.emit(Opcode::RepStos, vec![], vec![vrdi, vrcx, vrax]);
        Ok(())
    }
}
