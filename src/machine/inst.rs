//! Machine instruction and operand model

use crate::consts::AVAILABLE_COLORS;
use crate::ir::value::ValueType;

use bitflags::bitflags;
use std::fmt;

/// An x86-64 general-purpose register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HwReg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl HwReg {
    /// Color order used by the allocator: caller-save registers come
    /// first so short-lived values avoid callee-save traffic. `rsp`
    /// and `rbp` are absent; they are never allocated.
    pub const ALLOCATION_ORDER: [HwReg; AVAILABLE_COLORS] = [
        HwReg::Rax,
        HwReg::Rcx,
        HwReg::Rdx,
        HwReg::Rsi,
        HwReg::Rdi,
        HwReg::R8,
        HwReg::R9,
        HwReg::R10,
        HwReg::R11,
        HwReg::Rbx,
        HwReg::R12,
        HwReg::R13,
        HwReg::R14,
        HwReg::R15,
    ];

    /// Registers the System V ABI lets a callee clobber.
    pub const CALLER_SAVE: [HwReg; 9] = [
        HwReg::Rax,
        HwReg::Rcx,
        HwReg::Rdx,
        HwReg::Rsi,
        HwReg::Rdi,
        HwReg::R8,
        HwReg::R9,
        HwReg::R10,
        HwReg::R11,
    ];

    /// Argument registers of the C calling convention, in order.
    pub const C_ARGS: [HwReg; 6] = [
        HwReg::Rdi,
        HwReg::Rsi,
        HwReg::Rdx,
        HwReg::Rcx,
        HwReg::R8,
        HwReg::R9,
    ];

    /// The allocator color of this register, or `None` for the two
    /// reserved registers.
    pub fn color(self) -> Option<usize> {
        Self::ALLOCATION_ORDER.iter().position(|&r| r == self)
    }

    pub const fn name(self) -> &'static str {
        match self {
            HwReg::Rax => "rax",
            HwReg::Rbx => "rbx",
            HwReg::Rcx => "rcx",
            HwReg::Rdx => "rdx",
            HwReg::Rsi => "rsi",
            HwReg::Rdi => "rdi",
            HwReg::Rsp => "rsp",
            HwReg::Rbp => "rbp",
            HwReg::R8 => "r8",
            HwReg::R9 => "r9",
            HwReg::R10 => "r10",
            HwReg::R11 => "r11",
            HwReg::R12 => "r12",
            HwReg::R13 => "r13",
            HwReg::R14 => "r14",
            HwReg::R15 => "r15",
        }
    }

    const fn bit(self) -> u16 {
        1 << self as u16
    }
}

impl fmt::Display for HwReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// A set of hardware registers.
    pub struct RegSet: u16 {
        const RAX = HwReg::Rax.bit();
        const RBX = HwReg::Rbx.bit();
        const RCX = HwReg::Rcx.bit();
        const RDX = HwReg::Rdx.bit();
        const RSI = HwReg::Rsi.bit();
        const RDI = HwReg::Rdi.bit();
        const RSP = HwReg::Rsp.bit();
        const RBP = HwReg::Rbp.bit();
        const R8 = HwReg::R8.bit();
        const R9 = HwReg::R9.bit();
        const R10 = HwReg::R10.bit();
        const R11 = HwReg::R11.bit();
        const R12 = HwReg::R12.bit();
        const R13 = HwReg::R13.bit();
        const R14 = HwReg::R14.bit();
        const R15 = HwReg::R15.bit();
    }
}

impl RegSet {
    pub fn caller_save() -> Self {
        HwReg::CALLER_SAVE
            .iter()
            .fold(RegSet::empty(), |set, &r| set | RegSet::of(r))
    }

    pub fn of(reg: HwReg) -> Self {
        RegSet::from_bits_truncate(reg.bit())
    }

    pub fn has(self, reg: HwReg) -> bool {
        self.contains(RegSet::of(reg))
    }
}

/// Handle to a virtual register within one [`MachineFunction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VregId(pub(crate) u32);

impl VregId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VregId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%vreg{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct VregData {
    pub ty: ValueType,
    pub precolor: Option<HwReg>,
}

/// Handle to a machine basic block within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MbbId(pub(crate) u32);

impl MbbId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Machine opcodes. `MovRd` writes a register, `MovRm` reads memory,
/// `MovMd` writes memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Add,
    And,
    Call,
    Cmp,
    Cqo,
    Div,
    Idiv,
    Imul,
    Inc,
    Ja,
    Jae,
    Jb,
    Jbe,
    Je,
    Jg,
    Jge,
    Jl,
    Jle,
    Jmp,
    Jne,
    Lea,
    MovMd,
    MovRd,
    MovRm,
    Movsx,
    Movzx,
    Pop,
    Push,
    RepStos,
    Ret,
    Sal,
    Sar,
    Sub,
}

impl Opcode {
    pub const fn name(self) -> &'static str {
        match self {
            Opcode::Add => "ADD",
            Opcode::And => "AND",
            Opcode::Call => "CALL",
            Opcode::Cmp => "CMP",
            Opcode::Cqo => "CQO",
            Opcode::Div => "DIV",
            Opcode::Idiv => "IDIV",
            Opcode::Imul => "IMUL",
            Opcode::Inc => "INC",
            Opcode::Ja => "JA",
            Opcode::Jae => "JAE",
            Opcode::Jb => "JB",
            Opcode::Jbe => "JBE",
            Opcode::Je => "JE",
            Opcode::Jg => "JG",
            Opcode::Jge => "JGE",
            Opcode::Jl => "JL",
            Opcode::Jle => "JLE",
            Opcode::Jmp => "JMP",
            Opcode::Jne => "JNE",
            Opcode::Lea => "LEA",
            Opcode::MovMd => "MOVmd",
            Opcode::MovRd => "MOVrd",
            Opcode::MovRm => "MOVrm",
            Opcode::Movsx => "MOVSX",
            Opcode::Movzx => "MOVZX",
            Opcode::Pop => "POP",
            Opcode::Push => "PUSHQ",
            Opcode::RepStos => "REP STOS",
            Opcode::Ret => "RET",
            Opcode::Sal => "SAL",
            Opcode::Sar => "SAR",
            Opcode::Sub => "SUB",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A machine operand. Every operand carries a [`ValueType`], from
/// which its bit size derives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineOperand {
    /// Colorable register, possibly precolored.
    Vreg(VregId),
    /// An assigned hardware register.
    Hreg { reg: HwReg, ty: ValueType },
    Imm { value: i64, ty: ValueType },
    /// `[rbp + offset]`: negative offsets are spill slots, positive
    /// offsets are stack parameters.
    Stack { offset: i32, ty: ValueType },
    /// The address of a global, static, or function symbol.
    Address {
        name: String,
        ty: ValueType,
        clinkage: bool,
    },
    Label(MbbId),
}

impl MachineOperand {
    pub fn is_register(&self) -> bool {
        matches!(self, MachineOperand::Vreg(_) | MachineOperand::Hreg { .. })
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, MachineOperand::Imm { .. })
    }

    pub fn is_address(&self) -> bool {
        matches!(self, MachineOperand::Address { .. })
    }

    pub fn is_stack(&self) -> bool {
        matches!(self, MachineOperand::Stack { .. })
    }

    pub fn is_label(&self) -> bool {
        matches!(self, MachineOperand::Label(_))
    }

    pub fn imm_value(&self) -> Option<i64> {
        match self {
            MachineOperand::Imm { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn vreg(&self) -> Option<VregId> {
        match self {
            MachineOperand::Vreg(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for MachineOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineOperand::Vreg(id) => write!(f, "{}", id),
            MachineOperand::Hreg { reg, .. } => write!(f, "%{}", reg),
            MachineOperand::Imm { value, .. } => write!(f, "{}", value),
            MachineOperand::Stack { offset, .. } => {
                if *offset < 0 {
                    write!(f, "[rbp - {}]", -offset)
                } else {
                    write!(f, "[rbp + {}]", offset)
                }
            }
            MachineOperand::Address { name, .. } => write!(f, "@{}", name),
            MachineOperand::Label(id) => write!(f, ".L{}", id.0),
        }
    }
}

/// One machine instruction: an opcode with ordered output and input
/// operand lists.
#[derive(Debug, Clone)]
pub struct MachineInst {
    pub opcode: Opcode,
    pub outputs: Vec<MachineOperand>,
    pub inputs: Vec<MachineOperand>,
}

impl fmt::Display for MachineInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, operands: &[MachineOperand]) -> fmt::Result {
            if operands.is_empty() {
                return f.write_str("{}");
            }
            write!(f, "{}", operands[0])?;
            for op in &operands[1..] {
                write!(f, ", {}", op)?;
            }
            Ok(())
        }

        list(f, &self.outputs)?;
        write!(f, " = {} ", self.opcode)?;
        list(f, &self.inputs)
    }
}

/// A machine basic block.
#[derive(Debug, Clone)]
pub struct MachineBlock {
    /// Sequence number inherited from the IR block, for stable labels.
    pub seq: i64,
    pub insts: Vec<MachineInst>,
}

/// A lowered function.
#[derive(Debug, Clone)]
pub struct MachineFunction {
    pub name: String,
    pub blocks: Vec<MachineBlock>,
    pub(crate) vregs: Vec<VregData>,
    /// Spill slots assigned by the allocator.
    pub stack_slots: usize,
}

impl MachineFunction {
    pub fn new(name: &str) -> Self {
        MachineFunction {
            name: name.to_string(),
            blocks: Vec::new(),
            vregs: Vec::new(),
            stack_slots: 0,
        }
    }

    pub fn create_block(&mut self, seq: i64) -> MbbId {
        let id = MbbId(self.blocks.len() as u32);
        self.blocks.push(MachineBlock {
            seq,
            insts: Vec::new(),
        });
        id
    }

    pub fn create_vreg(&mut self, ty: ValueType) -> VregId {
        let id = VregId(self.vregs.len() as u32);
        self.vregs.push(VregData { ty, precolor: None });
        id
    }

    /// A virtual register constrained to `reg` before allocation.
    pub fn create_precolored(&mut self, reg: HwReg, ty: ValueType) -> VregId {
        let id = VregId(self.vregs.len() as u32);
        self.vregs.push(VregData {
            ty,
            precolor: Some(reg),
        });
        id
    }

    pub fn vreg_type(&self, id: VregId) -> ValueType {
        self.vregs[id.index()].ty
    }

    pub fn precolor(&self, id: VregId) -> Option<HwReg> {
        self.vregs[id.index()].precolor
    }

    pub fn vreg_count(&self) -> usize {
        self.vregs.len()
    }

    /// Bit size of an operand, resolving virtual registers through the
    /// register table.
    pub fn operand_size(&self, operand: &MachineOperand) -> u8 {
        self.operand_type(operand).bits()
    }

    pub fn operand_type(&self, operand: &MachineOperand) -> ValueType {
        match operand {
            MachineOperand::Vreg(id) => self.vreg_type(*id),
            MachineOperand::Hreg { ty, .. }
            | MachineOperand::Imm { ty, .. }
            | MachineOperand::Stack { ty, .. }
            | MachineOperand::Address { ty, .. } => *ty,
            MachineOperand::Label(_) => ValueType::CodeAddress,
        }
    }
}

/// Everything the external assembly emitter needs for one compilation
/// unit.
#[derive(Debug, Clone, Default)]
pub struct MachineModule {
    pub functions: Vec<MachineFunction>,
    /// Surviving module-scope variables, by symbol name.
    pub globals: Vec<String>,
    /// Static strings: symbol name and contents.
    pub static_strings: Vec<(String, String)>,
    /// Extern symbols referenced by the module.
    pub externs: Vec<String>,
}
