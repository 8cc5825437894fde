//! x86-64 machine IR and back-end passes

pub mod inst;
pub mod lower;
pub mod peephole;
pub mod regalloc;

pub use inst::{
    HwReg, MachineBlock, MachineFunction, MachineInst, MachineModule, MachineOperand, MbbId,
    Opcode, RegSet, VregId,
};
pub use lower::{lower_function, lower_module};
pub use peephole::eliminate_redundant_moves;
pub use regalloc::allocate;
