//! Compiler-wide parameters

/* WORD AND HEAP LAYOUT */

/// Size of a machine word, in bytes. Every IR value is word-sized.
pub const WORD_SIZE: i64 = 8;

/// Byte offset of the first constructor field inside a heap block.
/// Offset zero holds the header word.
pub const FIELD_BASE_OFFSET: i64 = WORD_SIZE;

/// Bit position of the is-reference bitmap inside a constructor header.
/// The low half of the header holds the constructor discriminant.
pub const REFMASK_SHIFT: u32 = 32;

/// Mask selecting the discriminant bits of a constructor header.
pub const TAG_MASK: i64 = 0xFFFF_FFFF;

/* REGISTER ALLOCATION */

/// Hardware colors available to the allocator. `rsp` and `rbp` are
/// reserved and never allocated.
pub const AVAILABLE_COLORS: usize = 14;

/// C calling convention passes at most this many arguments in registers.
pub const C_REGISTER_ARGS: usize = 6;

/* RUNTIME ABI */

/// Entry symbol of a compiled program.
pub const ENTRY_SYMBOL: &str = "encmain";

/// `die` code: `head` called on an empty list.
pub const ERR_HEAD_EMPTY: i64 = 0;

/// `die` code: `tail` called on an empty list.
pub const ERR_TAIL_EMPTY: i64 = 1;

/// `die` code: a reference count went negative.
pub const ERR_REF_NEG: i64 = 2;

/// `die` code: no specific message; used for non-exhaustive matches
/// and failed assertions.
pub const ERR_UNKNOWN: i64 = 3;
