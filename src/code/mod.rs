//! The JVM instruction set
//!
//! One closed sum covers every instruction, with operand families collapsed the way the wire
//! format thinks of them rather than one variant per opcode byte:
//!
//!   - the `wide` prefix never shows up; it is folded into the `u16` operands of the
//!     instructions it modifies
//!   - short forms (`iload_0`, `iconst_2`, `ldc` vs `ldc_w`) are picked at encode time
//!   - comparisons and shifts are parameterised (`If(OrdComparison, _)` covers `ifeq` through
//!     `ifle`)
//!
//! Branch instructions carry an `Option<i32>` relative offset: `Some` when the instruction is
//! raw (straight from the wire, or deliberately unbound), `None` once the offset has been
//! replaced by a CFG edge that owns the target.

mod insn;

pub use insn::*;
