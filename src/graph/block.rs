use crate::code::Instruction;
use std::fmt;

/// Identifies a block within one [`crate::graph::InsnGraph`]
///
/// Labels are plain integers (the graph is an arena keyed by label, edges hold labels rather
/// than references) with two reserved values for the return and rethrow singletons.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Label(pub i32);

impl Label {
    /// The synthetic block every `*return` instruction falls through to
    pub const RETURN: Label = Label(-1);

    /// The synthetic block every `athrow` instruction falls through to
    pub const RETHROW: Label = Label(-2);

    pub fn is_return(&self) -> bool {
        *self == Label::RETURN
    }

    pub fn is_rethrow(&self) -> bool {
        *self == Label::RETHROW
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Label::RETURN => write!(f, "return"),
            Label::RETHROW => write!(f, "rethrow"),
            Label(n) => write!(f, "l{}", n),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An extended basic block: a maximal straight-line run of instructions
///
/// Terminators (jumps, switches, returns, `athrow`) do not live in the instruction list; they
/// live on the outgoing edges that they create. A block's instruction list therefore contains
/// only straight-line instructions, except for preserved unbound jumps from obfuscated input.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub label: Label,
    pub instructions: Vec<Instruction>,

    /// May the assembler replicate this block at each incoming call site instead of reaching
    /// it with a jump? Set on `jsr` fallthrough targets (which must be splice points) and
    /// settable by operators on any block.
    pub inline: bool,
}

impl Block {
    pub fn new(label: Label) -> Block {
        Block {
            label,
            instructions: vec![],
            inline: false,
        }
    }

    pub fn with_instructions(label: Label, instructions: Vec<Instruction>) -> Block {
        Block {
            label,
            instructions,
            inline: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}
