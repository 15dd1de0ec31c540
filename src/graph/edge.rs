use super::Label;
use crate::classfile::Constant;
use crate::code::Instruction;
use std::fmt;

/// A typed control-flow transfer between two blocks
///
/// `to` is `None` only for opaque edges: a `ret` whose target is unknown until subroutine
/// resolution rewrites it.
#[derive(Clone, Debug, PartialEq)]
pub struct Edge {
    pub from: Label,
    pub to: Option<Label>,
    pub kind: EdgeKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EdgeKind {
    /// Flow continues into the next block with no jump
    ///
    /// Edges into the return/rethrow singletons carry the terminator (`ireturn`, `athrow`, ...)
    /// that produced them.
    Fallthrough { instruction: Option<Instruction> },

    /// An explicit jump (conditional or not)
    Jump { instruction: Instruction },

    /// The jump half of a `jsr`: flow enters the subroutine
    JsrJump { instruction: Instruction },

    /// The fallthrough half of a `jsr`: where the subroutine's `ret` comes back to
    JsrFallthrough { instruction: Instruction },

    /// A `ret`; opaque until the matching `jsr` is resolved
    Ret { instruction: Instruction },

    /// One case (or the default) of a `tableswitch`/`lookupswitch`
    ///
    /// `value` is the case key, `None` for the default case.
    Switch {
        instruction: Instruction,
        value: Option<i32>,
    },

    /// The block is covered by an exception handler
    Exception {
        /// Position in the handler table; lower values are tried first
        priority: u16,

        /// Caught class (`None` catches everything, ie. `java/lang/Throwable`)
        throwable: Option<Constant>,

        /// Should the emitted exception range extend over inlined copies of targets spliced
        /// after this block?
        inline_coverage: bool,
    },
}

impl Edge {
    pub fn fallthrough(from: Label, to: Label) -> Edge {
        Edge {
            from,
            to: Some(to),
            kind: EdgeKind::Fallthrough { instruction: None },
        }
    }

    pub fn terminator(from: Label, to: Label, instruction: Instruction) -> Edge {
        Edge {
            from,
            to: Some(to),
            kind: EdgeKind::Fallthrough {
                instruction: Some(instruction),
            },
        }
    }

    pub fn jump(from: Label, to: Option<Label>, instruction: Instruction) -> Edge {
        Edge {
            from,
            to,
            kind: EdgeKind::Jump { instruction },
        }
    }

    /// The jump or terminator instruction this edge carries, if any
    pub fn instruction(&self) -> Option<&Instruction> {
        match &self.kind {
            EdgeKind::Fallthrough { instruction } => instruction.as_ref(),
            EdgeKind::Jump { instruction }
            | EdgeKind::JsrJump { instruction }
            | EdgeKind::JsrFallthrough { instruction }
            | EdgeKind::Ret { instruction }
            | EdgeKind::Switch { instruction, .. } => Some(instruction),
            EdgeKind::Exception { .. } => None,
        }
    }

    /// Is this edge opaque (target unknown until subroutine resolution)?
    pub fn is_opaque(&self) -> bool {
        self.to.is_none()
    }

    /// How many parallel edges of this kind may leave one block (`None` = unbounded)
    pub fn limit(&self) -> Option<usize> {
        match self.kind {
            EdgeKind::Fallthrough { .. } => Some(1),
            EdgeKind::Jump { .. } => Some(1),
            EdgeKind::JsrJump { .. } => Some(1),
            EdgeKind::JsrFallthrough { .. } => Some(1),
            EdgeKind::Ret { .. } => Some(1),
            EdgeKind::Switch { .. } => None,
            EdgeKind::Exception { .. } => None,
        }
    }

    /// Do two edges count against the same multiplicity limit?
    pub fn same_kind(&self, other: &Edge) -> bool {
        std::mem::discriminant(&self.kind) == std::mem::discriminant(&other.kind)
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let to = match self.to {
            Some(to) => format!("{}", to),
            None => String::from("unknown"),
        };
        match &self.kind {
            EdgeKind::Fallthrough { .. } => write!(f, "fallthrough {} -> {}", self.from, to),
            EdgeKind::Jump { instruction } => {
                write!(f, "{:?} {} -> {}", instruction, self.from, to)
            }
            EdgeKind::JsrJump { .. } => write!(f, "jsr jump {} -> {}", self.from, to),
            EdgeKind::JsrFallthrough { .. } => {
                write!(f, "jsr fallthrough {} -> {}", self.from, to)
            }
            EdgeKind::Ret { .. } => write!(f, "ret {} -> {}", self.from, to),
            EdgeKind::Switch { value: Some(v), .. } => {
                write!(f, "switch value {} {} -> {}", v, self.from, to)
            }
            EdgeKind::Switch { value: None, .. } => {
                write!(f, "switch default {} -> {}", self.from, to)
            }
            EdgeKind::Exception { priority, .. } => {
                write!(f, "catch priority {} {} -> {}", priority, self.from, to)
            }
        }
    }
}
