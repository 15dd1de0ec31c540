use super::TraceContext;
use crate::classfile::Constant;
use crate::verifier::{ErrorKind, Source, VerificationType};
use std::collections::BTreeMap;

/// A value sitting on the stack or in a local
///
/// Entries are born when an instruction pushes or stores, are replaced (never mutated in place)
/// when an `invokespecial <init>` initializes them, and die when popped or overwritten. Identity
/// is the `id` within the originating frame lineage; equality is over the type together with
/// everything merged into the entry at control-flow joins.
#[derive(Clone, Debug)]
pub struct Entry<'g> {
    pub id: u32,

    /// What produced this value
    pub source: Source,

    pub ty: VerificationType<'g>,

    /// Literal value, when the producer was a constant instruction
    pub value: Option<Constant>,

    /// The entry this one was cast from, if any
    pub parent: Option<Box<Entry<'g>>>,

    /// Types merged into this entry at joins
    pub merges: Vec<VerificationType<'g>>,
}

impl<'g> Entry<'g> {
    fn type_closure(&self) -> Vec<VerificationType<'g>> {
        let mut types = vec![self.ty];
        for ty in &self.merges {
            if !types.contains(ty) {
                types.push(*ty);
            }
        }
        types
    }

    /// All the parents of this entry, nearest first
    pub fn parents(&self) -> Vec<&Entry<'g>> {
        let mut parents = vec![];
        let mut current = self.parent.as_deref();
        while let Some(entry) = current {
            parents.push(entry);
            current = entry.parent.as_deref();
        }
        parents
    }
}

/// Equality is type plus merge closure; `ReturnAddress` types carry their source, so subroutine
/// returns from different call sites never compare equal.
impl<'g> PartialEq for Entry<'g> {
    fn eq(&self, other: &Entry<'g>) -> bool {
        let ours = self.type_closure();
        let theirs = other.type_closure();
        ours.iter().all(|ty| theirs.contains(ty)) && theirs.iter().all(|ty| ours.contains(ty))
    }
}

impl<'g> Eq for Entry<'g> {}

/// One recorded access to a local
#[derive(Clone, Debug)]
pub struct LocalAccess<'g> {
    pub read: bool,
    pub index: u16,
    pub entry: Entry<'g>,
}

/// The recorded effect of one instruction on a frame
#[derive(Clone, Debug, Default)]
pub struct FrameDelta<'g> {
    pub source: Source,
    pub pops: Vec<Entry<'g>>,
    pub pushes: Vec<Entry<'g>>,
    pub swaps: usize,

    /// `(count, displace)` of each dup-family operation
    pub dups: Vec<(usize, usize)>,

    /// `(index, old, new)` per local write
    pub overwrites: Vec<(u16, Option<Entry<'g>>, Entry<'g>)>,
}

/// Immutable snapshot of a frame, used as a memoization key
///
/// Two snapshots match when their stacks agree pairwise and the requested locals agree; since
/// [`VerificationType::ReturnAddress`] embeds its source, type equality is exactly the
/// `_same_entry` discrimination the trace needs.
#[derive(Clone, Debug, PartialEq)]
pub struct FrozenFrame<'g> {
    pub stack: Vec<VerificationType<'g>>,
    pub locals: BTreeMap<u16, VerificationType<'g>>,
}

impl<'g> FrozenFrame<'g> {
    /// Does this snapshot agree with `other` on the stack and on the given locals?
    pub fn matches(&self, other: &FrozenFrame<'g>, live_locals: &[u16]) -> bool {
        if self.stack != other.stack {
            return false;
        }
        live_locals
            .iter()
            .all(|index| self.locals.get(index) == other.locals.get(index))
    }
}

/// The abstract-interpretation state at one execution point
///
/// The stack is top-last; the locals map is sparse, and a category 2 value at index `i` implies
/// a `Top` sentinel at `i + 1` (so lengths always reflect slot counts).
#[derive(Clone, Debug)]
pub struct Frame<'g> {
    pub stack: Vec<Entry<'g>>,
    pub locals: BTreeMap<u16, Entry<'g>>,

    pub max_stack: usize,
    pub max_locals: usize,

    /// Append-only log of local reads and writes
    pub accesses: Vec<LocalAccess<'g>>,

    /// Ids of entries that have been fully consumed (popped their last copy)
    pub consumed: Vec<u32>,

    next_entry_id: u32,
    delta: Option<FrameDelta<'g>>,
}

impl<'g> Frame<'g> {
    pub fn new() -> Frame<'g> {
        Frame {
            stack: vec![],
            locals: BTreeMap::new(),
            max_stack: 0,
            max_locals: 0,
            accesses: vec![],
            consumed: vec![],
            next_entry_id: 1,
            delta: None,
        }
    }

    /// A fresh entry owned by this frame
    pub fn entry(&mut self, ty: VerificationType<'g>, source: Source) -> Entry<'g> {
        let id = self.next_entry_id;
        self.next_entry_id += 1;
        Entry {
            id,
            source,
            ty,
            value: None,
            parent: None,
            merges: vec![],
        }
    }

    /// The placeholder entry synthesized on underflow and unknown locals
    pub fn top(&mut self, source: Source) -> Entry<'g> {
        self.entry(VerificationType::Top, source)
    }

    /// A replacement for `old` with a new type, keeping `old` as the parent
    pub fn cast(&mut self, old: &Entry<'g>, ty: VerificationType<'g>, source: Source) -> Entry<'g> {
        let mut entry = self.entry(ty, source);
        entry.value = old.value.clone();
        entry.parent = Some(Box::new(old.clone()));
        entry
    }

    /// Copy this frame
    ///
    /// A shallow copy preserves entry identity but starts a fresh access log and fresh maxima
    /// (it is the working state for tracing a new block); a deep copy clones the access log
    /// too.
    pub fn copy(&self, deep: bool) -> Frame<'g> {
        let mut copied = self.clone();
        if !deep {
            copied.accesses.clear();
            copied.consumed.clear();
            copied.max_stack = self.stack_size();
            copied.max_locals = self.locals_size();
            copied.delta = None;
        }
        copied
    }

    /// Freeze into an immutable snapshot
    pub fn freeze(&self) -> FrozenFrame<'g> {
        FrozenFrame {
            stack: self.stack.iter().map(|entry| entry.ty).collect(),
            locals: self
                .locals
                .iter()
                .map(|(index, entry)| (*index, entry.ty))
                .collect(),
        }
    }

    /// Current stack size in slots
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Current locals size in slots (one past the highest occupied index)
    pub fn locals_size(&self) -> usize {
        self.locals
            .keys()
            .next_back()
            .map(|index| *index as usize + 1)
            .unwrap_or(0)
    }

    /// Fold another frame into this one at a control-flow join
    ///
    /// Both frames have already passed the memoization match; this records the joined types in
    /// each entry's merge closure, so that later equality checks see values from every path.
    pub fn merge(&mut self, other: &Frame<'g>) {
        for (ours, theirs) in self.stack.iter_mut().zip(other.stack.iter()) {
            if ours.ty != theirs.ty && !ours.merges.contains(&theirs.ty) {
                ours.merges.push(theirs.ty);
            }
        }
        for (index, ours) in self.locals.iter_mut() {
            if let Some(theirs) = other.locals.get(index) {
                if ours.ty != theirs.ty && !ours.merges.contains(&theirs.ty) {
                    ours.merges.push(theirs.ty);
                }
            }
        }
    }

    // ------------------------------ Delta recording ------------------------------ //

    /// Start recording the effect of one instruction
    pub fn start(&mut self, source: Source) {
        self.delta = Some(FrameDelta {
            source,
            ..FrameDelta::default()
        });
    }

    /// Stop recording and return the delta
    pub fn finish(&mut self) -> Option<FrameDelta<'g>> {
        self.delta.take()
    }

    // ------------------------------ Stack operations ------------------------------ //

    /// Push an entry (appending a `Top` sentinel after category 2 values)
    pub fn push(&mut self, entry: Entry<'g>) {
        let wide = entry.ty.is_wide();
        if let Some(delta) = self.delta.as_mut() {
            delta.pushes.push(entry.clone());
        }
        let source = entry.source;
        self.stack.push(entry);
        if wide {
            let sentinel = self.entry(VerificationType::Top, source);
            self.stack.push(sentinel);
        }
        if self.stack.len() > self.max_stack {
            self.max_stack = self.stack.len();
        }
    }

    /// Push a fresh entry of the given type
    pub fn push_type(&mut self, ty: VerificationType<'g>, source: Source) {
        let entry = self.entry(ty, source);
        self.push(entry);
    }

    /// Push a fresh entry carrying a literal value
    pub fn push_value(&mut self, ty: VerificationType<'g>, value: Constant, source: Source) {
        let mut entry = self.entry(ty, source);
        entry.value = Some(value);
        self.push(entry);
    }

    fn raw_pop(&mut self, cx: &mut TraceContext<'g, '_>) -> Entry<'g> {
        match self.stack.pop() {
            Some(entry) => {
                if let Some(delta) = self.delta.as_mut() {
                    delta.pops.push(entry.clone());
                }
                if !self.stack.iter().any(|other| other.id == entry.id)
                    && !self.locals.values().any(|other| other.id == entry.id)
                {
                    self.consumed.push(entry.id);
                }
                entry
            }
            None => {
                cx.verifier.report(
                    ErrorKind::StackUnderflow,
                    cx.source,
                    String::from("popped from an empty stack"),
                );
                self.top(cx.source)
            }
        }
    }

    /// Pop the top value, checking it against an expectation
    ///
    /// `Top` expects nothing. A mismatch reports [`ErrorKind::InvalidType`] and substitutes a
    /// cast entry of the merged type so analysis can continue. Wide expectations pop both
    /// slots; popping one slot off a category 2 value is a category error.
    pub fn pop(
        &mut self,
        expect: VerificationType<'g>,
        cx: &mut TraceContext<'g, '_>,
    ) -> Entry<'g> {
        if expect.is_wide() {
            let sentinel = self.raw_pop(cx);
            if sentinel.ty != VerificationType::Top {
                cx.verifier.report(
                    ErrorKind::InvalidTypeCategory,
                    cx.source,
                    format!("expected the upper half of a {}, got {}", expect, sentinel.ty),
                );
            }
            let entry = self.raw_pop(cx);
            return self.check_expectation(entry, expect, cx);
        }

        let entry = self.raw_pop(cx);
        if entry.ty.is_wide() {
            cx.verifier.report(
                ErrorKind::InvalidTypeCategory,
                cx.source,
                format!("splitting a category 2 value of type {}", entry.ty),
            );
        }
        self.check_expectation(entry, expect, cx)
    }

    /// Pop `count` raw slots (for `pop`/`pop2` and friends), top first
    pub fn pop_slots(
        &mut self,
        count: usize,
        cx: &mut TraceContext<'g, '_>,
    ) -> Vec<Entry<'g>> {
        (0..count).map(|_| self.raw_pop(cx)).collect()
    }

    fn check_expectation(
        &mut self,
        entry: Entry<'g>,
        expect: VerificationType<'g>,
        cx: &mut TraceContext<'g, '_>,
    ) -> Entry<'g> {
        if expect == VerificationType::Top || cx.checker.check_merge(entry.ty, expect) {
            return entry;
        }
        cx.verifier.report(
            ErrorKind::InvalidType,
            cx.source,
            format!("expected type {}, got {}", expect, entry.ty),
        );
        let merged = cx.checker.merge(entry.ty, expect);
        self.cast(&entry, merged, cx.source)
    }

    // ------------------------------ Locals operations ------------------------------ //

    /// Read a local, checking it against an expectation
    pub fn get(
        &mut self,
        index: u16,
        expect: VerificationType<'g>,
        cx: &mut TraceContext<'g, '_>,
    ) -> Entry<'g> {
        let entry = match self.locals.get(&index) {
            Some(entry) => entry.clone(),
            None => {
                cx.verifier.report(
                    ErrorKind::UnknownLocal,
                    cx.source,
                    format!("read of unknown local {}", index),
                );
                self.top(cx.source)
            }
        };
        self.accesses.push(LocalAccess {
            read: true,
            index,
            entry: entry.clone(),
        });
        self.check_expectation(entry, expect, cx)
    }

    /// Write a local (storing a `Top` sentinel after category 2 values)
    pub fn set(&mut self, index: u16, entry: Entry<'g>, _cx: &mut TraceContext<'g, '_>) {
        let old = self.locals.get(&index).cloned();
        if let Some(delta) = self.delta.as_mut() {
            delta.overwrites.push((index, old, entry.clone()));
        }
        self.accesses.push(LocalAccess {
            read: false,
            index,
            entry: entry.clone(),
        });

        let wide = entry.ty.is_wide();
        let source = entry.source;
        self.locals.insert(index, entry);
        if wide {
            let sentinel = self.entry(VerificationType::Top, source);
            self.locals.insert(index + 1, sentinel);
        }

        let occupied = index as usize + if wide { 2 } else { 1 };
        if occupied > self.max_locals {
            self.max_locals = occupied;
        }
    }

    /// Structurally replace every occurrence of `old` (by identity) in the stack and locals
    ///
    /// Used when `invokespecial <init>` turns an `Uninitialized` entry into an initialized
    /// object: the replacement keeps `old` as its parent.
    pub fn replace(&mut self, old: &Entry<'g>, ty: VerificationType<'g>, source: Source) {
        let replacement = self.cast(old, ty, source);
        for slot in self.stack.iter_mut() {
            if slot.id == old.id {
                *slot = replacement.clone();
            }
        }
        for slot in self.locals.values_mut() {
            if slot.id == old.id {
                *slot = replacement.clone();
            }
        }
    }

    // ------------------------------ Dup/swap family ------------------------------ //

    /// Does cutting the stack `depth` slots down split a category 2 value?
    fn splits_wide(&self, depth: usize) -> bool {
        if depth == 0 || depth > self.stack.len() {
            return false;
        }
        let boundary = self.stack.len() - depth;
        boundary > 0 && self.stack[boundary - 1].ty.is_wide()
    }

    /// Duplicate the top `count` slots, displacing them `displace` slots down
    ///
    /// This one primitive covers all six `dup*` forms. Underflow reports and substitutes
    /// `Top`; a cut through the middle of a category 2 value is a category error.
    pub fn dup(&mut self, count: usize, displace: usize, cx: &mut TraceContext<'g, '_>) {
        if self.stack.len() < count + displace {
            cx.verifier.report(
                ErrorKind::StackUnderflow,
                cx.source,
                format!(
                    "dup of {} slot(s) displaced {} on a stack of {}",
                    count,
                    displace,
                    self.stack.len()
                ),
            );
            while self.stack.len() < count + displace {
                let top = self.top(cx.source);
                self.stack.insert(0, top);
            }
        }

        if self.splits_wide(count) || self.splits_wide(count + displace) {
            cx.verifier.report(
                ErrorKind::InvalidTypeCategory,
                cx.source,
                String::from("duplicated slice splits a category 2 value"),
            );
        }

        if let Some(delta) = self.delta.as_mut() {
            delta.dups.push((count, displace));
        }

        let duplicated: Vec<Entry<'g>> = self.stack[self.stack.len() - count..].to_vec();
        let insert_at = self.stack.len() - count - displace;
        for (offset, entry) in duplicated.into_iter().enumerate() {
            self.stack.insert(insert_at + offset, entry);
        }

        if self.stack.len() > self.max_stack {
            self.max_stack = self.stack.len();
        }
    }

    /// Swap the top two (category 1) slots
    pub fn swap(&mut self, cx: &mut TraceContext<'g, '_>) {
        if self.stack.len() < 2 {
            cx.verifier.report(
                ErrorKind::StackUnderflow,
                cx.source,
                String::from("swap on a stack of fewer than two values"),
            );
            while self.stack.len() < 2 {
                let top = self.top(cx.source);
                self.stack.insert(0, top);
            }
        }
        if self.splits_wide(1) || self.splits_wide(2) {
            cx.verifier.report(
                ErrorKind::InvalidTypeCategory,
                cx.source,
                String::from("swap across a category 2 value"),
            );
        }
        if let Some(delta) = self.delta.as_mut() {
            delta.swaps += 1;
        }
        let len = self.stack.len();
        self.stack.swap(len - 1, len - 2);
    }
}

impl<'g> Default for Frame<'g> {
    fn default() -> Frame<'g> {
        Frame::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::class_graph::{ClassGraph, ClassGraphArenas};
    use crate::trace::TraceContext;
    use crate::verifier::{ErrorKind, TypeChecker, Verifier};

    fn with_context<F>(run: F) -> Vec<ErrorKind>
    where
        F: for<'g, 'a> FnOnce(&mut Frame<'g>, &mut TraceContext<'g, 'a>),
    {
        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        let core = graph.insert_core_classes();
        let checker = TypeChecker::new(&graph);
        let mut verifier = Verifier::new(false);
        let mut cx = TraceContext {
            checker: &checker,
            core: &core,
            verifier: &mut verifier,
            source: Source::None,
            this_class: None,
        };
        let mut frame = Frame::new();
        run(&mut frame, &mut cx);
        cx.verifier.errors().iter().map(|error| error.kind).collect()
    }

    #[test]
    fn underflow_reports_and_synthesizes_top() {
        let kinds = with_context(|frame, cx| {
            let entry = frame.pop(VerificationType::Int, cx);
            assert_eq!(entry.ty, VerificationType::Top);
        });
        assert_eq!(kinds, vec![ErrorKind::StackUnderflow]);
    }

    #[test]
    fn mismatched_pop_substitutes_a_cast() {
        let kinds = with_context(|frame, cx| {
            frame.push_type(VerificationType::Float, Source::None);
            let entry = frame.pop(VerificationType::Int, cx);
            // The substitute keeps the original as its parent
            assert!(entry.parent.is_some());
            assert_eq!(entry.ty, VerificationType::Top);
        });
        assert_eq!(kinds, vec![ErrorKind::InvalidType]);
    }

    #[test]
    fn wide_values_occupy_two_slots() {
        let kinds = with_context(|frame, cx| {
            frame.push_type(VerificationType::Long, Source::None);
            assert_eq!(frame.stack_size(), 2);
            assert_eq!(frame.max_stack, 2);

            let entry = frame.pop(VerificationType::Long, cx);
            assert_eq!(entry.ty, VerificationType::Long);
            assert_eq!(frame.stack_size(), 0);
        });
        assert!(kinds.is_empty());
    }

    #[test]
    fn dup_refuses_to_split_a_long() {
        let kinds = with_context(|frame, cx| {
            frame.push_type(VerificationType::Long, Source::None);
            frame.dup(1, 0, cx);
        });
        assert_eq!(kinds, vec![ErrorKind::InvalidTypeCategory]);
    }

    #[test]
    fn dup_forms_shuffle_categories() {
        let kinds = with_context(|frame, cx| {
            frame.push_type(VerificationType::Int, Source::None);
            frame.push_type(VerificationType::Float, Source::None);

            // dup_x1: [i f] -> [f i f]
            frame.dup(1, 1, cx);
            assert_eq!(frame.stack[0].ty, VerificationType::Float);
            assert_eq!(frame.stack[1].ty, VerificationType::Int);
            assert_eq!(frame.stack[2].ty, VerificationType::Float);

            // dup2 over a long duplicates both halves
            let mut frame = Frame::new();
            frame.push_type(VerificationType::Long, Source::None);
            frame.dup(2, 0, cx);
            assert_eq!(frame.stack_size(), 4);
        });
        assert!(kinds.is_empty());
    }

    #[test]
    fn wide_locals_store_a_sentinel() {
        let kinds = with_context(|frame, cx| {
            let value = frame.entry(VerificationType::Double, Source::Parameter(0));
            frame.set(2, value, cx);
            assert_eq!(frame.locals[&3].ty, VerificationType::Top);
            assert_eq!(frame.max_locals, 4);
            assert_eq!(frame.accesses.len(), 1);
            assert!(!frame.accesses[0].read);
        });
        assert!(kinds.is_empty());
    }

    #[test]
    fn unknown_local_reads_report() {
        let kinds = with_context(|frame, cx| {
            let entry = frame.get(7, VerificationType::Top, cx);
            assert_eq!(entry.ty, VerificationType::Top);
        });
        assert_eq!(kinds, vec![ErrorKind::UnknownLocal]);
    }

    #[test]
    fn replace_rewrites_every_copy() {
        let kinds = with_context(|frame, cx| {
            let uninit = frame.entry(
                VerificationType::Uninitialized(Source::None),
                Source::None,
            );
            frame.push(uninit.clone());
            frame.push(uninit.clone());
            frame.set(0, uninit.clone(), cx);

            frame.replace(&uninit, VerificationType::Int, Source::None);
            assert!(frame
                .stack
                .iter()
                .chain(frame.locals.values())
                .all(|entry| entry.ty == VerificationType::Int));
            // The originals stay reachable through the cast chain
            assert!(frame.stack[0].parent.is_some());
        });
        assert!(kinds.is_empty());
    }

    #[test]
    fn deltas_record_instruction_effects() {
        let kinds = with_context(|frame, cx| {
            frame.push_type(VerificationType::Int, Source::None);
            frame.start(Source::None);
            let popped = frame.pop(VerificationType::Int, cx);
            frame.set(1, popped, cx);
            let delta = frame.finish().unwrap();
            assert_eq!(delta.pops.len(), 1);
            assert_eq!(delta.overwrites.len(), 1);
            assert!(delta.pushes.is_empty());
        });
        assert!(kinds.is_empty());
    }
}
