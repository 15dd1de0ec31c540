use super::Source;
use crate::class_graph::{ClassGraph, RefType};
use crate::descriptors::{BaseType, FieldType};
use crate::util::Width;
use std::fmt;

/// Verification types
///
/// These types are from [this hierarchy][0]. The sub-`int` primitives (`byte`, `short`, `char`,
/// `boolean`) do not appear: they widen to `Int` the moment they touch the stack or a local.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se7/html/jvms-4.html#jvms-4.10.1.2
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum VerificationType<'g> {
    /// Unknown or unusable (also the second slot of a category 2 value)
    Top,
    Int,
    Float,
    Long,
    Double,
    Null,

    /// In a constructor, the `this` parameter starts with this type then turns into an object
    /// type after `<init>` is called
    UninitializedThis,

    /// State of an object after `new` has been called but `<init>` has not been called
    ///
    /// While the CFG is being analysed this tracks the `new` instruction that produced the
    /// value (a [`Source`]); serializing into a class file replaces it with the bytecode offset
    /// of that instruction.
    Uninitialized(Source),

    /// Address pushed by `jsr`, consumed by `ret`
    ///
    /// Discriminated by its producing source so that returns from distinct subroutines are not
    /// merged together.
    ReturnAddress(Source),

    /// Object or array type
    Reference(RefType<'g>),
}

impl<'g> VerificationType<'g> {
    /// Is this type a reference type?
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            VerificationType::Null
                | VerificationType::UninitializedThis
                | VerificationType::Uninitialized(_)
                | VerificationType::Reference(_)
        )
    }

    /// Computational type category (1 or 2)
    pub fn category(&self) -> usize {
        self.width()
    }

    pub fn is_wide(&self) -> bool {
        self.category() == 2
    }

    /// Verification view of a descriptor type (sub-`int` primitives widen to `Int`)
    pub fn of_field_type(field_type: &FieldType, graph: &'g ClassGraph<'g>) -> Self {
        match field_type {
            FieldType::Base(BaseType::Int)
            | FieldType::Base(BaseType::Char)
            | FieldType::Base(BaseType::Short)
            | FieldType::Base(BaseType::Byte)
            | FieldType::Base(BaseType::Boolean) => VerificationType::Int,
            FieldType::Base(BaseType::Float) => VerificationType::Float,
            FieldType::Base(BaseType::Long) => VerificationType::Long,
            FieldType::Base(BaseType::Double) => VerificationType::Double,
            _ => match RefType::of_field_type(field_type, graph) {
                Some(ref_type) => VerificationType::Reference(ref_type),
                None => VerificationType::Top,
            },
        }
    }
}

impl<'g> Width for VerificationType<'g> {
    fn width(&self) -> usize {
        match self {
            VerificationType::Long | VerificationType::Double => 2,
            _ => 1,
        }
    }
}

impl<'g> fmt::Display for VerificationType<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VerificationType::Top => write!(f, "top"),
            VerificationType::Int => write!(f, "int"),
            VerificationType::Float => write!(f, "float"),
            VerificationType::Long => write!(f, "long"),
            VerificationType::Double => write!(f, "double"),
            VerificationType::Null => write!(f, "null"),
            VerificationType::UninitializedThis => write!(f, "uninitializedThis"),
            VerificationType::Uninitialized(source) => write!(f, "uninitialized({})", source),
            VerificationType::ReturnAddress(source) => write!(f, "returnAddress({})", source),
            VerificationType::Reference(ref_type) => write!(f, "{}", ref_type.class_name()),
        }
    }
}

/// Decides which types may meet at control-flow joins, and what they become when they do
///
/// Kept separate from [`VerificationType`] because reference merging needs the class graph.
pub struct TypeChecker<'g> {
    pub graph: &'g ClassGraph<'g>,
}

impl<'g> TypeChecker<'g> {
    pub fn new(graph: &'g ClassGraph<'g>) -> TypeChecker<'g> {
        TypeChecker { graph }
    }

    /// Can values of these two types meet at a join (or satisfy one another as expectations)?
    ///
    /// `Top` acts as "no expectation": anything checks against it.
    pub fn check_merge(&self, a: VerificationType<'g>, b: VerificationType<'g>) -> bool {
        use VerificationType::*;

        if a == b {
            return true;
        }
        match (a, b) {
            (Top, _) | (_, Top) => true,
            (Null, Reference(_)) | (Reference(_), Null) => true,
            (Reference(_), Reference(_)) => true,
            // Distinct sources: deliberately not mergeable
            (ReturnAddress(_), ReturnAddress(_)) => false,
            _ => false,
        }
    }

    /// The type a join of these two produces
    ///
    /// Incompatible types merge to `Top` (the caller is expected to have reported the
    /// `check_merge` failure already).
    pub fn merge(
        &self,
        a: VerificationType<'g>,
        b: VerificationType<'g>,
    ) -> VerificationType<'g> {
        use VerificationType::*;

        if a == b {
            return a;
        }
        match (a, b) {
            (Top, _) | (_, Top) => Top,
            (Null, other @ Reference(_)) | (other @ Reference(_), Null) => other,
            (Reference(ra), Reference(rb)) => Reference(self.merge_refs(ra, rb)),
            _ => Top,
        }
    }

    fn merge_refs(&self, a: RefType<'g>, b: RefType<'g>) -> RefType<'g> {
        let object = RefType::Object(self.graph.get_or_insert("java/lang/Object"));
        match (a, b) {
            (RefType::Object(ca), RefType::Object(cb)) => {
                RefType::Object(self.graph.common_superclass(ca, cb))
            }
            (RefType::Array(sa), RefType::Array(sb)) if sa == sb => a,
            // Arrays of different shapes (or an array and an object) share only Object
            _ => object,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::class_graph::ClassGraphArenas;

    #[test]
    fn primitive_merges() {
        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        let _core = graph.insert_core_classes();
        let checker = TypeChecker::new(&graph);

        use VerificationType::*;
        assert!(checker.check_merge(Int, Int));
        assert!(!checker.check_merge(Int, Float));
        assert!(checker.check_merge(Top, Long));
        assert_eq!(checker.merge(Int, Float), Top);
    }

    #[test]
    fn reference_merges_find_common_supertypes() {
        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        let core = graph.insert_core_classes();
        let checker = TypeChecker::new(&graph);

        use VerificationType::*;
        let exception = Reference(RefType::Object(core.exception));
        let error = Reference(RefType::Object(core.error));
        let throwable = Reference(RefType::Object(core.throwable));

        assert!(checker.check_merge(exception, error));
        assert_eq!(checker.merge(exception, error), throwable);
        assert_eq!(checker.merge(Null, throwable), throwable);
    }

    #[test]
    fn return_addresses_do_not_cross_merge() {
        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        let _core = graph.insert_core_classes();
        let checker = TypeChecker::new(&graph);

        use crate::graph::Label;
        use VerificationType::*;
        let a = ReturnAddress(Source::Block(Label(1)));
        let b = ReturnAddress(Source::Block(Label(2)));
        assert!(checker.check_merge(a, a));
        assert!(!checker.check_merge(a, b));
    }

    #[test]
    fn descriptor_types_widen_to_int() {
        use crate::descriptors::Descriptor;

        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        let _core = graph.insert_core_classes();

        for descriptor in ["B", "S", "C", "Z", "I"] {
            let field_type = FieldType::parse(descriptor).unwrap();
            assert_eq!(
                VerificationType::of_field_type(&field_type, &graph),
                VerificationType::Int
            );
        }
    }
}
