//! Interned class registry
//!
//! The analysis core needs to reason about a handful of class relationships: whether a thrown
//! type is a `java/lang/Throwable`, what the common supertype of two merged references is, and
//! which names to intern into stack map frames. Rather than process-level singletons, all of
//! that is owned by an explicit [`ClassGraph`] value threaded through analysis.
//!
//! The graph is append-only: registering classes takes `&self`, and a [`ClassId`] is just a
//! reference into the backing arena, so ids stay `Copy` and compare by identity.

use crate::descriptors::{BaseType, Descriptor, FieldType};
use crate::util::RefId;
use elsa::FrozenMap;
use typed_arena::Arena;

/// Backing storage for a [`ClassGraph`]
///
/// Kept separate so the graph itself can hand out references tied to the arena's lifetime.
pub struct ClassGraphArenas<'g> {
    class_arena: Arena<ClassData<'g>>,
}

impl<'g> ClassGraphArenas<'g> {
    pub fn new() -> Self {
        ClassGraphArenas {
            class_arena: Arena::new(),
        }
    }
}

impl<'g> Default for ClassGraphArenas<'g> {
    fn default() -> Self {
        Self::new()
    }
}

/// What the analysis knows about one class
#[derive(Debug)]
pub struct ClassData<'g> {
    /// Binary name, eg. `java/lang/Object`
    pub name: String,

    /// Superclass, `None` only for `java/lang/Object` and for interfaces
    pub superclass: Option<ClassId<'g>>,

    pub is_interface: bool,

    /// Was this class registered on first use rather than declared by the caller?
    ///
    /// Nothing can be assumed about such a class beyond "it extends `java/lang/Object`";
    /// assignability involving it stays deliberately lenient because analysed files routinely
    /// reference classes that are not on any classpath we can see.
    pub assumed: bool,
}

/// Identity-based handle to a [`ClassData`] in some [`ClassGraph`]
pub type ClassId<'g> = RefId<'g, ClassData<'g>>;

/// Well-known `java/lang` classes every analysis needs
pub struct CoreClasses<'g> {
    pub object: ClassId<'g>,
    pub throwable: ClassId<'g>,
    pub exception: ClassId<'g>,
    pub error: ClassId<'g>,
    pub runtime_exception: ClassId<'g>,
    pub string: ClassId<'g>,
    pub class: ClassId<'g>,
    pub method_handle: ClassId<'g>,
    pub method_type: ClassId<'g>,
}

/// Append-only registry of classes, keyed by binary name
pub struct ClassGraph<'g> {
    arenas: &'g ClassGraphArenas<'g>,
    classes: FrozenMap<&'g str, ClassId<'g>>,
}

impl<'g> ClassGraph<'g> {
    /// New graph with the core `java/lang` classes pre-registered
    pub fn new(arenas: &'g ClassGraphArenas<'g>) -> ClassGraph<'g> {
        ClassGraph {
            arenas,
            classes: FrozenMap::new(),
        }
    }

    /// Register the well-known classes and return handles to them
    pub fn insert_core_classes(&'g self) -> CoreClasses<'g> {
        let object = self.add_class(ClassData {
            name: String::from("java/lang/Object"),
            superclass: None,
            is_interface: false,
            assumed: false,
        });
        let subclass = |name: &str, superclass: ClassId<'g>| {
            self.add_class(ClassData {
                name: name.to_owned(),
                superclass: Some(superclass),
                is_interface: false,
                assumed: false,
            })
        };

        let throwable = subclass("java/lang/Throwable", object);
        let exception = subclass("java/lang/Exception", throwable);
        let error = subclass("java/lang/Error", throwable);
        let runtime_exception = subclass("java/lang/RuntimeException", exception);
        let string = subclass("java/lang/String", object);
        let class = subclass("java/lang/Class", object);
        let method_handle = subclass("java/lang/invoke/MethodHandle", object);
        let method_type = subclass("java/lang/invoke/MethodType", object);

        CoreClasses {
            object,
            throwable,
            exception,
            error,
            runtime_exception,
            string,
            class,
            method_handle,
            method_type,
        }
    }

    /// Lookup a class by its binary name
    pub fn lookup_class(&'g self, name: &str) -> Option<ClassId<'g>> {
        self.classes.get(name).map(RefId)
    }

    /// Add a new class to the class graph
    pub fn add_class(&'g self, data: ClassData<'g>) -> ClassId<'g> {
        if let Some(existing) = self.classes.get(data.name.as_str()) {
            return RefId(existing);
        }
        let data: &'g ClassData<'g> = self.arenas.class_arena.alloc(data);
        let class_id: ClassId<'g> = RefId(data);
        self.classes.insert(data.name.as_str(), class_id);
        class_id
    }

    /// Lookup a class, registering it as an assumed subclass of `java/lang/Object` if absent
    pub fn get_or_insert(&'g self, name: &str) -> ClassId<'g> {
        if let Some(found) = self.lookup_class(name) {
            return found;
        }
        let object = self
            .lookup_class("java/lang/Object")
            .expect("core classes registered");
        self.add_class(ClassData {
            name: name.to_owned(),
            superclass: Some(object),
            is_interface: false,
            assumed: true,
        })
    }

    /// Is `sub` assignable to `sup`?
    ///
    /// `java/lang/Object` accepts everything; otherwise the super chain of `sub` is walked.
    /// Interface targets are accepted (the JVM verifier itself defers interface checks to run
    /// time), as are targets whose class was assumed rather than declared.
    pub fn is_assignable(&self, sub: ClassId<'g>, sup: ClassId<'g>) -> bool {
        if sup.name == "java/lang/Object" || sup.is_interface || sup.assumed {
            return true;
        }
        let mut current = Some(sub);
        while let Some(class) = current {
            if class == sup {
                return true;
            }
            current = class.superclass;
        }
        false
    }

    /// Nearest common superclass of two classes (falls back to `java/lang/Object`)
    pub fn common_superclass(&'g self, a: ClassId<'g>, b: ClassId<'g>) -> ClassId<'g> {
        let mut chain = vec![];
        let mut current = Some(a);
        while let Some(class) = current {
            chain.push(class);
            current = class.superclass;
        }

        let mut current = Some(b);
        while let Some(class) = current {
            if chain.contains(&class) {
                return class;
            }
            current = class.superclass;
        }

        // Unreachable while every chain roots at Object, but degrade gracefully
        self.lookup_class("java/lang/Object").unwrap_or(a)
    }
}

/// Element type of an array (never itself an array)
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ArrayElement<'g> {
    Base(BaseType),
    Object(ClassId<'g>),
}

/// Array type: dimension count plus element
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ArrayShape<'g> {
    pub dimensions: u8,
    pub element: ArrayElement<'g>,
}

/// Reference type: a class/interface or an array
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum RefType<'g> {
    Object(ClassId<'g>),
    Array(ArrayShape<'g>),
}

impl<'g> RefType<'g> {
    pub fn array_of(element: ArrayElement<'g>, dimensions: u8) -> RefType<'g> {
        RefType::Array(ArrayShape {
            dimensions,
            element,
        })
    }

    /// Interpret the name of a `CONSTANT_Class_info`
    ///
    /// Class constants almost always hold plain binary names, but array classes (eg. for
    /// `checkcast` to `[I`) are spelled in descriptor syntax.
    pub fn from_class_name(name: &str, graph: &'g ClassGraph<'g>) -> RefType<'g> {
        if name.starts_with('[') {
            if let Ok(parsed) = FieldType::parse(name) {
                if let Some(ref_type) = RefType::of_field_type(&parsed, graph) {
                    return ref_type;
                }
            }
            // Malformed array name: treat the whole string as a class
        }
        RefType::Object(graph.get_or_insert(name))
    }

    /// Reference view of a field type (`None` for primitives)
    pub fn of_field_type(field_type: &FieldType, graph: &'g ClassGraph<'g>) -> Option<RefType<'g>> {
        match field_type {
            FieldType::Base(_) => None,
            FieldType::Object(name) => Some(RefType::Object(graph.get_or_insert(name))),
            FieldType::Array {
                dimensions,
                element,
            } => {
                let element = match element.as_ref() {
                    FieldType::Base(base) => ArrayElement::Base(*base),
                    FieldType::Object(name) => ArrayElement::Object(graph.get_or_insert(name)),
                    FieldType::Array { .. } => return None, // elements are normalized flat
                };
                Some(RefType::Array(ArrayShape {
                    dimensions: *dimensions,
                    element,
                }))
            }
        }
    }

    /// Render back into `CONSTANT_Class_info` name syntax
    pub fn class_name(&self) -> String {
        match self {
            RefType::Object(class) => class.name.clone(),
            RefType::Array(shape) => {
                let mut name = String::new();
                for _ in 0..shape.dimensions {
                    name.push('[');
                }
                match shape.element {
                    ArrayElement::Base(base) => base.render_to(&mut name),
                    ArrayElement::Object(class) => {
                        name.push('L');
                        name.push_str(&class.name);
                        name.push(';');
                    }
                }
                name
            }
        }
    }

    /// Type of an element loaded out of this array (one dimension stripped)
    pub fn strip_dimension(&self) -> Option<RefType<'g>> {
        match self {
            RefType::Array(shape) if shape.dimensions > 1 => Some(RefType::Array(ArrayShape {
                dimensions: shape.dimensions - 1,
                element: shape.element,
            })),
            RefType::Array(ArrayShape {
                dimensions: 1,
                element: ArrayElement::Object(class),
            }) => Some(RefType::Object(*class)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn assignability_walks_super_chains() {
        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        let core = graph.insert_core_classes();

        assert!(graph.is_assignable(core.runtime_exception, core.throwable));
        assert!(graph.is_assignable(core.throwable, core.object));
        assert!(!graph.is_assignable(core.string, core.throwable));
    }

    #[test]
    fn unknown_classes_extend_object() {
        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        let core = graph.insert_core_classes();

        let mystery = graph.get_or_insert("com/example/Mystery");
        assert!(mystery.assumed);
        assert!(graph.is_assignable(mystery, core.object));
        assert_eq!(graph.get_or_insert("com/example/Mystery"), mystery);
        assert_eq!(graph.common_superclass(mystery, core.string), core.object);
    }

    #[test]
    fn array_class_names_parse_both_ways() {
        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        let _core = graph.insert_core_classes();

        let ints = RefType::from_class_name("[I", &graph);
        assert_eq!(ints.class_name(), "[I");

        let strings = RefType::from_class_name("[[Ljava/lang/String;", &graph);
        assert_eq!(strings.class_name(), "[[Ljava/lang/String;");
        assert_eq!(
            strings.strip_dimension().unwrap().class_name(),
            "[Ljava/lang/String;"
        );

        let plain = RefType::from_class_name("java/lang/String", &graph);
        assert_eq!(plain.class_name(), "java/lang/String");
    }
}
