//! Read, analyze, transform and re-emit JVM class files
//!
//! The centre of the crate is the bytecode analysis core: a control-flow graph over JVM
//! instructions ([`graph::InsnGraph`]), an abstract-interpretation engine deriving per-edge
//! stack/locals constraints ([`trace::Trace`]), and an assembler that lowers the graph back to
//! a linear byte stream with valid jump offsets, exception tables and stack map frames.
//!
//! ### Simple example
//!
//! Round-trip a method body through the analysis core:
//!
//! ```
//! use bytegraph::class_graph::{ClassGraph, ClassGraphArenas, RefType};
//! use bytegraph::classfile::{CodeAttribute, ConstantPool, Version};
//! use bytegraph::descriptors::{Descriptor, MethodDescriptor};
//! use bytegraph::graph::{AssembleOptions, InsnGraph};
//! use bytegraph::trace::{MethodContext, Trace};
//! use bytegraph::verifier::{TypeChecker, Verifier};
//!
//! // int add(int a, int b) { return a + b; }
//! let code = CodeAttribute {
//!     max_stack: 2,
//!     max_locals: 2,
//!     code: vec![0x1a, 0x1b, 0x60, 0xac], // iload_0 iload_1 iadd ireturn
//!     exception_table: vec![],
//!     attributes: vec![],
//! };
//!
//! let arenas = ClassGraphArenas::new();
//! let class_graph = ClassGraph::new(&arenas);
//! let core = class_graph.insert_core_classes();
//! let checker = TypeChecker::new(&class_graph);
//!
//! let mut pool = ConstantPool::new();
//! let graph = InsnGraph::disassemble(&code, &pool).unwrap();
//!
//! let method = MethodContext {
//!     class: RefType::Object(core.object),
//!     name: String::from("add"),
//!     descriptor: MethodDescriptor::parse("(II)I").unwrap(),
//!     is_static: true,
//! };
//! let mut verifier = Verifier::new(true);
//! let trace = Trace::run(&graph, &method, &checker, &core, false, &mut verifier);
//! assert_eq!(trace.max_stack, 2);
//! assert_eq!(trace.max_locals, 2);
//!
//! let assembled = graph
//!     .assemble(
//!         &trace,
//!         &checker,
//!         Version::JAVA8,
//!         &AssembleOptions::default(),
//!         &mut pool,
//!         &mut verifier,
//!     )
//!     .unwrap();
//! verifier.finish().unwrap();
//! assert_eq!(assembled.code, code.code);
//! ```

pub mod class_graph;
pub mod classfile;
pub mod code;
pub mod descriptors;
pub mod graph;
pub mod trace;
pub mod util;
pub mod verifier;
