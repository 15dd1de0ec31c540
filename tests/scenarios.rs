//! End-to-end scenarios: disassemble, trace, and reassemble real method bodies

use bytegraph::class_graph::{ClassGraph, ClassGraphArenas, CoreClasses, RefType};
use bytegraph::classfile::{
    CodeAttribute, Constant, ConstantPool, Error, ExceptionHandler, Version,
};
use bytegraph::code::Instruction;
use bytegraph::descriptors::{Descriptor, MethodDescriptor};
use bytegraph::graph::{AssembleOptions, EdgeKind, InsnGraph, Label};
use bytegraph::trace::{MethodContext, Trace};
use bytegraph::verifier::{ErrorKind, TypeChecker, VerificationType, Verifier};

struct Harness<'g> {
    core: CoreClasses<'g>,
    checker: TypeChecker<'g>,
}

impl<'g> Harness<'g> {
    fn new(class_graph: &'g ClassGraph<'g>) -> Harness<'g> {
        let core = class_graph.insert_core_classes();
        Harness {
            core,
            checker: TypeChecker::new(class_graph),
        }
    }

    fn static_method(&self, descriptor: &str) -> MethodContext<'g> {
        MethodContext {
            class: RefType::Object(self.core.object),
            name: String::from("m"),
            descriptor: MethodDescriptor::parse(descriptor).unwrap(),
            is_static: true,
        }
    }

    fn instance_method(&self, descriptor: &str) -> MethodContext<'g> {
        MethodContext {
            is_static: false,
            ..self.static_method(descriptor)
        }
    }
}

fn code_of(bytes: Vec<u8>) -> CodeAttribute {
    CodeAttribute {
        max_stack: 0,
        max_locals: 0,
        code: bytes,
        exception_table: vec![],
        attributes: vec![],
    }
}

fn round_trip<'g>(
    harness: &Harness<'g>,
    code: &CodeAttribute,
    method: &MethodContext<'g>,
    do_raise: bool,
) -> (CodeAttribute, Trace<'g>, Verifier) {
    let mut pool = ConstantPool::new();
    let graph = InsnGraph::disassemble(code, &pool).unwrap();
    let mut verifier = Verifier::new(do_raise);
    let trace = Trace::run(
        &graph,
        method,
        &harness.checker,
        &harness.core,
        false,
        &mut verifier,
    );
    let assembled = graph
        .assemble(
            &trace,
            &harness.checker,
            Version::JAVA8,
            &AssembleOptions::default(),
            &mut pool,
            &mut verifier,
        )
        .unwrap();
    (assembled, trace, verifier)
}

// Scenario 1: `void m() {}`
#[test]
fn empty_method() {
    let arenas = ClassGraphArenas::new();
    let class_graph = ClassGraph::new(&arenas);
    let harness = Harness::new(&class_graph);

    let code = code_of(vec![0xb1]); // return
    let method = harness.static_method("()V");
    let (assembled, trace, verifier) = round_trip(&harness, &code, &method, true);

    assert!(verifier.errors().is_empty());
    assert_eq!(trace.max_stack, 0);
    assert_eq!(trace.max_locals, 0);
    assert_eq!(assembled.code, vec![0xb1]);
    assert!(assembled.exception_table.is_empty());
    assert!(assembled.attributes.is_empty());
}

// Scenario 1, instance variant: the receiver occupies one local
#[test]
fn empty_instance_method() {
    let arenas = ClassGraphArenas::new();
    let class_graph = ClassGraph::new(&arenas);
    let harness = Harness::new(&class_graph);

    let code = code_of(vec![0xb1]);
    let method = harness.instance_method("()V");
    let (assembled, trace, verifier) = round_trip(&harness, &code, &method, true);

    assert!(verifier.errors().is_empty());
    assert_eq!(trace.max_stack, 0);
    assert_eq!(trace.max_locals, 1);
    assert_eq!(assembled.code, vec![0xb1]);
}

// Scenario 2: `int add(int a, int b) { return a + b; }`
#[test]
fn add_two_ints() {
    let arenas = ClassGraphArenas::new();
    let class_graph = ClassGraph::new(&arenas);
    let harness = Harness::new(&class_graph);

    let code = code_of(vec![0x1a, 0x1b, 0x60, 0xac]); // iload_0 iload_1 iadd ireturn
    let method = harness.static_method("(II)I");
    let (assembled, trace, verifier) = round_trip(&harness, &code, &method, true);

    assert!(verifier.errors().is_empty());
    assert_eq!(trace.max_stack, 2);
    assert_eq!(trace.max_locals, 2);
    assert_eq!(assembled.code, code.code);

    // Straight-line code needs no stack map frames
    assert!(assembled.attributes.is_empty());
}

// Scenario 3: `int m(int x) { if (x != 0) return 1; return 0; }`
#[test]
fn conditional_emits_one_frame() {
    let arenas = ClassGraphArenas::new();
    let class_graph = ClassGraph::new(&arenas);
    let harness = Harness::new(&class_graph);

    // iload_0; ifeq +5; iconst_1; ireturn; iconst_0; ireturn
    let code = code_of(vec![0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac]);
    let method = harness.static_method("(I)I");
    let (assembled, trace, verifier) = round_trip(&harness, &code, &method, true);

    assert!(verifier.errors().is_empty());
    assert_eq!(trace.max_stack, 1);
    assert_eq!(assembled.code, code.code);

    // Exactly one frame, at the else target
    assert_eq!(assembled.attributes.len(), 1);
    let table_bytes = &assembled.attributes[0].info;
    // The frame count is the first u16 of the attribute body
    assert_eq!(u16::from_be_bytes([table_bytes[0], table_bytes[1]]), 1);
}

// Scenario 4: a tableswitch with three cases and a default
#[test]
fn tableswitch_round_trips() {
    let arenas = ClassGraphArenas::new();
    let class_graph = ClassGraph::new(&arenas);
    let harness = Harness::new(&class_graph);

    // iload_0; tableswitch default +27 low 1 high 3, cases +29 +31 +33;
    // then iconst_1/ireturn iconst_2/ireturn iconst_3/ireturn iconst_0/ireturn
    let mut bytes = vec![0x1a, 0xaa, 0, 0];
    for value in [27i32, 1, 3, 29, 31, 33] {
        bytes.extend_from_slice(&value.to_be_bytes());
    }
    bytes.extend_from_slice(&[0x04, 0xac, 0x05, 0xac, 0x06, 0xac, 0x03, 0xac]);
    let code = code_of(bytes);

    let method = harness.static_method("(I)I");

    let mut pool = ConstantPool::new();
    let graph = InsnGraph::disassemble(&code, &pool).unwrap();

    // One switch edge per case plus one for the default, each with its value
    let mut values: Vec<Option<i32>> = graph
        .edges()
        .filter_map(|edge| match edge.kind {
            EdgeKind::Switch { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    values.sort();
    assert_eq!(values, vec![None, Some(1), Some(2), Some(3)]);

    let mut verifier = Verifier::new(true);
    let trace = Trace::run(
        &graph,
        &method,
        &harness.checker,
        &harness.core,
        false,
        &mut verifier,
    );
    let assembled = graph
        .assemble(
            &trace,
            &harness.checker,
            Version::JAVA8,
            &AssembleOptions::default(),
            &mut pool,
            &mut verifier,
        )
        .unwrap();
    assert!(verifier.errors().is_empty());

    // The reassembled stream holds a fully-bound switch again: three case offsets plus a
    // default
    let instructions = assembled.instructions(&pool).unwrap();
    let switch = instructions
        .values()
        .find(|instruction| instruction.is_switch())
        .expect("switch survives reassembly");
    match switch {
        Instruction::TableSwitch {
            default, offsets, ..
        } => {
            assert!(default.is_some());
            assert_eq!(offsets.len(), 3);
            assert!(offsets.iter().all(Option::is_some));
        }
        other => panic!("expected a tableswitch, got {:?}", other),
    }
}

// Scenario 5: try/catch over `new int[n]`
#[test]
fn try_catch_handler_frame() {
    let arenas = ClassGraphArenas::new();
    let class_graph = ClassGraph::new(&arenas);
    let harness = Harness::new(&class_graph);

    // 0: iload_0; 1: newarray int; 3: astore_1; 4: return; 5: pop; 6: return
    let code = CodeAttribute {
        max_stack: 1,
        max_locals: 2,
        code: vec![0x1a, 0xbc, 10, 0x3c, 0xb1, 0x57, 0xb1],
        exception_table: vec![ExceptionHandler {
            start_pc: 0,
            end_pc: 4,
            handler_pc: 5,
            catch_type: 0,
        }],
        attributes: vec![],
    };
    let method = harness.static_method("(I)V");

    let mut pool = ConstantPool::new();
    let graph = InsnGraph::disassemble(&code, &pool).unwrap();

    let exception_edge = graph
        .edges()
        .find(|edge| matches!(edge.kind, EdgeKind::Exception { .. }))
        .expect("exception edge")
        .clone();
    match &exception_edge.kind {
        EdgeKind::Exception { priority, .. } => assert_eq!(*priority, 0),
        _ => unreachable!(),
    }

    let mut verifier = Verifier::new(true);
    let trace = Trace::run(
        &graph,
        &method,
        &harness.checker,
        &harness.core,
        false,
        &mut verifier,
    );
    assert!(verifier.errors().is_empty());

    // The handler's entry frame holds exactly the throwable
    let handler = exception_edge.to.unwrap();
    let handler_entries = &trace.entries[&handler];
    assert!(!handler_entries.is_empty());
    for frame in handler_entries {
        assert_eq!(frame.stack.len(), 1);
        assert_eq!(
            frame.stack[0].ty,
            VerificationType::Reference(RefType::Object(harness.core.throwable))
        );
    }

    let assembled = graph
        .assemble(
            &trace,
            &harness.checker,
            Version::JAVA8,
            &AssembleOptions::default(),
            &mut pool,
            &mut verifier,
        )
        .unwrap();
    assert!(verifier.errors().is_empty());
    assert_eq!(assembled.exception_table.len(), 1);
    let row = &assembled.exception_table[0];
    assert_eq!(row.catch_type, 0);
    assert_eq!(row.handler_pc as usize, 5);
}

// Scenario 6: an obfuscated goto pointing past the end of the code
#[test]
fn unbound_goto_is_preserved() {
    let arenas = ClassGraphArenas::new();
    let class_graph = ClassGraph::new(&arenas);
    let harness = Harness::new(&class_graph);

    // goto +32767; return
    let code = code_of(vec![0xa7, 0x7f, 0xff, 0xb1]);
    let method = harness.static_method("()V");
    let (assembled, _trace, verifier) = round_trip(&harness, &code, &method, false);

    // The raw goto survives and the return still follows it
    assert_eq!(assembled.code, vec![0xa7, 0x7f, 0xff, 0xb1]);

    // The assembler flags the preserved unbound jump
    assert!(verifier
        .errors()
        .iter()
        .any(|error| error.kind == ErrorKind::InvalidBlock));
}

// Boundary: a jsr whose ret cannot be resolved still completes the trace
#[test]
fn unresolvable_ret_reports_and_completes() {
    let arenas = ClassGraphArenas::new();
    let class_graph = ClassGraph::new(&arenas);
    let harness = Harness::new(&class_graph);

    let mut graph = InsnGraph::new();
    let entry = graph.entry;
    graph.block_mut(entry).unwrap().instructions =
        vec![Instruction::AConstNull, Instruction::AStore(1)];
    graph.connect(bytegraph::graph::Edge {
        from: entry,
        to: None,
        kind: EdgeKind::Ret {
            instruction: Instruction::Ret(1),
        },
    });

    let method = harness.static_method("()V");
    let mut verifier = Verifier::new(false);
    let trace = Trace::run(
        &graph,
        &method,
        &harness.checker,
        &harness.core,
        false,
        &mut verifier,
    );

    assert!(trace.reached(entry));
    assert!(verifier
        .errors()
        .iter()
        .any(|error| error.kind == ErrorKind::InvalidBlock));
}

// Boundary: narrow forward jump over > 32 KiB of code gets exactly one intermediary
#[test]
fn distant_narrow_jump_gets_an_intermediary() {
    let arenas = ClassGraphArenas::new();
    let class_graph = ClassGraph::new(&arenas);
    let harness = Harness::new(&class_graph);

    let mut graph = InsnGraph::new();
    let entry = graph.entry;
    graph.block_mut(entry).unwrap().instructions = vec![Instruction::ILoad(0)];

    // ~33 KB of filler
    let mut filler = vec![];
    for _ in 0..16_600 {
        filler.push(Instruction::IConst0);
        filler.push(Instruction::Pop);
    }
    let big = graph.block_of(filler);
    let far = graph.block_of(vec![]);

    graph.jump(
        entry,
        far,
        Instruction::If(bytegraph::code::OrdComparison::EQ, None),
    );
    graph.fallthrough(entry, big);
    graph.return_from(big, Instruction::Return);
    graph.return_from(far, Instruction::Return);

    let method = harness.static_method("(I)V");
    let mut verifier = Verifier::new(false);
    let trace = Trace::run(
        &graph,
        &method,
        &harness.checker,
        &harness.core,
        false,
        &mut verifier,
    );
    assert!(verifier.errors().is_empty());

    let mut pool = ConstantPool::new();
    let assembled = graph
        .assemble(
            &trace,
            &harness.checker,
            Version::JAVA8,
            &AssembleOptions::default(),
            &mut pool,
            &mut verifier,
        )
        .unwrap();
    assert!(verifier.errors().is_empty(), "{:?}", verifier.errors());
    assert!(assembled.code.len() > 32_767);

    // The conditional branch at offset 1 now lands on a nearby goto_w intermediary
    let instructions = assembled.instructions(&pool).unwrap();
    let branch_target = match instructions.get(&1) {
        Some(Instruction::If(_, Some(delta))) => (1 + delta) as usize,
        other => panic!("expected a bound conditional at offset 1, got {:?}", other),
    };
    assert!(branch_target < 32_768);
    match instructions.get(&branch_target) {
        Some(Instruction::GotoW(Some(delta))) => {
            let final_target = branch_target as i64 + *delta as i64;
            // The wide hop reaches past the filler
            assert!(final_target > 32_767);
        }
        other => panic!("expected a goto_w intermediary, got {:?}", other),
    }
}

// Dedup invariant: `P.add(c)` is stable and `P.get(i)` returns what was added
#[test]
fn constant_pool_dedup_is_stable() {
    let mut pool = ConstantPool::new();
    let constants = vec![
        Constant::Utf8(String::from("hello")),
        Constant::Integer(42),
        Constant::Long(7),
        Constant::class("java/lang/Object"),
    ];
    for constant in &constants {
        let index = pool.add_deep(constant).unwrap();
        assert_eq!(pool.get(index), *constant);
        assert_eq!(pool.add_deep(constant).unwrap(), index);
    }
}

// Boundary: a wide constant may finish at the last usable index but not reserve past it
#[test]
fn wide_constant_at_the_end_of_the_pool() {
    let mut pool = ConstantPool::new();
    // Fill slots 1 through 65532
    for i in 0..65_532u32 {
        pool.add(Constant::Integer(i as i32)).unwrap();
    }
    // Slots 65533 + 65534: exactly fits, and the count still fits in a u16
    let index = pool.add(Constant::Long(1)).unwrap();
    assert_eq!(index, 65_533);

    // Nothing fits after the final reserved slot
    assert!(matches!(
        pool.add(Constant::Integer(-1)),
        Err(Error::ConstantPoolOverflow { .. })
    ));

    // And a wide constant may not start at the last usable slot either
    let mut pool = ConstantPool::new();
    for i in 0..65_533u32 {
        pool.add(Constant::Integer(i as i32)).unwrap();
    }
    assert!(matches!(
        pool.add(Constant::Long(2)),
        Err(Error::ConstantPoolOverflow { .. })
    ));
}

// Idempotence: reassembling and re-disassembling preserves the block/edge structure
#[test]
fn reassembly_preserves_structure() {
    let arenas = ClassGraphArenas::new();
    let class_graph = ClassGraph::new(&arenas);
    let harness = Harness::new(&class_graph);

    // The conditional method from scenario 3
    let code = code_of(vec![0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac]);
    let method = harness.static_method("(I)I");

    let (assembled, _, verifier) = round_trip(&harness, &code, &method, true);
    assert!(verifier.errors().is_empty());

    let pool = ConstantPool::new();
    let first = InsnGraph::disassemble(&code, &pool).unwrap();
    let second = InsnGraph::disassemble(&assembled, &pool).unwrap();

    assert_eq!(first.len(), second.len());
    assert_eq!(first.edges().count(), second.edges().count());
    for (a, b) in first.blocks().zip(second.blocks()) {
        assert_eq!(a.instructions, b.instructions);
    }
}

// Trace coverage: every reachable block records at least one (entry, exit) pair, and the
// maxima bound the simulated sizes
#[test]
fn trace_covers_reachable_blocks() {
    let arenas = ClassGraphArenas::new();
    let class_graph = ClassGraph::new(&arenas);
    let harness = Harness::new(&class_graph);

    let code = code_of(vec![0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac]);
    let method = harness.static_method("(I)I");

    let pool = ConstantPool::new();
    let graph = InsnGraph::disassemble(&code, &pool).unwrap();
    let mut verifier = Verifier::new(true);
    let trace = Trace::run(
        &graph,
        &method,
        &harness.checker,
        &harness.core,
        false,
        &mut verifier,
    );

    for block in graph.blocks() {
        if block.label == Label::RETHROW {
            continue; // nothing throws in this method
        }
        assert!(
            trace.constraints.contains_key(&block.label),
            "block {} has no constraints",
            block.label
        );
    }
    for frames in trace.entries.values() {
        for frame in frames {
            assert!(frame.stack.len() <= trace.max_stack);
        }
    }
}
