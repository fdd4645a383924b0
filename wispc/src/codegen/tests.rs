//! Codegen tests.
//!
//! Programs are built with the snapshot builder, compiled in-memory, and
//! checked against the printed LLVM IR (plus structural queries on the
//! module). Nothing here executes generated code; the interesting
//! properties are the shape of the emitted IR and the module-level
//! symbol contract.

use std::collections::HashSet;

use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::values::AnyValue;

use super::world::World;
use super::LlvmCodegen;
use crate::snapshot::bytecode::{BytecodeAssembler, Opcode};
use crate::snapshot::natives::Native;
use crate::snapshot::selector::{Selector, SelectorKind};
use crate::snapshot::{HeapId, ObjectRef, Program, ProgramBuilder};

/// Bytecode for a method body returning null.
fn return_null_body() -> Vec<u8> {
    let mut asm = BytecodeAssembler::new();
    asm.emit(Opcode::ReturnNull).emit(Opcode::MethodEnd);
    asm.finish()
}

/// Build the module for `program` and run the finalize phases
/// (verification on, optimization as given, intrinsic lowering always).
fn compile<'ctx, 'p>(
    context: &'ctx Context,
    program: &'p Program,
    optimize: bool,
) -> World<'ctx, 'p> {
    let codegen = LlvmCodegen::new(program);
    let world = codegen.build_module(context).expect("module construction failed");
    LlvmCodegen::finalize(&world, optimize, true).expect("finalize failed");
    world
}

/// The printed IR of a single function definition.
fn function_ir(module_ir: &str, symbol: &str) -> String {
    let needle = format!("@{}(", symbol);
    let mut search_from = 0;
    loop {
        let position = module_ir[search_from..]
            .find(&needle)
            .map(|offset| search_from + offset)
            .unwrap_or_else(|| panic!("symbol {} not in module", symbol));
        let line_start = module_ir[..position].rfind('\n').map_or(0, |n| n + 1);
        if module_ir[line_start..position].trim_start().starts_with("define") {
            let end = module_ir[position..]
                .find("\n}")
                .map(|offset| position + offset + 2)
                .unwrap_or(module_ir.len());
            return module_ir[line_start..end].to_string();
        }
        search_from = position + needle.len();
    }
}

fn function_symbol(id: HeapId) -> String {
    format!("Function_{:x}", id.0)
}

// ============================================================================
// Scenario: single empty method returning null
// ============================================================================

#[test]
fn empty_method_returns_null() {
    let mut builder = ProgramBuilder::new();
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);

    let function = world.llvm_function(entry).expect("entry not declared");
    // Arity 0 still takes the process pointer.
    assert_eq!(function.count_params(), 1);
    // Synthetic entry block plus the block at bci 0.
    assert_eq!(function.count_basic_blocks(), 2);

    let ir = world.module.print_to_string().to_string();
    let body = function_ir(&ir, &function_symbol(entry));
    assert!(body.contains("ret i8 addrspace(1)*"), "no object return:\n{}", body);
    assert!(body.contains("null__"), "null singleton not referenced:\n{}", body);
}

#[test]
fn parameter_lists_prepend_the_process() {
    let mut builder = ProgramBuilder::new();
    let mut asm = BytecodeAssembler::new();
    // Return the second argument.
    asm.emit_u8(Opcode::LoadLocal, 4)
        .emit(Opcode::Return)
        .emit(Opcode::MethodEnd);
    let two_arg = builder.add_function(2, asm.finish());
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);
    let function = world.llvm_function(two_arg).unwrap();
    assert_eq!(function.count_params(), 3);
    // First parameter is the raw process pointer (address space 0).
    let ir = function.print_to_string().to_string();
    assert!(ir.contains("(i8* %0, i8 addrspace(1)* %1, i8 addrspace(1)* %2)"),
        "unexpected signature:\n{}", ir);
}

// ============================================================================
// Scenario: identity smi add
// ============================================================================

#[test]
fn smi_add_has_fast_path_slow_path_and_join() {
    let selector = Selector::encode(5, SelectorKind::Method, 1);
    let mut builder = ProgramBuilder::new();
    let mut asm = BytecodeAssembler::new();
    asm.emit_u8(Opcode::LoadLocal, 4)
        .emit_u8(Opcode::LoadLocal, 4)
        .emit_i32(Opcode::InvokeAdd, selector)
        .emit(Opcode::Return)
        .emit(Opcode::MethodEnd);
    let add = builder.add_function(2, asm.finish());
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);
    let ir = world.module.print_to_string().to_string();
    let body = function_ir(&ir, &function_symbol(add));

    // Fast path: overflow-checked add on the tagged words.
    assert!(body.contains("llvm.sadd.with.overflow"), "no overflow intrinsic:\n{}", body);
    // Slow path: the per-selector helper.
    let helper = format!("Smi_{:x}", selector);
    assert!(body.contains(&helper), "no slow-case call:\n{}", body);
    // Join: a phi over the two results.
    assert!(body.contains("phi i8 addrspace(1)*"), "no join phi:\n{}", body);
    assert!(body.contains("smis:") && body.contains("nonsmi:") && body.contains("join:"));

    // The helper itself is emitted once, with a full dispatch probe.
    let helper_body = function_ir(&ir, &helper);
    assert!(helper_body.contains("bb_lookup_failure"), "helper lacks probe:\n{}", helper_body);
}

// ============================================================================
// Scenario: compare-and-branch fusion
// ============================================================================

#[test]
fn compare_branch_fusion_skips_materialization() {
    let selector = Selector::encode(9, SelectorKind::Method, 1);
    let mut builder = ProgramBuilder::new();
    let mut asm = BytecodeAssembler::new();
    // 0:  load local 3 (the argument)
    // 2:  load literal 5
    // 4:  invoke lt
    // 9:  branch-if-true +6 -> 15
    // 14: return null (fallthrough)
    // 15: return null (target)
    // 16: method end
    asm.emit_u8(Opcode::LoadLocal, 3)
        .emit_u8(Opcode::LoadLiteral, 5)
        .emit_i32(Opcode::InvokeLt, selector)
        .emit_i32(Opcode::BranchIfTrueWide, 6)
        .emit(Opcode::ReturnNull)
        .emit(Opcode::ReturnNull)
        .emit(Opcode::MethodEnd);
    let compare = builder.add_function(1, asm.finish());
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);
    let ir = world.module.print_to_string().to_string();
    let body = function_ir(&ir, &function_symbol(compare));

    // The integer compare feeds the branch directly.
    assert!(body.contains("icmp slt"), "no fused compare:\n{}", body);
    // No true/false select is materialized for the comparison.
    assert!(!body.contains("compare_result"), "boolean was materialized:\n{}", body);
    // Both wide-branch targets are reachable from the fast path.
    assert!(body.contains("bb14") && body.contains("bb15"), "targets missing:\n{}", body);
}

// ============================================================================
// Scenario: metaclass cycle
// ============================================================================

#[test]
fn metaclass_cycle_materializes_with_null_class_slot() {
    let mut builder = ProgramBuilder::new();
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);
    let meta = program.meta_class().as_heap().unwrap();

    let context = Context::create();
    let codegen = LlvmCodegen::new(&program);
    let world = codegen.build_module(&context).expect("codegen failed");

    // Materialization memoizes: both views exist and re-materializing is
    // the identical constant.
    let first = world.tagged_aspace0(meta).expect("metaclass missing");
    let heap_builder = super::heap::HeapBuilder::new(&world);
    let second = heap_builder
        .build_constant(ObjectRef::Heap(meta))
        .expect("re-materialization failed");
    assert_eq!(first, second);
    assert!(world.untagged_aspace0(meta).is_some());
    assert!(world.tagged_aspace1(meta).is_some());

    // The class slot of the metaclass constant is a null pointer.
    let ir = world.module.print_to_string().to_string();
    let global_line = ir
        .lines()
        .find(|line| line.starts_with(&format!("@Class_{:x} = ", meta.0)))
        .expect("metaclass global missing");
    assert!(
        global_line.contains("%ClassType* null"),
        "metaclass slot not null: {}",
        global_line
    );
}

// ============================================================================
// Scenario: dispatch table miss
// ============================================================================

#[test]
fn method_invocation_probes_and_falls_back_to_nsm() {
    let selector = Selector::encode(12, SelectorKind::Method, 0);
    let mut builder = ProgramBuilder::new();
    let mut asm = BytecodeAssembler::new();
    asm.emit_u8(Opcode::LoadLocal, 3)
        .emit_i32(Opcode::InvokeMethod, selector)
        .emit(Opcode::Return)
        .emit(Opcode::MethodEnd);
    let caller = builder.add_function(1, asm.finish());
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);
    let ir = world.module.print_to_string().to_string();
    let body = function_ir(&ir, &function_symbol(caller));

    // Smi receivers take the global smi class; others read their class
    // word; the probe validates the entry offset and falls back to the
    // table's 0th entry.
    assert!(body.contains("smi:") && body.contains("nonsmi:") && body.contains("lookup:"));
    assert!(body.contains("bb_lookup_failure"), "no fallback path:\n{}", body);
    assert!(body.contains("bb_lookup_success"), "no join:\n{}", body);
    assert!(body.contains("method_result"), "no indirect call:\n{}", body);
}

#[test]
fn invoke_test_materializes_a_boolean() {
    let selector = Selector::encode(12, SelectorKind::Method, 0);
    let mut builder = ProgramBuilder::new();
    let mut asm = BytecodeAssembler::new();
    asm.emit_u8(Opcode::LoadLocal, 3)
        .emit_i32(Opcode::InvokeTest, selector)
        .emit(Opcode::Return)
        .emit(Opcode::MethodEnd);
    let tester = builder.add_function(1, asm.finish());
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);
    let ir = world.module.print_to_string().to_string();
    let body = function_ir(&ir, &function_symbol(tester));
    assert!(body.contains("compare_result"), "no boolean select:\n{}", body);
    assert!(body.contains("true__") && body.contains("false__"));
}

// ============================================================================
// Scenario: determinism
// ============================================================================

#[test]
fn identical_snapshots_produce_identical_bitcode() {
    let build = || {
        let mut builder = ProgramBuilder::new();
        let helper = builder.add_function(1, return_null_body());
        let mut asm = BytecodeAssembler::new();
        asm.emit(Opcode::LoadLiteralNull)
            .emit_i32(Opcode::InvokeStatic, 0)
            .emit(Opcode::Return)
            .emit(Opcode::MethodEnd);
        let entry =
            builder.add_function_with_literals(0, asm.finish(), vec![ObjectRef::Heap(helper)]);
        builder.finish(entry)
    };

    let dir = tempfile::tempdir().expect("no tempdir");
    let first_path = dir.path().join("first.bc");
    let second_path = dir.path().join("second.bc");

    let first_program = build();
    LlvmCodegen::new(&first_program)
        .generate(&first_path, true, true)
        .expect("first compile failed");
    let second_program = build();
    LlvmCodegen::new(&second_program)
        .generate(&second_path, true, true)
        .expect("second compile failed");

    let first = std::fs::read(&first_path).expect("first output missing");
    let second = std::fs::read(&second_path).expect("second output missing");
    assert!(!first.is_empty());
    assert_eq!(first, second, "bitcode differs between runs");

    // The output deserializes, and the stable symbols are present.
    let context = Context::create();
    let module = Module::parse_bitcode_from_path(&first_path, &context)
        .expect("bitcode does not parse");
    for symbol in ["program_start", "program_size", "program_entry", "program_info_block"] {
        assert!(module.get_global(symbol).is_some(), "{} missing", symbol);
    }
}

// ============================================================================
// Materializer properties
// ============================================================================

#[test]
fn every_heap_object_materializes_exactly_once() {
    let mut builder = ProgramBuilder::new();
    let string = builder.add_string("hello");
    let bytes = builder.add_byte_array(vec![1, 2, 3]);
    let double = builder.add_double(2.5);
    let large = builder.add_large_integer(1i64 << 40);
    let array = builder.add_array(vec![
        ObjectRef::Heap(string),
        ObjectRef::Smi(7),
        ObjectRef::Heap(double),
    ]);
    let entry = builder.add_function(0, return_null_body());
    let _ = (bytes, large, array);
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);

    // All three maps agree on every heap object.
    let mut missing = HashSet::new();
    program.heap().iterate_objects(|id, _| {
        if world.untagged_aspace0(id).is_none()
            || world.tagged_aspace0(id).is_none()
            || world.tagged_aspace1(id).is_none()
        {
            missing.insert(id);
        }
    });
    assert!(missing.is_empty(), "objects without constants: {:?}", missing);

    let ir = world.module.print_to_string().to_string();
    assert!(ir.contains("@OneByteString_"), "string constant missing");
    assert!(ir.contains("@ByteArrayInstance_"), "byte array constant missing");
    assert!(ir.contains("@DoubleObject"), "double constant missing");
    assert!(ir.contains("@LargeIntegerObject_"), "large integer constant missing");
    assert!(ir.contains("@ArrayInstance_"), "array constant missing");
    assert!(ir.contains("@true__") && ir.contains("@false__") && ir.contains("@null__"));
}

#[test]
fn function_objects_embed_their_code_symbol() {
    let mut builder = ProgramBuilder::new();
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);
    let ir = world.module.print_to_string().to_string();

    let symbol = function_symbol(entry);
    let object_line = ir
        .lines()
        .find(|line| line.starts_with(&format!("@FunctionObject_{:x} = ", entry.0)))
        .expect("function object constant missing");
    assert!(
        object_line.contains("ptrtoint") && object_line.contains(&format!("@{}", symbol)),
        "machine-code slot does not reference the function: {}",
        object_line
    );
}

// ============================================================================
// Statics, allocation, natives, boxing
// ============================================================================

#[test]
fn load_static_init_emits_the_initializer_diamond() {
    let mut builder = ProgramBuilder::new();
    let mut asm = BytecodeAssembler::new();
    asm.emit_i32(Opcode::LoadStaticInit, 0)
        .emit(Opcode::Return)
        .emit(Opcode::MethodEnd);
    let loader = builder.add_function(0, asm.finish());
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);
    let ir = world.module.print_to_string().to_string();
    let body = function_ir(&ir, &function_symbol(loader));

    assert!(body.contains("bb_initializer"), "no initializer arm:\n{}", body);
    assert!(body.contains("join:"), "no join:\n{}", body);
    assert!(body.contains("phi i8 addrspace(1)*"), "no phi at join:\n{}", body);
    assert!(body.contains("initializer_result"), "initializer not invoked:\n{}", body);
}

#[test]
fn allocate_calls_the_runtime_and_fills_fields_backwards() {
    let mut builder = ProgramBuilder::new();
    let class = builder.add_class(None, 2);
    let mut asm = BytecodeAssembler::new();
    asm.emit(Opcode::LoadLiteralNull)
        .emit(Opcode::LoadLiteralTrue)
        .emit_i32(Opcode::Allocate, 0)
        .emit(Opcode::Return)
        .emit(Opcode::MethodEnd);
    let allocator =
        builder.add_function_with_literals(0, asm.finish(), vec![ObjectRef::Heap(class)]);
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);
    let ir = world.module.print_to_string().to_string();
    let body = function_ir(&ir, &function_symbol(allocator));

    assert!(body.contains("@HandleAllocate"), "no allocator call:\n{}", body);
    // Two field initializations (plain stores after intrinsic lowering).
    assert!(body.matches("store i8 addrspace(1)*").count() >= 2, "fields not stored:\n{}", body);
}

#[test]
fn native_invocation_returns_fast_and_converts_failures() {
    let mut builder = ProgramBuilder::new();
    let mut asm = BytecodeAssembler::new();
    asm.emit_u8_u8(Opcode::InvokeNative, 1, Native::PrintToConsole as u8)
        .emit(Opcode::Return)
        .emit(Opcode::MethodEnd);
    let wrapper = builder.add_function(1, asm.finish());
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);
    let ir = world.module.print_to_string().to_string();
    let body = function_ir(&ir, &function_symbol(wrapper));

    assert!(body.contains("@Native_PrintToConsole"), "native not called:\n{}", body);
    assert!(body.contains("no_failure:") && body.contains("failure:"));
    assert!(body.contains("@HandleObjectFromFailure"), "failure not converted:\n{}", body);
}

#[test]
fn boxed_values_round_through_the_runtime() {
    let mut builder = ProgramBuilder::new();
    let mut asm = BytecodeAssembler::new();
    asm.emit(Opcode::LoadLiteral0)
        .emit(Opcode::AllocateBoxed)
        .emit(Opcode::Return)
        .emit(Opcode::MethodEnd);
    let boxer = builder.add_function(0, asm.finish());
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);
    let ir = world.module.print_to_string().to_string();
    let body = function_ir(&ir, &function_symbol(boxer));
    assert!(body.contains("@HandleAllocateBoxed"), "no boxed allocation:\n{}", body);
}

// ============================================================================
// Declarations and symbols
// ============================================================================

#[test]
fn natives_are_declared_with_the_shared_signature() {
    let mut builder = ProgramBuilder::new();
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);

    assert_eq!(
        world.natives.borrow().len(),
        crate::snapshot::natives::NATIVE_COUNT
    );
    let declaration = world
        .module
        .get_function("Native_PrintToConsole")
        .expect("native declaration missing");
    assert_eq!(declaration.count_params(), 2);
    assert!(declaration.get_basic_blocks().is_empty());
}

#[test]
fn root_block_covers_every_root_slot() {
    let mut builder = ProgramBuilder::new();
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);

    assert_eq!(
        world.roots_type.count_fields() as usize,
        Program::ROOT_COUNT
    );
    assert!(world.module.get_global("program_info_block").is_some());
    let ir = world.module.print_to_string().to_string();
    let line = ir
        .lines()
        .find(|line| line.starts_with("@program_info_block"))
        .expect("program_info_block missing");
    assert!(line.contains("%ProgramRootsType"), "roots global untyped: {}", line);
}

// ============================================================================
// Intrinsic lowering
// ============================================================================

#[test]
fn no_intrinsic_calls_survive_the_final_pass() {
    let mut builder = ProgramBuilder::new();
    // Field traffic, statics and a smi op guarantee every intrinsic is
    // exercised before the pass runs.
    let selector = Selector::encode(4, SelectorKind::Method, 1);
    let mut asm = BytecodeAssembler::new();
    asm.emit_u8(Opcode::LoadLocal, 3)
        .emit_u8(Opcode::LoadField, 0)
        .emit_u8(Opcode::LoadLocal, 4)
        .emit_i32(Opcode::InvokeAdd, selector)
        .emit_i32(Opcode::StoreStatic, 0)
        .emit(Opcode::Return)
        .emit(Opcode::MethodEnd);
    let worker = builder.add_function(1, asm.finish());
    let entry = builder.add_function(0, return_null_body());
    let program = builder.finish(entry);

    let context = Context::create();
    let world = compile(&context, &program, false);
    let ir = world.module.print_to_string().to_string();

    // Only the bare declarations may mention the intrinsic symbols.
    for line in ir.lines() {
        if line.contains("@wisp.") {
            assert!(
                line.trim_start().starts_with("declare"),
                "intrinsic call survived lowering: {}",
                line
            );
        }
    }
    // The lowering produced raw tag arithmetic: the tagread/tagwrite
    // sites became GEPs with plain loads/stores, and the dispatch probe
    // in the slow-case helper smi-decodes with an arithmetic shift.
    let body = function_ir(&ir, &function_symbol(worker));
    assert!(body.contains("getelementptr"), "no address arithmetic:\n{}", body);
    assert!(body.contains("store i8 addrspace(1)*"), "no raw store:\n{}", body);
    let helper = function_ir(&ir, &format!("Smi_{:x}", selector));
    assert!(helper.contains("ashr"), "smi decode not lowered:\n{}", helper);
}

#[test]
fn optimized_modules_still_verify() {
    let selector = Selector::encode(4, SelectorKind::Method, 1);
    let mut builder = ProgramBuilder::new();
    let mut asm = BytecodeAssembler::new();
    asm.emit_u8(Opcode::LoadLocal, 4)
        .emit_u8(Opcode::LoadLocal, 4)
        .emit_i32(Opcode::InvokeAdd, selector)
        .emit(Opcode::Return)
        .emit(Opcode::MethodEnd);
    let add = builder.add_function(2, asm.finish());
    let entry = builder.add_function(0, return_null_body());
    let _ = add;
    let program = builder.finish(entry);

    let context = Context::create();
    // Optimize, then re-verify the whole module after the final pass.
    let world = compile(&context, &program, true);
    world.module.verify().expect("post-optimization module is invalid");
}
