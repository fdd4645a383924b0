//! # Code Generation
//!
//! Translates a program snapshot into an LLVM module and serializes it
//! as bitcode for the native backend.
//!
//! # Architecture
//!
//! ```text
//! Program snapshot
//!   -> World            (type environment, runtime declarations)
//!   -> HeapBuilder      (typed constants for every heap object)
//!   -> RootsBuilder     (the program root block)
//!   -> NativesBuilder   (external native declarations)
//!   -> MethodLowerer    (one LLVM function per bytecoded method)
//!   -> GlobalSymbols    (program_start/size/entry/info_block)
//!   -> verify -> optimize -> GC-intrinsic lowering -> bitcode
//! ```
//!
//! The compiler is single-threaded by contract: all state lives in one
//! driver-scoped [`World`], and nothing blocks except the final bitcode
//! write. Heap iteration order is deterministic, so compiling the same
//! snapshot twice produces bit-identical output.

pub mod block_builder;
pub mod explorer;
pub mod heap;
pub mod intrinsics;
pub mod natives;
pub mod roots;
pub mod world;

#[cfg(test)]
mod tests;

use std::path::Path;

use inkwell::context::Context;
use inkwell::passes::PassManager;
use inkwell::values::FunctionValue;
use tracing::{debug, info};

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::ice;
use crate::snapshot::{HeapObject, Program};

use block_builder::MethodLowerer;
use explorer::BasicBlocksExplorer;
use heap::HeapBuilder;
use natives::NativesBuilder;
use roots::{GlobalSymbolsBuilder, RootsBuilder};
use world::World;

/// The ahead-of-time compiler entry point.
pub struct LlvmCodegen<'p> {
    program: &'p Program,
}

impl<'p> LlvmCodegen<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self { program }
    }

    /// Compile the snapshot and write bitcode to `filename`.
    ///
    /// `optimize` runs the fixed mem2reg / CFG-simplification / SCCP
    /// pipeline; `verify_module` runs whole-module verification first
    /// (time-consuming, but failures here mean unsound output).
    pub fn generate(
        &self,
        filename: &Path,
        optimize: bool,
        verify_module: bool,
    ) -> Result<(), Vec<Diagnostic>> {
        let context = Context::create();
        let world = self.build_module(&context)?;
        Self::finalize(&world, optimize, verify_module)?;
        Self::save_module(&world, filename)
    }

    /// Phases 1-6: build the whole module (constants, functions, roots,
    /// globals) without verification, optimization or serialization.
    pub fn build_module<'ctx>(
        &self,
        context: &'ctx Context,
    ) -> Result<World<'ctx, 'p>, Vec<Diagnostic>> {
        let module = context.create_module("wisp_program");
        let world = World::new(self.program, context, module);

        info!(objects = self.program.heap().len(), "materializing heap");
        let heap_builder = HeapBuilder::new(&world);
        heap_builder.build_all()?;

        let roots = RootsBuilder::new(&world, &heap_builder).build_roots()?;

        NativesBuilder::new(&world).build_native_declarations();

        self.build_functions(&world)?;

        GlobalSymbolsBuilder::new(&world).build_global_symbols(roots)?;
        Ok(world)
    }

    /// Verification, optimization and the mandatory intrinsic lowering.
    pub fn finalize(
        world: &World<'_, 'p>,
        optimize: bool,
        verify_module: bool,
    ) -> Result<(), Vec<Diagnostic>> {
        if verify_module {
            Self::verify_module(world)?;
        }
        if optimize {
            Self::optimize_module(world);
        }
        intrinsics::RewriteGcIntrinsics::new(world).run()
    }

    /// Lower every bytecoded method, in heap order.
    fn build_functions(&self, world: &World<'_, 'p>) -> Result<(), Vec<Diagnostic>> {
        let mut ids = Vec::new();
        self.program.heap().iterate_objects(|id, object| {
            if matches!(object, HeapObject::Function(_)) {
                ids.push(id);
            }
        });

        for id in ids {
            let function = self
                .program
                .heap()
                .function(id)
                .ok_or_else(|| vec![ice!("function {} disappeared", id)])?;
            debug!(function = %id, arity = function.arity, "lowering method");
            let analysis = BasicBlocksExplorer::new(self.program, function).explore()?;
            MethodLowerer::new(world, id).lower(&analysis)?;
        }
        Ok(())
    }

    fn verify_module(world: &World) -> Result<(), Vec<Diagnostic>> {
        info!("module verification started");
        if let Err(message) = world.module.verify() {
            eprintln!("{}", message.to_string_lossy());
            return Err(vec![Diagnostic::error_with_code(
                ErrorCode::ModuleVerification,
                "module verification failed, cannot proceed",
            )]);
        }
        info!("module verification passed");
        Ok(())
    }

    fn optimize_module(world: &World) {
        let passes: PassManager<FunctionValue> = PassManager::create(&world.module);
        passes.add_promote_memory_to_register_pass();
        passes.add_cfg_simplification_pass();
        // Constant propagation, as the sparse-conditional flavor.
        passes.add_sccp_pass();
        passes.initialize();

        let mut function = world.module.get_first_function();
        while let Some(current) = function {
            if current.count_basic_blocks() > 0 {
                passes.run_on(&current);
            }
            function = current.get_next_function();
        }
        passes.finalize();
    }

    fn save_module(world: &World, filename: &Path) -> Result<(), Vec<Diagnostic>> {
        if !world.module.write_bitcode_to_path(filename) {
            return Err(vec![Diagnostic::error_with_code(
                ErrorCode::BitcodeWrite,
                format!("could not write output file {}", filename.display()),
            )]);
        }
        info!(file = %filename.display(), "bitcode written");
        Ok(())
    }
}
