//! # Wisp Snapshot Compiler Library
//!
//! `wispc` translates a snapshotted Wisp program (class hierarchy, bytecoded
//! methods, constants, roots) ahead of time into an LLVM module that the
//! native code-generation backend can turn into machine code.
//!
//! ## Compilation Pipeline
//!
//! ```text
//! Program snapshot -> Heap constants -> Per-method LLVM functions
//!                  -> Roots & global symbols -> verify -> optimize
//!                  -> GC-intrinsic lowering -> bitcode file
//! ```
//!
//! The two load-bearing subsystems are:
//!
//! - **Heap materialization** ([`codegen::heap`]): every reachable heap
//!   object becomes a typed, fully linked LLVM constant. Object identity,
//!   pointer tagging and the class/metaclass cycles are preserved even
//!   though LLVM constants cannot be cyclic.
//! - **Bytecode lowering** ([`codegen::block_builder`]): each bytecoded
//!   method is rewritten from a stack machine into alloca-based SSA with
//!   one LLVM basic block per discovered leader, including the dispatch
//!   table probes and smi fast paths the runtime calling convention
//!   expects.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use wispc::snapshot::ProgramBuilder;
//! use wispc::snapshot::bytecode::Opcode;
//! use wispc::codegen::LlvmCodegen;
//!
//! let mut builder = ProgramBuilder::new();
//! let entry = builder.add_function(0, vec![
//!     Opcode::ReturnNull as u8,
//!     Opcode::MethodEnd as u8,
//! ]);
//! let program = builder.finish(entry);
//!
//! let codegen = LlvmCodegen::new(&program);
//! codegen
//!     .generate(Path::new("out.bc"), /* optimize */ true, /* verify */ true)
//!     .expect("compilation failed");
//! ```
//!
//! The crate is a library on purpose: process launching, the compiler
//! daemon protocol and the rest of the tooling live outside and link
//! against [`codegen::LlvmCodegen`] only.

pub mod diagnostics;
pub mod snapshot;
pub mod codegen;

pub use codegen::LlvmCodegen;
pub use diagnostics::{Diagnostic, DiagnosticKind, ErrorCode};
pub use snapshot::{Program, ProgramBuilder};
