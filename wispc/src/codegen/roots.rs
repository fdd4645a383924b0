//! # Roots and Global Symbols
//!
//! Serializes the program's root pointer set into the
//! `ProgramRootsType` struct constant and emits the four fixed
//! program-level symbols the runtime links against: `program_start`,
//! `program_size`, `program_entry` and `program_info_block`.

use inkwell::values::{BasicValueEnum, StructValue};

use crate::diagnostics::Diagnostic;
use crate::ice;
use crate::snapshot::ObjectRef;

use super::heap::HeapBuilder;
use super::world::World;

/// Builds the root-block constant.
pub struct RootsBuilder<'ctx, 'p, 'w> {
    w: &'w World<'ctx, 'p>,
    heap_builder: &'w HeapBuilder<'ctx, 'p, 'w>,
}

impl<'ctx, 'p, 'w> RootsBuilder<'ctx, 'p, 'w> {
    pub fn new(w: &'w World<'ctx, 'p>, heap_builder: &'w HeapBuilder<'ctx, 'p, 'w>) -> Self {
        Self { w, heap_builder }
    }

    /// Materialize every root slot (in fixed declared order) into one
    /// struct constant of AS0 tagged pointers.
    pub fn build_roots(&self) -> Result<StructValue<'ctx>, Vec<Diagnostic>> {
        let mut slots = Vec::new();
        self.w
            .program
            .iterate_roots_ignoring_session(|object| slots.push(object));

        let mut fields: Vec<BasicValueEnum> = Vec::with_capacity(slots.len());
        for object in slots {
            let field = match object {
                ObjectRef::Heap(id) => {
                    // Roots may not have been reached by the heap walk
                    // yet; materialize on demand.
                    self.heap_builder.build_constant(object)?;
                    let constant = self
                        .w
                        .tagged_aspace0(id)
                        .ok_or_else(|| vec![ice!("root {} failed to materialize", id)])?;
                    // Root constants carry their own struct pointer
                    // types; the roots block stores plain object words.
                    self.w.c_cast(constant, None)
                }
                ObjectRef::Smi(value) => self
                    .w
                    .c_int_to_pointer(self.w.c_smi(value), Some(self.w.object_ptr_aspace0_type)),
            };
            fields.push(field.into());
        }
        Ok(self.w.roots_type.const_named_struct(&fields))
    }
}

/// Emits the fixed program-level symbols.
pub struct GlobalSymbolsBuilder<'ctx, 'p, 'w> {
    w: &'w World<'ctx, 'p>,
}

impl<'ctx, 'p, 'w> GlobalSymbolsBuilder<'ctx, 'p, 'w> {
    pub fn new(w: &'w World<'ctx, 'p>) -> Self {
        Self { w }
    }

    pub fn build_global_symbols(&self, roots: StructValue<'ctx>) -> Result<(), Vec<Diagnostic>> {
        // Placeholder load address and reserved image size; the runtime
        // relocates the image and only needs the symbols to exist.
        let program_start = self.w.module.add_global(self.w.intptr_type, None, "program_start");
        program_start.set_initializer(&self.w.c_word(4096));
        program_start.set_constant(true);

        let program_size = self.w.module.add_global(self.w.intptr_type, None, "program_size");
        program_size.set_initializer(&self.w.c_word(1024 * 1024));
        program_size.set_constant(true);

        let entry = self
            .w
            .llvm_function(self.w.program.entry())
            .ok_or_else(|| vec![ice!("entry function was never declared")])?;
        let entry_pointer = entry.as_global_value().as_pointer_value();
        let program_entry =
            self.w
                .module
                .add_global(entry_pointer.get_type(), None, "program_entry");
        program_entry.set_initializer(&entry_pointer);
        program_entry.set_constant(true);

        let info_block = self
            .w
            .module
            .add_global(self.w.roots_type, None, "program_info_block");
        info_block.set_initializer(&roots);
        info_block.set_constant(true);

        Ok(())
    }
}
