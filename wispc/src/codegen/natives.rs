//! # Native Declarations
//!
//! One external declaration per native kind, named `Native_<Name>`, all
//! sharing the signature `(process, pointer-to-last-argument) -> object`.
//! The declarations land in a dense vector indexed by the native enum
//! value so call sites can grab them without a name lookup.

use inkwell::module::Linkage;

use crate::snapshot::natives::ALL_NATIVES;

use super::world::World;

/// Emits the external declarations for all native methods.
pub struct NativesBuilder<'ctx, 'p, 'w> {
    w: &'w World<'ctx, 'p>,
}

impl<'ctx, 'p, 'w> NativesBuilder<'ctx, 'p, 'w> {
    pub fn new(w: &'w World<'ctx, 'p>) -> Self {
        Self { w }
    }

    pub fn build_native_declarations(&self) {
        let function_type = self.w.object_ptr_type.fn_type(
            &[
                self.w.process_ptr_type.into(),
                self.w.arguments_ptr_type.into(),
            ],
            false,
        );

        for native in ALL_NATIVES {
            // Each native must land at its enum index.
            debug_assert_eq!(self.w.natives.borrow().len(), native as usize);
            let declaration = self.w.module.add_function(
                &format!("Native_{}", native.name()),
                function_type,
                Some(Linkage::External),
            );
            self.w.natives.borrow_mut().push(declaration);
        }
    }
}
