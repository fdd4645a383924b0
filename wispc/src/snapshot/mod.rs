//! # Program Snapshots
//!
//! The read-only input to the compiler: a [`Program`] owns a [`Heap`] of
//! objects plus a fixed set of well-known roots (null, true, false, the
//! special classes, the dispatch table) and the entry function.
//!
//! Classes form a DAG through their super class, with one deliberate
//! cycle: the metaclass is its own class. The compiler's heap
//! materializer resolves that cycle; everything else in a well-formed
//! snapshot is acyclic apart from the function/dispatch-entry references
//! that are broken by declaring function symbols before their bodies.
//!
//! [`ProgramBuilder`] wires the core object graph (metaclass, the special
//! classes, null/true/false, a dispatch table with the no-such-method
//! entry at index 0) so snapshot loaders and tests only add the
//! program-specific parts.

pub mod bytecode;
pub mod natives;
pub mod object;
pub mod selector;

pub use object::{
    ClassObject, DispatchEntryObject, FrameRange, FunctionObject, Heap, HeapId, HeapObject,
    InstanceFormat, InstanceKind, InstanceObject, ObjectRef,
};

use object::{
    ArrayObject, ByteArrayObject, DoubleObject, InitializerObject, LargeIntegerObject,
    OneByteStringObject,
};

// ============================================================================
// Program
// ============================================================================

/// The well-known singleton roots of a program.
#[derive(Debug, Clone)]
pub struct ProgramRoots {
    pub meta_class: ObjectRef,
    pub null_object: ObjectRef,
    pub true_object: ObjectRef,
    pub false_object: ObjectRef,
    pub smi_class: ObjectRef,
    pub large_integer_class: ObjectRef,
    pub double_class: ObjectRef,
    pub boxed_class: ObjectRef,
    pub initializer_class: ObjectRef,
    pub dispatch_table: ObjectRef,
}

/// A complete, immutable program snapshot.
#[derive(Debug)]
pub struct Program {
    heap: Heap,
    roots: ProgramRoots,
    entry: HeapId,
}

impl Program {
    /// Number of slots visited by [`Program::iterate_roots_ignoring_session`]:
    /// the named roots plus the entry function.
    pub const ROOT_COUNT: usize = 11;

    /// The object heap.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The entry function.
    pub fn entry(&self) -> HeapId {
        self.entry
    }

    pub fn meta_class(&self) -> ObjectRef {
        self.roots.meta_class
    }

    pub fn null_object(&self) -> ObjectRef {
        self.roots.null_object
    }

    pub fn true_object(&self) -> ObjectRef {
        self.roots.true_object
    }

    pub fn false_object(&self) -> ObjectRef {
        self.roots.false_object
    }

    pub fn smi_class(&self) -> ObjectRef {
        self.roots.smi_class
    }

    pub fn large_integer_class(&self) -> ObjectRef {
        self.roots.large_integer_class
    }

    pub fn double_class(&self) -> ObjectRef {
        self.roots.double_class
    }

    pub fn boxed_class(&self) -> ObjectRef {
        self.roots.boxed_class
    }

    pub fn initializer_class(&self) -> ObjectRef {
        self.roots.initializer_class
    }

    pub fn dispatch_table(&self) -> ObjectRef {
        self.roots.dispatch_table
    }

    /// Visit every root slot in fixed declared order, ending with the
    /// entry function. Session-local debugging roots are not part of a
    /// snapshot and are never visited.
    pub fn iterate_roots_ignoring_session(&self, mut visitor: impl FnMut(ObjectRef)) {
        visitor(self.roots.meta_class);
        visitor(self.roots.null_object);
        visitor(self.roots.true_object);
        visitor(self.roots.false_object);
        visitor(self.roots.smi_class);
        visitor(self.roots.large_integer_class);
        visitor(self.roots.double_class);
        visitor(self.roots.boxed_class);
        visitor(self.roots.initializer_class);
        visitor(self.roots.dispatch_table);
        visitor(ObjectRef::Heap(self.entry));
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Constructs well-formed [`Program`] snapshots.
#[derive(Debug)]
pub struct ProgramBuilder {
    heap: Heap,
    roots: ProgramRoots,
    function_class: ObjectRef,
    array_class: ObjectRef,
    byte_array_class: ObjectRef,
    string_class: ObjectRef,
    instance_class: ObjectRef,
    dispatch_entry_class: ObjectRef,
    next_class_id: i64,
}

impl ProgramBuilder {
    /// Create a builder with the core object graph wired: the metaclass
    /// cycle, the special classes, null/true/false, and a dispatch table
    /// whose index 0 holds the no-such-method entry.
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let mut next_class_id = 0i64;

        // The metaclass is its own class; patch the cycle after
        // allocation.
        let meta_class = heap.allocate(HeapObject::Class(ClassObject {
            class: ObjectRef::Smi(0),
            super_class: None,
            instance_format: InstanceFormat::new(InstanceKind::Class),
            id: next_class_id,
            child_id: 0,
            methods: None,
            instance_fields: 0,
        }));
        next_class_id += 1;
        if let Some(HeapObject::Class(class)) = heap.get_mut(meta_class) {
            class.class = ObjectRef::Heap(meta_class);
        }
        let meta_class = ObjectRef::Heap(meta_class);

        let mut make_class = |heap: &mut Heap, kind: InstanceKind| {
            let id = heap.allocate(HeapObject::Class(ClassObject {
                class: meta_class,
                super_class: None,
                instance_format: InstanceFormat::new(kind),
                id: next_class_id,
                child_id: 0,
                methods: None,
                instance_fields: 0,
            }));
            next_class_id += 1;
            ObjectRef::Heap(id)
        };

        let null_class = make_class(&mut heap, InstanceKind::Instance);
        let bool_class = make_class(&mut heap, InstanceKind::Instance);
        let smi_class = make_class(&mut heap, InstanceKind::Instance);
        let large_integer_class = make_class(&mut heap, InstanceKind::LargeInteger);
        let double_class = make_class(&mut heap, InstanceKind::Double);
        let boxed_class = make_class(&mut heap, InstanceKind::Boxed);
        let initializer_class = make_class(&mut heap, InstanceKind::Initializer);
        let function_class = make_class(&mut heap, InstanceKind::Function);
        let array_class = make_class(&mut heap, InstanceKind::Array);
        let byte_array_class = make_class(&mut heap, InstanceKind::ByteArray);
        let string_class = make_class(&mut heap, InstanceKind::OneByteString);
        let instance_class = make_class(&mut heap, InstanceKind::Instance);
        let dispatch_entry_class = make_class(&mut heap, InstanceKind::DispatchTableEntry);

        let null_object = ObjectRef::Heap(heap.allocate(HeapObject::Instance(InstanceObject {
            class: null_class,
            flags: 0,
            fields: Vec::new(),
        })));
        let true_object = ObjectRef::Heap(heap.allocate(HeapObject::Instance(InstanceObject {
            class: bool_class,
            flags: 0,
            fields: Vec::new(),
        })));
        let false_object = ObjectRef::Heap(heap.allocate(HeapObject::Instance(InstanceObject {
            class: bool_class,
            flags: 0,
            fields: Vec::new(),
        })));

        // The no-such-method fallback lives at dispatch table index 0.
        // Its offset can never equal a selector offset, which are >= 0.
        let nsm_function = heap.allocate(HeapObject::Function(FunctionObject {
            class: function_class,
            arity: 1,
            bytecode: vec![
                bytecode::Opcode::ReturnNull as u8,
                bytecode::Opcode::MethodEnd as u8,
            ],
            literals: Vec::new(),
            frame_ranges: Vec::new(),
        }));
        let nsm_entry = heap.allocate(HeapObject::DispatchTableEntry(DispatchEntryObject {
            class: dispatch_entry_class,
            target: ObjectRef::Heap(nsm_function),
            offset: ObjectRef::Smi(-1),
            selector: 0,
        }));
        let dispatch_table = ObjectRef::Heap(heap.allocate(HeapObject::Array(ArrayObject {
            class: array_class,
            elements: vec![ObjectRef::Heap(nsm_entry)],
        })));

        Self {
            heap,
            roots: ProgramRoots {
                meta_class,
                null_object,
                true_object,
                false_object,
                smi_class,
                large_integer_class,
                double_class,
                boxed_class,
                initializer_class,
                dispatch_table,
            },
            function_class,
            array_class,
            byte_array_class,
            string_class,
            instance_class,
            dispatch_entry_class,
            next_class_id,
        }
    }

    /// The null singleton.
    pub fn null_object(&self) -> ObjectRef {
        self.roots.null_object
    }

    /// The true singleton.
    pub fn true_object(&self) -> ObjectRef {
        self.roots.true_object
    }

    /// The false singleton.
    pub fn false_object(&self) -> ObjectRef {
        self.roots.false_object
    }

    /// Add a user class with `instance_fields` fields.
    pub fn add_class(&mut self, super_class: Option<ObjectRef>, instance_fields: usize) -> HeapId {
        let id = self.heap.allocate(HeapObject::Class(ClassObject {
            class: self.roots.meta_class,
            super_class,
            instance_format: InstanceFormat::new(InstanceKind::Instance),
            id: self.next_class_id,
            child_id: 0,
            methods: None,
            instance_fields,
        }));
        self.next_class_id += 1;
        id
    }

    /// Attach a method array to a class.
    pub fn set_class_methods(&mut self, class: HeapId, methods: ObjectRef) {
        if let Some(HeapObject::Class(class)) = self.heap.get_mut(class) {
            class.methods = Some(methods);
        }
    }

    /// Add a bytecoded function without literals.
    pub fn add_function(&mut self, arity: usize, bytecode: Vec<u8>) -> HeapId {
        self.add_function_with_literals(arity, bytecode, Vec::new())
    }

    /// Add a bytecoded function with a literal table.
    pub fn add_function_with_literals(
        &mut self,
        arity: usize,
        bytecode: Vec<u8>,
        literals: Vec<ObjectRef>,
    ) -> HeapId {
        self.heap.allocate(HeapObject::Function(FunctionObject {
            class: self.function_class,
            arity,
            bytecode,
            literals,
            frame_ranges: Vec::new(),
        }))
    }

    /// Attach catch-block frame ranges to a function.
    pub fn set_frame_ranges(&mut self, function: HeapId, ranges: Vec<FrameRange>) {
        if let Some(HeapObject::Function(function)) = self.heap.get_mut(function) {
            function.frame_ranges = ranges;
        }
    }

    /// Add an object array.
    pub fn add_array(&mut self, elements: Vec<ObjectRef>) -> HeapId {
        self.heap.allocate(HeapObject::Array(ArrayObject {
            class: self.array_class,
            elements,
        }))
    }

    /// Add a byte array.
    pub fn add_byte_array(&mut self, bytes: Vec<u8>) -> HeapId {
        self.heap.allocate(HeapObject::ByteArray(ByteArrayObject {
            class: self.byte_array_class,
            bytes,
        }))
    }

    /// Add a latin-1 string.
    pub fn add_string(&mut self, chars: &str) -> HeapId {
        self.heap.allocate(HeapObject::OneByteString(OneByteStringObject {
            class: self.string_class,
            chars: chars.bytes().collect(),
        }))
    }

    /// Add an instance of `class` with the given field values.
    pub fn add_instance(&mut self, class: ObjectRef, fields: Vec<ObjectRef>) -> HeapId {
        self.heap.allocate(HeapObject::Instance(InstanceObject {
            class,
            flags: 0,
            fields,
        }))
    }

    /// Add a plain instance of the generic instance class.
    pub fn add_plain_instance(&mut self, fields: Vec<ObjectRef>) -> HeapId {
        let class = self.instance_class;
        self.add_instance(class, fields)
    }

    /// Add a lazy static initializer for `function`.
    pub fn add_initializer(&mut self, function: ObjectRef) -> HeapId {
        self.heap.allocate(HeapObject::Initializer(InitializerObject {
            class: self.roots.initializer_class,
            function,
        }))
    }

    /// Add a dispatch table entry.
    pub fn add_dispatch_entry(
        &mut self,
        target: ObjectRef,
        offset: i64,
        selector: i64,
    ) -> HeapId {
        self.heap.allocate(HeapObject::DispatchTableEntry(DispatchEntryObject {
            class: self.dispatch_entry_class,
            target,
            offset: ObjectRef::Smi(offset),
            selector,
        }))
    }

    /// Add a boxed integer.
    pub fn add_large_integer(&mut self, value: i64) -> HeapId {
        self.heap.allocate(HeapObject::LargeInteger(LargeIntegerObject {
            class: self.roots.large_integer_class,
            value,
        }))
    }

    /// Add a boxed double.
    pub fn add_double(&mut self, value: f64) -> HeapId {
        self.heap.allocate(HeapObject::Double(DoubleObject {
            class: self.roots.double_class,
            value,
        }))
    }

    /// Replace the dispatch table. The array's element 0 must remain the
    /// no-such-method entry.
    pub fn set_dispatch_table(&mut self, table: ObjectRef) {
        self.roots.dispatch_table = table;
    }

    /// Finish, producing the immutable snapshot with `entry` as the
    /// program entry function.
    pub fn finish(self, entry: HeapId) -> Program {
        Program {
            heap: self.heap,
            roots: self.roots,
            entry,
        }
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::bytecode::Opcode;
    use super::*;

    fn trivial_program() -> Program {
        let mut builder = ProgramBuilder::new();
        let entry = builder.add_function(
            0,
            vec![Opcode::ReturnNull as u8, Opcode::MethodEnd as u8],
        );
        builder.finish(entry)
    }

    #[test]
    fn metaclass_is_its_own_class() {
        let program = trivial_program();
        let meta = program.meta_class().as_heap().unwrap();
        let class = program.heap().class(meta).unwrap();
        assert_eq!(class.class, ObjectRef::Heap(meta));
        assert!(class.super_class.is_none());
    }

    #[test]
    fn dispatch_table_has_nsm_at_index_zero() {
        let program = trivial_program();
        let table = program.dispatch_table().as_heap().unwrap();
        let array = program.heap().array(table).unwrap();
        let entry = array.elements[0].as_heap().unwrap();
        match program.heap().get(entry) {
            Some(HeapObject::DispatchTableEntry(entry)) => {
                // The fallback entry's offset never matches a selector
                // offset, which are non-negative.
                assert_eq!(entry.offset, ObjectRef::Smi(-1));
                assert!(entry.target.is_heap_object());
            }
            other => panic!("expected dispatch entry, got {:?}", other),
        }
    }

    #[test]
    fn roots_are_visited_in_fixed_order() {
        let program = trivial_program();
        let mut first = Vec::new();
        program.iterate_roots_ignoring_session(|root| first.push(root));
        let mut second = Vec::new();
        program.iterate_roots_ignoring_session(|root| second.push(root));

        assert_eq!(first.len(), Program::ROOT_COUNT);
        assert_eq!(first, second);
        assert_eq!(first[0], program.meta_class());
        assert_eq!(first[1], program.null_object());
        assert_eq!(*first.last().unwrap(), ObjectRef::Heap(program.entry()));
    }

    #[test]
    fn class_ids_are_dense_and_distinct() {
        let mut builder = ProgramBuilder::new();
        let a = builder.add_class(None, 1);
        let b = builder.add_class(Some(ObjectRef::Heap(a)), 2);
        let entry = builder.add_function(
            0,
            vec![Opcode::ReturnNull as u8, Opcode::MethodEnd as u8],
        );
        let program = builder.finish(entry);

        let class_a = program.heap().class(a).unwrap();
        let class_b = program.heap().class(b).unwrap();
        assert_eq!(class_b.id, class_a.id + 1);
        assert_eq!(class_b.super_class, Some(ObjectRef::Heap(a)));
        assert_eq!(class_b.instance_fields, 2);
    }
}
