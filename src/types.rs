//! Type and method descriptors, consumed by the heap, the collector and the
//! jitted-code surface. The metadata loader that would normally produce these
//! from CIL images is outside this crate; the corelib builds the well-known
//! ones programmatically.

use std::ptr::null_mut;

use parking_lot::Mutex;

use crate::object::HEADER_SIZE;

pub struct Type {
    pub name: String,
    pub base_type: *mut Type,
    pub element_type: *mut Type,
    pub fields: Vec<FieldInfo>,

    /// Size and alignment on the evaluation stack.
    pub stack_size: usize,
    pub stack_alignment: usize,

    /// Payload size and alignment of an instance, not counting the header.
    pub managed_size: usize,
    pub managed_alignment: usize,

    pub is_value_type: bool,

    /// Sorted byte offsets, from the object start, of every managed
    /// reference stored in an instance. The collector's sole trace map.
    pub managed_pointer_offsets: Vec<usize>,

    /// Lazily built `T[]` descriptor.
    array_type: Mutex<*mut Type>,
}

unsafe impl Send for Type {}
unsafe impl Sync for Type {}

pub struct FieldInfo {
    pub name: String,
    pub field_type: *mut Type,
    pub attributes: u16,
    /// Offset from the object start.
    pub memory_offset: usize,
}

impl Type {
    pub fn new(name: &str, base_type: *mut Type, managed_size: usize) -> Type {
        Type {
            name: name.to_owned(),
            base_type,
            element_type: null_mut(),
            fields: Vec::new(),
            stack_size: 8,
            stack_alignment: 8,
            managed_size,
            managed_alignment: 8,
            is_value_type: false,
            managed_pointer_offsets: Vec::new(),
            array_type: Mutex::new(null_mut()),
        }
    }

    /// Total heap slot request for an instance: header plus payload.
    pub fn allocation_size(&self) -> usize {
        HEADER_SIZE + self.managed_size
    }

    /// The `T[]` descriptor for this type, built on first use under the
    /// per-type mutex.
    pub fn array_type(this: *mut Type) -> *mut Type {
        unsafe {
            let mut slot = (*this).array_type.lock();
            if slot.is_null() {
                let mut array = Type::new(&format!("{}[]", (*this).name), null_mut(), 8);
                array.element_type = this;
                *slot = Box::into_raw(Box::new(array));
            }
            *slot
        }
    }

    /// Walk the base chain: is a value of type `this` assignable to a slot of
    /// type `target`?
    pub fn is_assignable_to(this: *mut Type, target: *mut Type) -> bool {
        let mut cur = this;
        while !cur.is_null() {
            if cur == target {
                return true;
            }
            cur = unsafe { (*cur).base_type };
        }
        false
    }
}

impl Drop for Type {
    fn drop(&mut self) {
        let array = *self.array_type.get_mut();
        if !array.is_null() {
            unsafe { drop(Box::from_raw(array)) };
        }
    }
}

/// One clause of a method's exception handler table. Offsets are bytecode
/// offsets within the compiled body.
pub struct ExceptionClause {
    pub try_start: u32,
    pub try_end: u32,
    pub handler: u32,
    pub catch_type: *mut Type,
}

pub struct MethodInfo {
    pub name: String,
    pub declaring_type: *mut Type,
    pub parameters_count: usize,
    /// Reference-typed locals and temporaries the method roots in its shadow
    /// frame.
    pub object_slots: usize,
    pub clauses: Vec<ExceptionClause>,
}

unsafe impl Send for MethodInfo {}
unsafe impl Sync for MethodInfo {}

impl MethodInfo {
    pub fn new(name: &str, declaring_type: *mut Type, object_slots: usize) -> MethodInfo {
        MethodInfo {
            name: name.to_owned(),
            declaring_type,
            parameters_count: 0,
            object_slots,
            clauses: Vec::new(),
        }
    }

    /// First clause whose try range covers `offset` and whose catch type
    /// accepts `thrown`.
    pub fn find_handler(&self, offset: u32, thrown: *mut Type) -> Option<&ExceptionClause> {
        self.clauses.iter().find(|clause| {
            offset >= clause.try_start
                && offset < clause.try_end
                && (clause.catch_type.is_null() || Type::is_assignable_to(thrown, clause.catch_type))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_type_is_cached() {
        let elem = Box::into_raw(Box::new(Type::new("String", null_mut(), 16)));
        let a = Type::array_type(elem);
        let b = Type::array_type(elem);
        assert_eq!(a, b);
        unsafe {
            assert_eq!((*a).element_type, elem);
            assert_eq!((*a).name, "String[]");
            drop(Box::from_raw(elem));
        }
    }

    #[test]
    fn assignability_walks_bases() {
        let object = Box::into_raw(Box::new(Type::new("Object", null_mut(), 0)));
        let exception = Box::into_raw(Box::new(Type::new("Exception", object, 8)));
        let oom = Box::into_raw(Box::new(Type::new("OutOfMemoryException", exception, 8)));
        assert!(Type::is_assignable_to(oom, exception));
        assert!(Type::is_assignable_to(oom, object));
        assert!(!Type::is_assignable_to(exception, oom));
        unsafe {
            drop(Box::from_raw(oom));
            drop(Box::from_raw(exception));
            drop(Box::from_raw(object));
        }
    }

    #[test]
    fn handler_matches_range_and_type() {
        let object = Box::into_raw(Box::new(Type::new("Object", null_mut(), 0)));
        let exception = Box::into_raw(Box::new(Type::new("Exception", object, 8)));
        let mut method = MethodInfo::new("Main", object, 2);
        method.clauses.push(ExceptionClause {
            try_start: 4,
            try_end: 32,
            handler: 48,
            catch_type: exception,
        });
        assert!(method.find_handler(8, exception).is_some());
        assert!(method.find_handler(40, exception).is_none());
        assert!(method.find_handler(8, object).is_none());
        unsafe {
            drop(Box::from_raw(exception));
            drop(Box::from_raw(object));
        }
    }
}
