//! Runtime-side corelib surface: the well-known type descriptors, string
//! objects, the corelib root the collector seeds its root set with, and the
//! internal-call symbol table jitted code resolves its imports against.

use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::object::{Object, HEADER_SIZE};
use crate::types::{FieldInfo, Type};
use crate::{Error, Runtime};

/// String payload: i32 length at the start of the payload, UTF-16 units
/// right after.
const STRING_LENGTH_OFFSET: usize = HEADER_SIZE;
const STRING_CHARS_OFFSET: usize = HEADER_SIZE + 4;

/// Corelib root fields.
const ROOT_EMPTY_STRING_OFFSET: usize = HEADER_SIZE;
const ROOT_OOM_OFFSET: usize = HEADER_SIZE + 8;

/// Exception: the message string is its only managed field.
const EXCEPTION_MESSAGE_OFFSET: usize = HEADER_SIZE;

/// Signature of an internal call as the jitted code invokes it: raw word
/// arguments, raw word result.
pub type InternalCall = fn(&Arc<Runtime>, &[u64]) -> u64;

pub struct Corelib {
    object_ty: *mut Type,
    value_type_ty: *mut Type,
    string_ty: *mut Type,
    exception_ty: *mut Type,
    oom_ty: *mut Type,
    root_ty: *mut Type,
    root: AtomicPtr<Object>,
    oom_exception: AtomicPtr<Object>,
    internal_calls: FxHashMap<&'static str, InternalCall>,
}

unsafe impl Send for Corelib {}
unsafe impl Sync for Corelib {}

impl Corelib {
    pub fn new() -> Corelib {
        let object_ty = Box::into_raw(Box::new(Type::new("System.Object", null_mut(), 0)));

        let value_type_ty =
            Box::into_raw(Box::new(Type::new("System.ValueType", object_ty, 0)));
        unsafe { (*value_type_ty).is_value_type = true };

        let mut string = Type::new("System.String", object_ty, 8);
        string.fields.push(FieldInfo {
            name: "Length".to_owned(),
            field_type: null_mut(),
            attributes: 0,
            memory_offset: STRING_LENGTH_OFFSET,
        });
        let string_ty = Box::into_raw(Box::new(string));

        let mut exception = Type::new("System.Exception", object_ty, 8);
        exception.managed_pointer_offsets = vec![EXCEPTION_MESSAGE_OFFSET];
        exception.fields.push(FieldInfo {
            name: "Message".to_owned(),
            field_type: string_ty,
            attributes: 0,
            memory_offset: EXCEPTION_MESSAGE_OFFSET,
        });
        let exception_ty = Box::into_raw(Box::new(exception));

        let mut oom = Type::new("System.OutOfMemoryException", exception_ty, 8);
        oom.managed_pointer_offsets = vec![EXCEPTION_MESSAGE_OFFSET];
        let oom_ty = Box::into_raw(Box::new(oom));

        let mut root = Type::new("<corelib-root>", object_ty, 16);
        root.managed_pointer_offsets = vec![ROOT_EMPTY_STRING_OFFSET, ROOT_OOM_OFFSET];
        let root_ty = Box::into_raw(Box::new(root));

        let mut internal_calls: FxHashMap<&'static str, InternalCall> = FxHashMap::default();
        internal_calls.insert("CreateWaitable", ic_create_waitable as InternalCall);
        internal_calls.insert("ReleaseWaitable", ic_release_waitable as InternalCall);
        internal_calls.insert("WaitableSend", ic_waitable_send as InternalCall);
        internal_calls.insert("WaitableWait", ic_waitable_wait as InternalCall);
        internal_calls.insert("WaitableSelect2", ic_waitable_select2 as InternalCall);
        internal_calls.insert("WaitableAfter", ic_waitable_after as InternalCall);

        Corelib {
            object_ty,
            value_type_ty,
            string_ty,
            exception_ty,
            oom_ty,
            root_ty,
            root: AtomicPtr::new(null_mut()),
            oom_exception: AtomicPtr::new(null_mut()),
            internal_calls,
        }
    }

    /// Build the managed pieces: the root object, the empty string and the
    /// preallocated out-of-memory exception. Runs on a managed thread during
    /// runtime bring-up.
    pub(crate) fn init(&self, rt: &Runtime) -> Result<(), Error> {
        let root = rt
            .gc_new(self.root_ty, unsafe { (*self.root_ty).allocation_size() })
            .ok_or(Error::OutOfResources)?;
        let empty = rt.new_string("").ok_or(Error::OutOfResources)?;
        let oom = rt
            .new_exception(self.oom_ty, "out of memory")
            .ok_or(Error::OutOfResources)?;
        unsafe {
            rt.gc_update(root.as_ptr(), ROOT_EMPTY_STRING_OFFSET, empty.as_ptr());
            rt.gc_update(root.as_ptr(), ROOT_OOM_OFFSET, oom.as_ptr());
        }
        self.oom_exception.store(oom.as_ptr(), Ordering::Release);
        self.root.store(root.as_ptr(), Ordering::Release);
        Ok(())
    }

    /// The object every collection cycle seeds its root set with.
    pub fn root(&self) -> Option<NonNull<Object>> {
        NonNull::new(self.root.load(Ordering::Acquire))
    }

    /// Preallocated so it can be thrown when allocation itself fails.
    pub fn oom_exception(&self) -> *mut Object {
        self.oom_exception.load(Ordering::Acquire)
    }

    pub fn object_type(&self) -> *mut Type {
        self.object_ty
    }

    pub fn value_type_type(&self) -> *mut Type {
        self.value_type_ty
    }

    pub fn string_type(&self) -> *mut Type {
        self.string_ty
    }

    pub fn exception_type(&self) -> *mut Type {
        self.exception_ty
    }

    pub fn oom_type(&self) -> *mut Type {
        self.oom_ty
    }

    /// Resolve a native import by name, the way the jitter binds
    /// `[InternalCall]` methods. An unknown name is the not-found error the
    /// jitter surfaces for a bad metadata token.
    pub fn resolve_internal_call(&self, name: &str) -> Result<InternalCall, Error> {
        self.internal_calls.get(name).copied().ok_or(Error::NotFound)
    }
}

impl Default for Corelib {
    fn default() -> Corelib {
        Corelib::new()
    }
}

impl Drop for Corelib {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(self.root_ty));
            drop(Box::from_raw(self.oom_ty));
            drop(Box::from_raw(self.exception_ty));
            drop(Box::from_raw(self.string_ty));
            drop(Box::from_raw(self.value_type_ty));
            drop(Box::from_raw(self.object_ty));
        }
    }
}

fn ic_create_waitable(rt: &Arc<Runtime>, args: &[u64]) -> u64 {
    rt.create_waitable(args[0])
}

fn ic_release_waitable(rt: &Arc<Runtime>, args: &[u64]) -> u64 {
    rt.release_waitable(args[0]);
    0
}

fn ic_waitable_send(rt: &Arc<Runtime>, args: &[u64]) -> u64 {
    rt.waitable_send(args[0], args[1] != 0) as u64
}

fn ic_waitable_wait(rt: &Arc<Runtime>, args: &[u64]) -> u64 {
    rt.waitable_wait(args[0], args[1] != 0) as i64 as u64
}

fn ic_waitable_select2(rt: &Arc<Runtime>, args: &[u64]) -> u64 {
    rt.waitable_select2(args[0], args[1], args[2] != 0) as i64 as u64
}

fn ic_waitable_after(rt: &Arc<Runtime>, args: &[u64]) -> u64 {
    rt.waitable_after(args[0])
}

impl Runtime {
    /// Allocate a managed string. UTF-16 payload, the CLI layout.
    pub fn new_string(&self, value: &str) -> Option<NonNull<Object>> {
        let units: Vec<u16> = value.encode_utf16().collect();
        let size = STRING_CHARS_OFFSET + units.len() * 2;
        let obj = self.gc_new(self.corelib.string_type(), size)?;
        unsafe {
            let base = obj.as_ptr() as *mut u8;
            (base.add(STRING_LENGTH_OFFSET) as *mut i32).write(units.len() as i32);
            let chars = base.add(STRING_CHARS_OFFSET) as *mut u16;
            for (i, unit) in units.iter().enumerate() {
                chars.add(i).write(*unit);
            }
        }
        Some(obj)
    }

    /// Decode a managed string back to UTF-8.
    ///
    /// # Safety
    /// `o` must be a live `System.String` instance.
    pub unsafe fn string_value(&self, o: *mut Object) -> String {
        let base = o as *const u8;
        let len = (base.add(STRING_LENGTH_OFFSET) as *const i32).read() as usize;
        let chars = base.add(STRING_CHARS_OFFSET) as *const u16;
        let units: Vec<u16> = (0..len).map(|i| chars.add(i).read()).collect();
        String::from_utf16_lossy(&units)
    }

    /// Append to a string, producing a fresh copy; the old string is
    /// untouched.
    ///
    /// # Safety
    /// `old` must be a live `System.String` instance.
    pub unsafe fn string_append_str(&self, old: *mut Object, suffix: &str) -> Option<NonNull<Object>> {
        let mut value = self.string_value(old);
        value.push_str(suffix);
        self.new_string(&value)
    }

    /// Allocate an exception object with its message string attached. The
    /// caller roots it before the next collection.
    pub fn new_exception(&self, ty: *mut Type, message: &str) -> Option<NonNull<Object>> {
        let message = self.new_string(message)?;
        let obj = self.gc_new(ty, unsafe { (*ty).allocation_size() })?;
        unsafe {
            self.gc_update(obj.as_ptr(), EXCEPTION_MESSAGE_OFFSET, message.as_ptr());
        }
        Some(obj)
    }

    /// The message string of an exception.
    ///
    /// # Safety
    /// `o` must be a live exception instance.
    pub unsafe fn exception_message(&self, o: *mut Object) -> String {
        let message = crate::object::read_ref_field(o, EXCEPTION_MESSAGE_OFFSET);
        if message.is_null() {
            String::new()
        } else {
            self.string_value(message)
        }
    }
}
