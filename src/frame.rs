//! Shadow stack frames: the jitted-code structure rooting reference-typed
//! locals and temporaries for the collector and carrying the unwind chain
//! for exceptions.
//!
//! Layout is fixed and dereferenced by native code: `prev`, `method`,
//! `object_count`, then the object slots. A method links its frame on entry
//! and reasserts the link after every call; returning does *not* unlink —
//! the caller still holds the returned reference on its own frame and is
//! responsible, which closes the window where a returned object is rooted
//! nowhere.

use std::cell::UnsafeCell;
use std::ptr::null_mut;

use crate::object::Object;
use crate::scheduler::{Scheduler, Thread};
use crate::types::MethodInfo;
use crate::Runtime;

#[repr(C)]
pub struct Frame {
    pub prev: *mut Frame,
    pub method: *mut MethodInfo,
    pub object_count: u64,
    objects: [*mut Object; 0],
}

const _: () = assert!(std::mem::size_of::<Frame>() == 24);

impl Frame {
    /// Address of object slot `index`.
    ///
    /// # Safety
    /// `frame` must point at a frame with at least `index + 1` slots.
    #[inline]
    pub unsafe fn object_slot(frame: *mut Frame, index: usize) -> *mut *mut Object {
        debug_assert!(index < (*frame).object_count as usize);
        (frame as *mut u8)
            .add(std::mem::size_of::<Frame>())
            .cast::<*mut Object>()
            .add(index)
    }

    /// # Safety
    /// As [`Frame::object_slot`].
    #[inline]
    pub unsafe fn get_object(frame: *mut Frame, index: usize) -> *mut Object {
        *Self::object_slot(frame, index)
    }

    /// # Safety
    /// As [`Frame::object_slot`]; the caller must route reference stores to
    /// *heap* objects through the write barrier — frame slots are roots, not
    /// heap fields, so a plain store is correct here.
    #[inline]
    pub unsafe fn set_object(frame: *mut Frame, index: usize, value: *mut Object) {
        *Self::object_slot(frame, index) = value;
    }
}

/// Owned storage for one frame. Jitted code would carve this out of the
/// native stack; hosted callers hold a `FrameBuffer` for the same effect.
pub struct FrameBuffer {
    raw: Box<[UnsafeCell<usize>]>,
}

impl FrameBuffer {
    pub fn new(method: *mut MethodInfo, object_count: usize) -> FrameBuffer {
        let words = std::mem::size_of::<Frame>() / 8 + object_count;
        let raw: Box<[UnsafeCell<usize>]> =
            (0..words).map(|_| UnsafeCell::new(0)).collect();
        let buffer = FrameBuffer { raw };
        let frame = buffer.frame();
        unsafe {
            (*frame).prev = null_mut();
            (*frame).method = method;
            (*frame).object_count = object_count as u64;
        }
        buffer
    }

    pub fn frame(&self) -> *mut Frame {
        self.raw.as_ptr() as *mut Frame
    }

    /// Method-entry linking: zero every object slot and push this frame on
    /// top of the thread's chain.
    pub fn push(&self, thread: &Thread) {
        let frame = self.frame();
        unsafe {
            for i in 0..(*frame).object_count as usize {
                *Frame::object_slot(frame, i) = null_mut();
            }
            (*frame).prev = thread.top_frame();
        }
        thread.set_top_frame(frame);
    }
}

/// Where control resumes after a throw: the surviving frame and the handler
/// offset inside its method.
#[derive(Copy, Clone, Debug)]
pub struct Unwind {
    pub frame: *mut Frame,
    pub handler: u32,
    pub exception: *mut Object,
}

impl Runtime {
    /// Reassert the frame link, as emitted after every call.
    pub fn set_top_frame(&self, frame: *mut Frame) {
        Scheduler::current().set_top_frame(frame);
    }

    /// The JIT `throw` internal: walk the shadow-stack chain against each
    /// method's clause table, unlink the frames above the handler and hand
    /// back where to resume. An exception no frame catches terminates the
    /// core.
    pub fn throw(&self, exception: *mut Object) -> Unwind {
        let thread = Scheduler::current();
        let thrown = unsafe { (*exception).ty() };
        let offset = thread.il_offset();

        let mut frame = thread.top_frame();
        while !frame.is_null() {
            unsafe {
                let method = (*frame).method;
                if !method.is_null() {
                    if let Some(clause) = (*method).find_handler(offset, thrown) {
                        thread.set_top_frame(frame);
                        return Unwind {
                            frame,
                            handler: clause.handler,
                            exception,
                        };
                    }
                }
                frame = (*frame).prev;
            }
        }

        panic!(
            "unhandled managed exception of type {}",
            unsafe { &(*thrown).name }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_field_offsets_are_fixed() {
        let buffer = FrameBuffer::new(null_mut(), 2);
        let frame = buffer.frame();
        let base = frame as usize;
        unsafe {
            assert_eq!(std::ptr::addr_of!((*frame).prev) as usize - base, 0);
            assert_eq!(std::ptr::addr_of!((*frame).method) as usize - base, 8);
            assert_eq!(std::ptr::addr_of!((*frame).object_count) as usize - base, 16);
            assert_eq!(Frame::object_slot(frame, 0) as usize - base, 24);
            assert_eq!(Frame::object_slot(frame, 1) as usize - base, 32);
        }
    }

    #[test]
    fn push_zeroes_slots_and_links() {
        let buffer = FrameBuffer::new(null_mut(), 1);
        unsafe {
            *Frame::object_slot(buffer.frame(), 0) = 0xdead as *mut Object;
        }
        // A fresh scheduler thread never ran, so its chain is empty.
        let sched = Scheduler::new(1);
        let t = sched.make_thread("t", 1);
        buffer.push(&t);
        unsafe {
            assert!(Frame::get_object(buffer.frame(), 0).is_null());
            assert!((*buffer.frame()).prev.is_null());
        }
        assert_eq!(t.top_frame(), buffer.frame());

        let inner = FrameBuffer::new(null_mut(), 1);
        inner.push(&t);
        assert_eq!(t.top_frame(), inner.frame());
        unsafe {
            assert_eq!((*inner.frame()).prev, buffer.frame());
        }
    }
}
