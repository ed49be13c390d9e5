//! Manipulation of multiple execution stacks on one thread.
//!
//! Each handler frame runs on its own mmap'd, guard-paged stack. Switching
//! between stacks uses the ucontext family; capturing a suspended stack is a
//! byte copy of the live region above its saved stack pointer, and restoring
//! one copies those bytes (and the saved machine context) back in place.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;

use crate::error::EffectError;

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("stackeff requires x86_64 Linux (ucontext-based stack switching)");

/// Usable size of an allocated execution stack, before page rounding.
pub(crate) const STACK_SIZE: usize = 1024 * 1024;

fn page_size() -> usize {
    // sysconf never fails for _SC_PAGESIZE on Linux.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// One execution stack and the machine context last saved for it.
///
/// While the stack is actually running, the stored context is stale; it is
/// refreshed by every switch away from it. The root stack of a thread is
/// represented by a `Stack` with no allocated memory: it can be switched
/// to and from, but never snapshotted, and `contains` is always false for it.
pub(crate) struct Stack {
    context: UnsafeCell<libc::ucontext_t>,
    base: *mut u8,
    size: usize,
}

impl Stack {
    /// Mirror the thread's current stack. Used for the implicit root frame.
    pub(crate) fn current() -> Stack {
        Stack {
            context: UnsafeCell::new(unsafe { mem::zeroed() }),
            base: ptr::null_mut(),
            size: 0,
        }
    }

    /// Allocate a fresh stack with a guard page below its lowest address.
    pub(crate) fn allocate() -> Result<Stack, EffectError> {
        let page = page_size();
        let size = (STACK_SIZE + page - 1) / page * page;
        let total = size + page; // guard page

        let memory = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if memory == libc::MAP_FAILED {
            return Err(EffectError::stack_allocation(total));
        }
        unsafe {
            libc::mprotect(memory, page, libc::PROT_NONE);
        }

        let base = unsafe { (memory as *mut u8).add(page) };
        Ok(Stack {
            context: UnsafeCell::new(unsafe { mem::zeroed() }),
            base,
            size,
        })
    }

    /// Whether `addr` falls inside this stack's allocated byte range.
    pub(crate) fn contains(&self, addr: usize) -> bool {
        if self.base.is_null() {
            return false;
        }
        let low = self.base as usize;
        addr >= low && addr < low + self.size
    }

    /// Highest address of the allocated region (stacks grow downwards).
    pub(crate) fn high(&self) -> usize {
        self.base as usize + self.size
    }

    /// Start running `entry` from the bottom of this stack, saving the
    /// caller's machine state into `prev` so a later switch can return there.
    ///
    /// # Safety
    /// The caller must currently be executing on `prev`'s stack, and `entry`
    /// must never return (it hands control back with an explicit switch).
    pub(crate) unsafe fn start(&self, prev: &Stack, entry: extern "C" fn()) {
        let ctx = self.context.get();
        libc::getcontext(ctx);
        (*ctx).uc_stack.ss_sp = self.base as *mut libc::c_void;
        (*ctx).uc_stack.ss_size = self.size;
        (*ctx).uc_stack.ss_flags = 0;
        (*ctx).uc_link = prev.context.get();
        libc::makecontext(ctx, entry, 0);
        libc::swapcontext(prev.context.get(), ctx);
    }

    /// Two-way switch: save the caller into `prev`, then continue this stack
    /// from wherever it last suspended.
    ///
    /// # Safety
    /// The caller must currently be executing on `prev`'s stack, and this
    /// stack's saved context must be a valid suspension point.
    pub(crate) unsafe fn switch_from(&self, prev: &Stack) {
        libc::swapcontext(prev.context.get(), self.context.get());
    }

    /// One-way switch into this stack's saved context. The current machine
    /// state is abandoned, not saved anywhere.
    ///
    /// # Safety
    /// As for `switch_from`; additionally nothing on the abandoned stack may
    /// be relied on afterwards.
    pub(crate) unsafe fn enter(&self) -> ! {
        libc::setcontext(self.context.get());
        unreachable!("setcontext returned");
    }

    /// Stack pointer recorded in the saved context.
    ///
    /// # Safety
    /// Only meaningful while the stack is suspended with a saved context.
    pub(crate) unsafe fn saved_sp(&self) -> usize {
        (*self.context.get()).uc_mcontext.gregs[libc::REG_RSP as usize] as usize
    }

    /// Byte-for-byte copy of the live region above the saved stack pointer.
    ///
    /// # Safety
    /// The stack must be an allocated one, suspended with a saved context.
    pub(crate) unsafe fn snapshot_bytes(&self) -> Vec<u8> {
        let sp = self.saved_sp();
        let len = self.high() - sp;
        let mut bytes = vec![0u8; len];
        ptr::copy_nonoverlapping(sp as *const u8, bytes.as_mut_ptr(), len);
        bytes
    }

    /// Copy of the saved machine context.
    ///
    /// # Safety
    /// The stack must be suspended with a saved context.
    pub(crate) unsafe fn snapshot_context(&self) -> libc::ucontext_t {
        ptr::read(self.context.get())
    }

    /// Copy snapshotted bytes and context back into place, so that switching
    /// into this stack resumes the snapshotted suspension point.
    ///
    /// # Safety
    /// `bytes`/`context` must come from a snapshot of this same stack, and
    /// the stack must not be currently executing.
    pub(crate) unsafe fn restore(&self, bytes: &[u8], context: &libc::ucontext_t) {
        ptr::copy_nonoverlapping(context, self.context.get(), 1);
        let dest = (self.high() - bytes.len()) as *mut u8;
        ptr::copy_nonoverlapping(bytes.as_ptr(), dest, bytes.len());
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if !self.base.is_null() {
            let page = page_size();
            unsafe {
                libc::munmap(
                    self.base.sub(page) as *mut libc::c_void,
                    self.size + page,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_contains() {
        let stack = Stack::allocate().unwrap();
        let low = stack.base as usize;
        assert!(stack.contains(low));
        assert!(stack.contains(low + stack.size - 1));
        assert!(!stack.contains(low + stack.size));
        assert!(!stack.contains(low - 1));
        assert_eq!(stack.high(), low + stack.size);
    }

    #[test]
    fn test_current_contains_nothing() {
        let stack = Stack::current();
        let local = 0u8;
        assert!(!stack.contains(&local as *const u8 as usize));
        assert!(!stack.contains(0));
    }

    #[test]
    fn test_allocated_size_is_page_rounded() {
        let stack = Stack::allocate().unwrap();
        assert!(stack.size >= STACK_SIZE);
        assert_eq!(stack.size % page_size(), 0);
    }
}
