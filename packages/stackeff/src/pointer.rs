//! Reference-counted handles that stay correct across stack copies.
//!
//! A `Tracked<T>` is a shared-ownership handle whose count lives on the heap
//! while handle instances typically live in stack memory. Plain `Rc`-style
//! counting breaks the moment a stack holding a handle is byte-copied and
//! replayed: the copy silently duplicates (or, once the first replay has run
//! its destructors, dangles) the reference. Handles therefore register
//! themselves with the handler frame whose stack region contains them, and
//! continuation capture turns that registry into a `PointerSnapshot` that
//! adjusts the counts once per restoration.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::frame;

/// Heap header shared by every handle to one allocation.
///
/// `drop_fn` erases the payload type so snapshots can release allocations
/// without knowing `T`.
#[repr(C)]
pub(crate) struct CountHeader {
    refs: Cell<usize>,
    drop_fn: unsafe fn(*mut CountHeader),
}

#[repr(C)]
struct SharedAlloc<T> {
    header: CountHeader,
    data: T,
}

unsafe fn drop_alloc<T>(header: *mut CountHeader) {
    drop(Box::from_raw(header as *mut SharedAlloc<T>));
}

impl CountHeader {
    pub(crate) fn refs(&self) -> usize {
        self.refs.get()
    }

    /// # Safety
    /// `header` must point to a live `SharedAlloc` header.
    pub(crate) unsafe fn incref(header: NonNull<CountHeader>) {
        let refs = &header.as_ref().refs;
        refs.set(refs.get() + 1);
    }

    /// Decrement, freeing the allocation when the count reaches zero.
    ///
    /// # Safety
    /// `header` must point to a live `SharedAlloc` header, and the caller
    /// must own one of its counted references.
    pub(crate) unsafe fn decref(header: NonNull<CountHeader>) {
        let refs = &header.as_ref().refs;
        let remaining = refs.get() - 1;
        refs.set(remaining);
        if remaining == 0 {
            let drop_fn = header.as_ref().drop_fn;
            drop_fn(header.as_ptr());
        }
    }
}

/// One registered handle instance: where it lives, and which count it shares.
#[derive(Clone, Copy)]
pub(crate) struct TrackedEntry {
    pub(crate) addr: usize,
    pub(crate) header: NonNull<CountHeader>,
}

/// A reference-counted handle that participates in the capture/resume
/// protocol.
///
/// State created inside a handled body that must survive suspension across an
/// effect boundary has to be owned through `Tracked`; ordinary owned values
/// on the stack would be dropped once per replay. A handle is registered with
/// the frame whose stack contains it at construction time; one that later
/// moves off that stack clears its registration at drop so no capture adopts
/// a reference the drop already released.
pub struct Tracked<T: 'static> {
    alloc: NonNull<SharedAlloc<T>>,
    /// Whether construction found a handler stack containing this instance.
    /// Handles on the root stack or the heap are not tracked.
    registered: Cell<bool>,
    _marker: PhantomData<SharedAlloc<T>>,
}

impl<T: 'static> Tracked<T> {
    /// Allocate `value` on the heap behind a fresh count of one.
    pub fn new(value: T) -> Self {
        let alloc = Box::into_raw(Box::new(SharedAlloc {
            header: CountHeader {
                refs: Cell::new(1),
                drop_fn: drop_alloc::<T>,
            },
            data: value,
        }));
        // Box::into_raw is never null.
        let handle = Tracked {
            alloc: unsafe { NonNull::new_unchecked(alloc) },
            registered: Cell::new(false),
            _marker: PhantomData,
        };
        handle
            .registered
            .set(frame::register_handle(handle.instance_addr(), handle.header()));
        handle
    }

    /// Shared access to the referenced value.
    pub fn get(&self) -> &T {
        unsafe { &self.alloc.as_ref().data }
    }

    fn instance_addr(&self) -> usize {
        self as *const Tracked<T> as usize
    }

    fn header(&self) -> NonNull<CountHeader> {
        self.alloc.cast::<CountHeader>()
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> usize {
        unsafe { self.alloc.as_ref() }.header.refs()
    }
}

impl<T: 'static> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T: 'static> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        unsafe { CountHeader::incref(self.header()) };
        let handle = Tracked {
            alloc: self.alloc,
            registered: Cell::new(false),
            _marker: PhantomData,
        };
        handle
            .registered
            .set(frame::register_handle(handle.instance_addr(), handle.header()));
        handle
    }
}

impl<T: 'static> Drop for Tracked<T> {
    fn drop(&mut self) {
        if self.registered.get() {
            frame::unregister_handle(self.instance_addr(), self.header());
        }
        unsafe { CountHeader::decref(self.header()) };
    }
}

impl<T: std::fmt::Debug + 'static> std::fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Tracked").field(self.get()).finish()
    }
}

/// Frozen reference state of one frame's registered handles, taken at
/// capture time.
///
/// Adopting the registry transfers the suspended stack's ownership of each
/// count to the snapshot: nothing changes at capture, every restoration adds
/// one reference per entry for the fresh replay, and dropping the snapshot
/// releases the adopted references — so a continuation that is never resumed
/// still frees everything exactly once.
pub(crate) struct PointerSnapshot {
    entries: Vec<SnapshotEntry>,
}

struct SnapshotEntry {
    addr: usize,
    header: NonNull<CountHeader>,
    refs_at_capture: usize,
}

impl PointerSnapshot {
    pub(crate) fn adopt(entries: Vec<TrackedEntry>) -> PointerSnapshot {
        let entries = entries
            .into_iter()
            .map(|e| SnapshotEntry {
                addr: e.addr,
                header: e.header,
                refs_at_capture: unsafe { e.header.as_ref() }.refs(),
            })
            .collect();
        PointerSnapshot { entries }
    }

    /// Re-register every snapshotted handle and count the fresh replay as an
    /// independent owner of each.
    pub(crate) fn restore_entries(&self) -> Vec<TrackedEntry> {
        self.entries
            .iter()
            .map(|e| {
                unsafe { CountHeader::incref(e.header) };
                crate::eff_debug_log!(
                    "restoring tracked handle at {:#x} (captured refs {})",
                    e.addr,
                    e.refs_at_capture
                );
                TrackedEntry {
                    addr: e.addr,
                    header: e.header,
                }
            })
            .collect()
    }
}

impl Drop for PointerSnapshot {
    fn drop(&mut self) {
        for e in &self.entries {
            unsafe { CountHeader::decref(e.header) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    struct DropCounter {
        drops: Rc<Cell<usize>>,
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    #[test]
    fn test_new_and_deref() {
        let handle = Tracked::new(41);
        assert_eq!(*handle + 1, 42);
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn test_clone_shares_count() {
        let drops = Rc::new(Cell::new(0));
        let a = Tracked::new(DropCounter {
            drops: drops.clone(),
        });
        let b = a.clone();
        assert_eq!(a.ref_count(), 2);
        drop(a);
        assert_eq!(b.ref_count(), 1);
        assert_eq!(drops.get(), 0);
        drop(b);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_snapshot_adoption_releases_once() {
        let drops = Rc::new(Cell::new(0));
        let handle = Tracked::new(DropCounter {
            drops: drops.clone(),
        });
        // Simulate a capture: the snapshot adopts the instance's reference.
        let entry = TrackedEntry {
            addr: 0,
            header: handle.header(),
        };
        let snapshot = PointerSnapshot::adopt(vec![entry]);
        assert_eq!(snapshot.entries.len(), 1);
        // The abandoned instance never runs its destructor.
        std::mem::forget(handle);
        assert_eq!(drops.get(), 0);
        drop(snapshot);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_snapshot_restore_adds_one_owner_per_entry() {
        let drops = Rc::new(Cell::new(0));
        let handle = Tracked::new(DropCounter {
            drops: drops.clone(),
        });
        let header = handle.header();
        let snapshot = PointerSnapshot::adopt(vec![TrackedEntry { addr: 0, header }]);
        std::mem::forget(handle);

        let restored = snapshot.restore_entries();
        assert_eq!(restored.len(), 1);
        assert_eq!(unsafe { header.as_ref() }.refs(), 2);

        // The replay's destructor balances the restore increment.
        unsafe { CountHeader::decref(header) };
        assert_eq!(drops.get(), 0);
        drop(snapshot);
        assert_eq!(drops.get(), 1);
    }
}
