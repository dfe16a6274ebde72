use std::collections::HashMap;
use std::io;
use std::ptr;

use bitflags::bitflags;
use slab::Slab;

use crate::callable::Callable;

bitflags! {
    /// Poll readiness interest and result masks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Readiness: u32 {
        const IN = libc::POLLIN as u32;
        const OUT = libc::POLLOUT as u32;
    }
}

/// One reaped completion queue event, as handed to a continuation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CqeEvent {
    pub(crate) res: i32,
    #[allow(dead_code)]
    pub(crate) flags: u32,
}

pub(crate) type Continuation = Callable<CqeEvent>;

/// Handle to the set of in-flight operations one I/O object owns.
///
/// Object identity is a monotonically increasing id rather than a pool
/// index so a late completion can never link itself to a recycled
/// object. Dropping the owning facade destroys the handle; Rust move
/// semantics cover handle transfer between facade instances.
#[derive(Debug)]
pub(crate) struct IoHandle {
    id: u64,
}

impl IoHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

struct Record {
    /// Owning object id, cleared when the object is destroyed first.
    object: Option<u64>,
    /// The installed continuation. `None` once shutdown stripped it.
    handler: Option<Continuation>,
    /// Scatter-gather storage rented from the cache for vectored ops.
    /// The kernel reads this vector's heap buffer, which stays put for
    /// the lifetime of the record.
    iovecs: Vec<libc::iovec>,
}

/// Outcome of routing a completion event to its record.
pub(crate) enum Completed {
    /// No record carries this cookie.
    Unknown,
    /// The record was recycled but its continuation was already
    /// destroyed by shutdown; there is nothing to run.
    Stripped,
    /// The record was recycled; run this continuation.
    Run(Continuation),
}

/// Pools completion records and per-object ownership lists.
///
/// Records live in a slab: the slab's vacancy list is the free list and
/// its occupied entries are the in-use set, with the slab key doubling
/// as the submission's `user_data` cookie. Growth is lazy and unbounded.
///
/// Counter updates (the proactor's work accounting) are intentionally
/// not performed here; callers apply them from the returned effects so
/// the pool stays independently testable.
pub(crate) struct Service {
    records: Slab<Record>,
    objects: HashMap<u64, Vec<u64>>,
    next_object: u64,
    iovec_cache: Vec<Vec<libc::iovec>>,
    shut_down: bool,
}

// `iovec` carries raw pointers, which only the kernel dereferences; the
// initiating call's safety contract keeps them valid while a record is
// in flight. Cached vectors are cleared and hold no pointers at all.
unsafe impl Send for Service {}

impl Service {
    pub(crate) fn new() -> Self {
        Service {
            records: Slab::new(),
            objects: HashMap::new(),
            next_object: 0,
            iovec_cache: Vec::new(),
            shut_down: false,
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Initializes a fresh per-object ownership list.
    pub(crate) fn construct(&mut self) -> IoHandle {
        let id = self.next_object;
        self.next_object += 1;
        self.objects.insert(id, Vec::new());
        IoHandle { id }
    }

    /// Tears down an ownership list. Outstanding operations initiated
    /// through the handle stay in flight, complete normally and recycle
    /// their records; only the object link is severed.
    pub(crate) fn destroy(&mut self, handle: IoHandle) {
        if let Some(keys) = self.objects.remove(&handle.id) {
            for key in keys {
                if let Some(rec) = self.records.get_mut(key as usize) {
                    rec.object = None;
                }
            }
        }
    }

    /// The `user_data` cookies of every operation the handle owns, for
    /// use as poll-remove targets.
    pub(crate) fn user_data(&self, handle: &IoHandle) -> Vec<u64> {
        self.objects.get(&handle.id).cloned().unwrap_or_default()
    }

    /// Destroys every stored continuation without invoking it, so that
    /// pending kernel operations complete into stripped records. Returns
    /// how many continuations were destroyed so the caller can release
    /// their work accounting. A second shutdown finds nothing to do.
    pub(crate) fn shutdown(&mut self) -> usize {
        self.shut_down = true;
        let mut destroyed = 0;
        for (_, rec) in self.records.iter_mut() {
            if rec.handler.take().is_some() {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Acquires a record for a new operation: links it into the in-use
    /// set and the owning object's list and installs the continuation.
    /// Returns the record's cookie. The caller owns the matching work
    /// counter increment.
    pub(crate) fn stage(&mut self, object: u64, iov_count: usize, handler: Continuation) -> u64 {
        let iovecs = if iov_count > 0 {
            self.acquire_iovecs(iov_count)
        } else {
            Vec::new()
        };
        let entry = self.records.vacant_entry();
        let key = entry.key() as u64;
        entry.insert(Record {
            object: Some(object),
            handler: Some(handler),
            iovecs,
        });
        // A rearm issued after the facade went away stays unlinked.
        if let Some(list) = self.objects.get_mut(&object) {
            list.push(key);
        } else {
            self.records[key as usize].object = None;
        }
        key
    }

    /// Rolls back a staged record whose submission failed, dropping the
    /// continuation and returning the rented vector to the cache. The
    /// caller owns the matching work counter decrement.
    pub(crate) fn unstage(&mut self, key: u64) {
        match self.complete(key) {
            Completed::Run(handler) => drop(handler),
            Completed::Stripped => {}
            Completed::Unknown => debug_assert!(false, "unstage of unknown cookie {key}"),
        }
    }

    /// Mutable access to a staged record's rented scatter-gather vector,
    /// already sized for the operation.
    pub(crate) fn iovecs_mut(&mut self, key: u64) -> &mut Vec<libc::iovec> {
        &mut self.records[key as usize].iovecs
    }

    /// Routes a completion event: unlinks the record from the in-use set
    /// and its object's list, returns the scatter-gather vector to the
    /// cache and recycles the record, handing back the continuation.
    /// By the time the continuation runs the record is already free.
    pub(crate) fn complete(&mut self, key: u64) -> Completed {
        let Some(rec) = self.records.try_remove(key as usize) else {
            return Completed::Unknown;
        };
        if let Some(object) = rec.object {
            if let Some(list) = self.objects.get_mut(&object) {
                if let Some(pos) = list.iter().position(|&k| k == key) {
                    list.swap_remove(pos);
                }
            }
        }
        self.release_iovecs(rec.iovecs);
        match rec.handler {
            Some(handler) => Completed::Run(handler),
            None => Completed::Stripped,
        }
    }

    fn acquire_iovecs(&mut self, count: usize) -> Vec<libc::iovec> {
        let mut v = self.iovec_cache.pop().unwrap_or_default();
        v.resize(
            count,
            libc::iovec {
                iov_base: ptr::null_mut(),
                iov_len: 0,
            },
        );
        v
    }

    fn release_iovecs(&mut self, mut v: Vec<libc::iovec>) {
        if v.capacity() == 0 {
            return;
        }
        v.clear();
        self.iovec_cache.push(v);
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    fn cached_vectors(&self) -> usize {
        self.iovec_cache.len()
    }
}

/// Maps a read/write completion result: negative values are errnos,
/// everything else is bytes transferred.
pub(crate) fn rw_result(res: i32) -> io::Result<usize> {
    if res < 0 {
        Err(io::Error::from_raw_os_error(-res))
    } else {
        Ok(res as usize)
    }
}

/// Maps a poll-add completion result. A positive value is the readiness
/// mask. Zero is the canonical cancellation indicator for this subsystem
/// (a matched poll-remove) and never means "ready with no events".
pub(crate) fn poll_add_result(res: i32) -> io::Result<Readiness> {
    if res > 0 {
        Ok(Readiness::from_bits_truncate(res as u32))
    } else if res < 0 {
        Err(io::Error::from_raw_os_error(-res))
    } else {
        Err(operation_aborted())
    }
}

pub(crate) fn poll_remove_result(res: i32) -> io::Result<()> {
    if res >= 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(-res))
    }
}

pub(crate) fn fsync_result(res: i32) -> io::Result<()> {
    poll_remove_result(res)
}

/// The synthesized cancellation error.
pub(crate) fn operation_aborted() -> io::Error {
    io::Error::from_raw_os_error(libc::ECANCELED)
}
