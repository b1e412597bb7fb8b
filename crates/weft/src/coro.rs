//! Coroutine records, descriptors, and identity.
//!
//! A [`Coro`] record is not heap-allocated: the entry trampoline builds it as
//! a local on the coroutine's own stack, so it lives exactly as long as the
//! coroutine and the scheduler's queues cost nothing to maintain. Everything
//! that refers to a record does so by raw pointer.

use std::ptr;
use std::sync::atomic::{AtomicI64, Ordering};

use weft_ctx::Context;

/// Coroutine entry function. Receives the descriptor's user data.
pub type EntryFn = fn(udata: *mut ());

/// Cleanup function, called exactly once after the coroutine has finished,
/// with the stack bounds and user data from the descriptor. It always runs on
/// some other context's stack, never on the one it is releasing, and must not
/// call back into the scheduler.
pub type CleanupFn = fn(stack: *mut u8, stack_size: usize, udata: *mut ());

/// Description of a coroutine to start.
///
/// The stack is caller-owned for the coroutine's whole lifetime; the
/// scheduler never frees or reallocates it. All fields are copied into the
/// new coroutine record.
#[derive(Clone, Copy)]
pub struct CoroDesc {
    /// Low end of the stack memory.
    pub stack: *mut u8,
    /// Stack size in bytes, at least [`weft_ctx::MIN_STACK_SIZE`].
    pub stack_size: usize,
    /// Entry function, invoked exactly once.
    pub entry: EntryFn,
    /// Cleanup function, or `None` if the caller reclaims the stack by other
    /// means.
    pub cleanup: Option<CleanupFn>,
    /// Opaque user data passed through to `entry` and `cleanup`.
    pub udata: *mut (),
}

/// Lifecycle state of a coroutine.
///
/// `Scheduled` is the run queue; `Ready` is the dispatch batch the scheduler
/// is currently draining (both are "scheduled" in the public counters'
/// sense). Terminated records are destroyed and never observable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CoroState {
    /// In the run queue, waiting for the next dispatch batch.
    Scheduled,
    /// In the current dispatch batch.
    Ready,
    /// Executing on this thread right now.
    Running,
    /// In the pause set; runs again only after `resume(id)`.
    Paused,
    /// In the process-wide detached registry, owned by no thread.
    Detached,
}

/// A live coroutine. Lives inside its own stack; moved between lists by
/// pointer, never by value.
pub(crate) struct Coro {
    pub(crate) id: i64,
    pub(crate) stack: *mut u8,
    pub(crate) stack_size: usize,
    pub(crate) udata: *mut (),
    pub(crate) cleanup: Option<CleanupFn>,
    /// Saved registers while suspended.
    pub(crate) ctx: Context,
    /// Intrusive links; null while not in any list.
    pub(crate) prev: *mut Coro,
    pub(crate) next: *mut Coro,
    pub(crate) state: CoroState,
    /// Owning scheduler instance, 0 while detached.
    pub(crate) owner: u64,
}

impl Coro {
    pub(crate) fn new(id: i64, desc: &CoroDesc) -> Coro {
        Coro {
            id,
            stack: desc.stack,
            stack_size: desc.stack_size,
            udata: desc.udata,
            cleanup: desc.cleanup,
            ctx: Context::new(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            state: CoroState::Running,
            owner: 0,
        }
    }
}

static NEXT_CORO_ID: AtomicI64 = AtomicI64::new(1);

/// Allocate a fresh coroutine id. Ids are unique across the process, never
/// zero, and stable for the coroutine's lifetime; 0 is reserved for the
/// runloop sentinel in `resume`.
pub(crate) fn next_id() -> i64 {
    NEXT_CORO_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_entry(_: *mut ()) {}

    #[test]
    fn test_id_uniqueness() {
        let a = next_id();
        let b = next_id();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_record_copies_descriptor() {
        let mut probe = 7u32;
        let desc = CoroDesc {
            stack: 0x1000 as *mut u8,
            stack_size: 64 * 1024,
            entry: noop_entry,
            cleanup: None,
            udata: &mut probe as *mut u32 as *mut (),
        };
        let co = Coro::new(next_id(), &desc);
        assert_eq!(co.stack, desc.stack);
        assert_eq!(co.stack_size, desc.stack_size);
        assert_eq!(co.udata, desc.udata);
        assert!(co.cleanup.is_none());
        assert!(co.prev.is_null());
        assert!(co.next.is_null());
        assert_eq!(co.state, CoroState::Running);
    }
}
