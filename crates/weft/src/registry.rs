//! Process-wide registry of detached coroutines.
//!
//! A detached coroutine belongs to no thread; this map is its only anchor
//! between `detach` on one scheduler and `attach` on another. The mutex is
//! the single cross-thread memory-ordering point in the whole system: every
//! write the detaching thread made to the record happens-before the attaching
//! thread's first read, because both go through this lock.

use std::sync::OnceLock;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::coro::Coro;

/// A record published for migration. The pointer targets a record embedded in
/// its own (caller-owned) stack.
struct DetachedCoro(*mut Coro);

// SAFETY: while a record sits in the registry no thread can reach it through
// any scheduler queue, so handing the pointer to another thread transfers
// exclusive access.
unsafe impl Send for DetachedCoro {}

static DETACHED: OnceLock<Mutex<FxHashMap<i64, DetachedCoro>>> = OnceLock::new();

fn registry() -> &'static Mutex<FxHashMap<i64, DetachedCoro>> {
    DETACHED.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Publish a detached record under its id.
pub(crate) fn insert(id: i64, co: *mut Coro) {
    registry().lock().insert(id, DetachedCoro(co));
}

/// Privatize a detached record, removing it from the registry.
pub(crate) fn remove(id: i64) -> Option<*mut Coro> {
    registry().lock().remove(&id).map(|d| d.0)
}

/// Number of coroutines currently detached, process-wide.
pub(crate) fn len() -> usize {
    registry().lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::{next_id, CoroDesc};
    use std::ptr;

    fn noop_entry(_: *mut ()) {}

    fn make() -> (i64, *mut Coro) {
        let id = next_id();
        let desc = CoroDesc {
            stack: ptr::null_mut(),
            stack_size: 0,
            entry: noop_entry,
            cleanup: None,
            udata: ptr::null_mut(),
        };
        (id, Box::into_raw(Box::new(Coro::new(id, &desc))))
    }

    #[test]
    fn test_insert_remove() {
        let before = len();
        let (id, co) = make();
        insert(id, co);
        assert_eq!(len(), before + 1);
        let got = remove(id).expect("present");
        assert_eq!(got, co);
        assert!(remove(id).is_none());
        drop(unsafe { Box::from_raw(co) });
    }

    #[test]
    fn test_remove_unknown_id() {
        assert!(remove(-12345).is_none());
    }
}
