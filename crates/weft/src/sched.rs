//! Per-thread scheduler state and the cooperative scheduling loop.
//!
//! Every OS thread that starts a coroutine gets its own scheduler instance in
//! thread-local storage; instances never touch each other's queues, so none
//! of the per-thread state is locked. Within a thread exactly one coroutine
//! runs at a time and control moves only at the explicit suspension points:
//! `start`, `yield_now`, `pause`, `exit`, and coroutine termination.
//!
//! Dispatch runs in batches. Suspending operations append to the run queue;
//! the scheduler drains a `ready` batch popped one head at a time, and when
//! the batch empties it either splices the whole run queue into a new batch
//! or hands control back to the host. The hand-off happens when the run
//! queue is empty, when `exit` was requested, or when paused coroutines
//! exist and the batch was not started by the host itself. That last rule
//! is what lets a runloop regain control to service paused coroutines while
//! yielding coroutines are still queued.
//!
//! Records live inside caller-owned stacks and all queue membership is by
//! raw pointer, so nearly every helper here has a liveness precondition: a
//! record pointer stays valid until the coroutine terminates, and
//! termination only happens at the bottom of `coro_main` or in `exit`, both
//! of which unlink the record from everything first.

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use weft_ctx::Context;

use crate::coro::{next_id, Coro, CoroDesc, CoroState};
use crate::list::CoList;
use crate::registry;

/// Scheduler counters, as seen from the calling thread.
///
/// `scheduled`, `running`, and `paused` are per-thread; `detached` is the
/// process-wide count of migrating coroutines, read under the registry lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Coroutines waiting in this thread's run queue.
    pub scheduled: usize,
    /// Coroutines in the current dispatch batch, including the one running.
    pub running: usize,
    /// Coroutines in this thread's pause set.
    pub paused: usize,
    /// Detached coroutines, process-wide.
    pub detached: usize,
}

struct CleanupCall {
    stack: *mut u8,
    stack_size: usize,
    udata: *mut (),
    cleanup: Option<crate::coro::CleanupFn>,
}

struct Sched {
    /// Current dispatch batch, drained head-first.
    ready: CoList,
    /// Coroutines scheduled since the batch began.
    run_queue: CoList,
    /// Pause set; membership only, order irrelevant.
    paused: CoList,
    /// The coroutine executing right now, or null in the host context.
    current: *mut Coro,
    /// Saved host context; written on every switch out of the host.
    caller_ctx: Context,
    /// One-shot request to hand control to the host instead of dispatching.
    exit_to_caller: bool,
    /// Terminated coroutine awaiting cleanup in the next context.
    pending_cleanup: Option<CleanupCall>,
    /// Set while a cleanup callback runs; scheduler calls are forbidden then.
    cleanup_active: bool,
    /// Instance id recorded as the owner of this thread's coroutines.
    sched_id: u64,
}

static NEXT_SCHED_ID: AtomicU64 = AtomicU64::new(1);

impl Sched {
    fn new() -> Sched {
        Sched {
            ready: CoList::new(),
            run_queue: CoList::new(),
            paused: CoList::new(),
            current: ptr::null_mut(),
            caller_ctx: Context::new(),
            exit_to_caller: false,
            pending_cleanup: None,
            cleanup_active: false,
            sched_id: NEXT_SCHED_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

thread_local! {
    static SCHED: RefCell<Sched> = RefCell::new(Sched::new());
}

/// Run `f` with the thread's scheduler borrowed. The borrow must never be
/// held across a context switch; callers compute a [`Transfer`] under the
/// borrow and perform it afterwards.
fn with<R>(f: impl FnOnce(&mut Sched) -> R) -> R {
    SCHED.with(|cell| f(&mut cell.borrow_mut()))
}

fn guard(s: &Sched) {
    assert!(
        !s.cleanup_active,
        "scheduler operation invoked from a cleanup callback"
    );
}

/// Outcome of a dispatch decision, computed under the scheduler borrow and
/// executed after it is released.
enum Transfer {
    /// Save into `from`, resume `to`.
    Switch {
        from: *mut Context,
        to: *const Context,
    },
    /// The caller keeps running: it dispatched itself, or the host asked for
    /// work and there is none.
    Stay,
}

/// Pick what runs next and switch bookkeeping to it. `from_host` is true
/// only when the host context itself initiated the dispatch (`start` or a
/// runloop continuation), which disables the paused-coroutine hand-off rule
/// for the first batch conversion.
///
/// # Safety
///
/// All records in the scheduler's lists must be live.
unsafe fn dispatch(s: &mut Sched, from_host: bool, from: *mut Context) -> Transfer {
    if s.ready.is_empty() {
        let hand_off = s.run_queue.is_empty()
            || s.exit_to_caller
            || (!from_host && !s.paused.is_empty());
        if hand_off {
            s.current = ptr::null_mut();
            s.exit_to_caller = false;
            let to = &s.caller_ctx as *const Context;
            if from == to as *mut Context {
                return Transfer::Stay;
            }
            return Transfer::Switch { from, to };
        }
        // Promote the whole run queue to the next batch.
        s.ready.splice(&mut s.run_queue);
        let mut co = s.ready.head();
        while !co.is_null() {
            debug_assert_eq!((*co).state, CoroState::Scheduled);
            (*co).state = CoroState::Ready;
            co = (*co).next;
        }
    }
    let co = s.ready.pop_head();
    debug_assert!(!co.is_null());
    (*co).state = CoroState::Running;
    s.current = co;
    let to = &(*co).ctx as *const Context;
    if from == to as *mut Context {
        return Transfer::Stay;
    }
    Transfer::Switch { from, to }
}

fn perform(t: Transfer) {
    if let Transfer::Switch { from, to } = t {
        // SAFETY: `from` and `to` point into the thread's scheduler or into
        // live coroutine records, both pinned for the duration of the switch.
        unsafe { weft_ctx::switch(from, to) };
        run_pending_cleanup();
    }
}

/// Invoke the cleanup a terminating coroutine left behind. Runs as the first
/// act of whichever context receives control after a final switch, which is
/// how the callback is kept off the stack it releases.
fn run_pending_cleanup() {
    let call = with(|s| s.pending_cleanup.take());
    if let Some(call) = call {
        if let Some(cleanup) = call.cleanup {
            with(|s| s.cleanup_active = true);
            cleanup(call.stack, call.stack_size, call.udata);
            with(|s| s.cleanup_active = false);
        }
    }
}

/// Entry trampoline: the first code to run on a fresh coroutine stack.
extern "C" fn coro_main(arg: *mut ()) {
    run_pending_cleanup();

    // The descriptor lives in the starter's `start` frame, which stays
    // suspended (or blocked, for the host) until we switch back to it.
    let desc = unsafe { *(arg as *const CoroDesc) };
    let mut co = Coro::new(next_id(), &desc);
    let co_ptr = &mut co as *mut Coro;

    let transfer = with(|s| {
        // SAFETY: `co` is pinned on this stack for the coroutine's lifetime.
        unsafe {
            (*co_ptr).owner = s.sched_id;
            if s.current.is_null() {
                // Started from the host: run immediately.
                s.current = co_ptr;
                Transfer::Stay
            } else {
                // Started from a coroutine: queue ourselves, then the
                // starter, and let dispatch pick the queue head.
                let parent = s.current;
                (*co_ptr).state = CoroState::Scheduled;
                s.run_queue.push_tail(co_ptr);
                (*parent).state = CoroState::Scheduled;
                s.run_queue.push_tail(parent);
                s.current = ptr::null_mut();
                dispatch(s, false, &mut (*co_ptr).ctx)
            }
        }
    });
    perform(transfer);

    (desc.entry)(desc.udata);
    finalize(co_ptr);
}

/// Terminate the current coroutine: stash its cleanup for the next context
/// and switch away for good.
fn finalize(co: *mut Coro) -> ! {
    let transfer = with(|s| {
        debug_assert_eq!(s.current, co);
        // SAFETY: `co` is the running coroutine; its record is live and in
        // no list.
        unsafe {
            s.pending_cleanup = Some(CleanupCall {
                stack: (*co).stack,
                stack_size: (*co).stack_size,
                udata: (*co).udata,
                cleanup: (*co).cleanup,
            });
            s.current = ptr::null_mut();
            dispatch(s, false, &mut (*co).ctx)
        }
    });
    match transfer {
        Transfer::Switch { from, to } => {
            // SAFETY: as in `perform`; this switch never comes back.
            unsafe { weft_ctx::switch(from, to) };
        }
        Transfer::Stay => unreachable!("terminating coroutine dispatched itself"),
    }
    unreachable!("terminated coroutine was resumed");
}

/// Start a new coroutine described by `desc`.
///
/// From the host (outside any coroutine) this enters the scheduler: the new
/// coroutine runs immediately and `start` does not return until this
/// thread's scheduler has no runnable coroutines left (every coroutine has
/// finished or paused), or until [`exit`] is called. From inside a coroutine the
/// new coroutine and then the caller are appended to the run queue and the
/// queue head runs next; the caller resumes on a later dispatch.
///
/// # Panics
///
/// Panics if the stack is null or smaller than
/// [`MIN_STACK_SIZE`](weft_ctx::MIN_STACK_SIZE).
///
/// # Safety
///
/// `desc.stack` must point to `desc.stack_size` bytes of writable memory
/// used by nothing else, and the memory must stay valid until the
/// coroutine's cleanup has run. `desc.udata` must remain valid for as long
/// as `entry` and `cleanup` dereference it.
pub unsafe fn start(desc: CoroDesc) {
    start_impl(desc)
}

fn start_impl(desc: CoroDesc) {
    assert!(!desc.stack.is_null(), "coroutine stack is null");
    assert!(
        desc.stack_size >= weft_ctx::MIN_STACK_SIZE,
        "stack size {} below minimum {}",
        desc.stack_size,
        weft_ctx::MIN_STACK_SIZE
    );
    let from = with(|s| {
        guard(s);
        if s.current.is_null() {
            &mut s.caller_ctx as *mut Context
        } else {
            // SAFETY: `current` is the live running coroutine.
            unsafe { &mut (*s.current).ctx as *mut Context }
        }
    });
    let mut child = Context::new();
    // SAFETY: the stack bounds were validated above and `start`'s contract
    // gives the scheduler exclusive use of the memory; the descriptor
    // pointer stays valid because this frame outlives the trampoline's read
    // of it.
    unsafe {
        child.init(
            desc.stack,
            desc.stack_size,
            coro_main,
            &desc as *const CoroDesc as *mut CoroDesc as *mut (),
        );
        weft_ctx::switch(from, &child);
    }
    run_pending_cleanup();
}

/// Relinquish the CPU to the next scheduled coroutine.
///
/// The caller is appended to the run queue and resumes after everything
/// scheduled ahead of it has had a turn. Outside a coroutine this does
/// nothing.
pub fn yield_now() {
    let transfer = with(|s| {
        guard(s);
        if s.current.is_null() {
            return None;
        }
        let me = s.current;
        // SAFETY: `me` is the live running coroutine.
        unsafe {
            (*me).state = CoroState::Scheduled;
            s.run_queue.push_tail(me);
            s.current = ptr::null_mut();
            Some(dispatch(s, false, &mut (*me).ctx))
        }
    });
    if let Some(t) = transfer {
        perform(t);
    }
}

/// Pause the current coroutine.
///
/// A paused coroutine is unreachable from the run queue and runs again only
/// after a [`resume`] with its id on the owning thread. Outside a coroutine
/// this does nothing.
pub fn pause() {
    let transfer = with(|s| {
        guard(s);
        if s.current.is_null() {
            return None;
        }
        let me = s.current;
        // SAFETY: `me` is the live running coroutine.
        unsafe {
            (*me).state = CoroState::Paused;
            s.paused.push_tail(me);
            s.current = ptr::null_mut();
            Some(dispatch(s, false, &mut (*me).ctx))
        }
    });
    if let Some(t) = transfer {
        perform(t);
    }
}

/// Resume a paused coroutine, or continue the runloop.
///
/// `resume(0)` is the runloop continuation: called from the host it
/// dispatches the scheduled coroutines and returns when control next
/// reaches the host: when only paused coroutines remain, when everything
/// has finished, or when [`exit`] is called. With an empty scheduler it
/// returns immediately. `resume(0)` from inside a coroutine does nothing.
///
/// For `id != 0`, if `id` names a coroutine paused on the current thread it
/// moves to the tail of the run queue and runs on a later dispatch; resume
/// itself never context-switches. Any other id (unknown, not paused,
/// paused on a different thread, or detached) is ignored.
pub fn resume(id: i64) {
    let transfer = with(|s| {
        guard(s);
        if id == 0 {
            if !s.current.is_null() {
                return Transfer::Stay;
            }
            let from = &mut s.caller_ctx as *mut Context;
            // SAFETY: list records are live.
            return unsafe { dispatch(s, true, from) };
        }
        // SAFETY: pause-set records are live.
        unsafe {
            let co = s.paused.find(id);
            if co.is_null() {
                #[cfg(debug_assertions)]
                eprintln!("weft: resume({}) ignored: not paused on this thread", id);
                return Transfer::Stay;
            }
            debug_assert_eq!((*co).owner, s.sched_id);
            s.paused.unlink(co);
            (*co).state = CoroState::Scheduled;
            s.run_queue.push_tail(co);
        }
        Transfer::Stay
    });
    perform(transfer);
}

/// End the current coroutine and hand control straight to the runloop.
///
/// Unlike a plain return this skips the coroutines waiting in the run
/// queue: the host's `start` or `resume(0)` returns once the current batch
/// drains, and the host decides whether to continue with `resume(0)`.
/// Cleanup runs as usual. Outside a coroutine this does nothing.
pub fn exit() {
    let co = with(|s| {
        guard(s);
        if s.current.is_null() {
            return ptr::null_mut();
        }
        s.exit_to_caller = true;
        s.current
    });
    if !co.is_null() {
        finalize(co);
    }
}

/// Detach a paused coroutine from this thread, publishing it in the
/// process-wide registry so another thread can [`attach`] it.
///
/// Only a coroutine paused on the current thread can be detached, so a
/// coroutine can never detach itself. Any other id is ignored.
pub fn detach(id: i64) {
    with(|s| {
        guard(s);
        // SAFETY: pause-set records are live.
        unsafe {
            let co = s.paused.find(id);
            if co.is_null() {
                #[cfg(debug_assertions)]
                eprintln!("weft: detach({}) ignored: not paused on this thread", id);
                return;
            }
            s.paused.unlink(co);
            (*co).owner = 0;
            (*co).state = CoroState::Detached;
            registry::insert(id, co);
        }
    });
}

/// Attach a detached coroutine to the current thread.
///
/// The coroutine lands in this thread's pause set and runs only after a
/// subsequent [`resume`] with its id here. Ids that are not detached are
/// ignored.
pub fn attach(id: i64) {
    with(|s| {
        guard(s);
        match registry::remove(id) {
            Some(co) => {
                // SAFETY: the registry hands over exclusive access to a live
                // record.
                unsafe {
                    (*co).owner = s.sched_id;
                    (*co).state = CoroState::Paused;
                    s.paused.push_tail(co);
                }
            }
            None => {
                #[cfg(debug_assertions)]
                eprintln!("weft: attach({}) ignored: not detached", id);
            }
        }
    });
}

/// Id of the current coroutine, or 0 outside any coroutine.
pub fn id() -> i64 {
    with(|s| {
        if s.current.is_null() {
            0
        } else {
            // SAFETY: `current` is the live running coroutine.
            unsafe { (*s.current).id }
        }
    })
}

/// User data of the current coroutine, or null outside any coroutine.
pub fn udata() -> *mut () {
    with(|s| {
        if s.current.is_null() {
            ptr::null_mut()
        } else {
            // SAFETY: `current` is the live running coroutine.
            unsafe { (*s.current).udata }
        }
    })
}

/// True while this thread has any scheduled, running, or paused coroutines.
/// Detached coroutines belong to no thread and are not counted.
pub fn active() -> bool {
    with(|s| {
        !s.current.is_null()
            || !s.ready.is_empty()
            || !s.run_queue.is_empty()
            || !s.paused.is_empty()
    })
}

/// Snapshot of the scheduler counters. See [`Stats`].
pub fn stats() -> Stats {
    let (scheduled, running, paused) = with(|s| {
        (
            s.run_queue.len(),
            s.ready.len() + usize::from(!s.current.is_null()),
            s.paused.len(),
        )
    });
    Stats {
        scheduled,
        running,
        paused,
        detached: registry::len(),
    }
}

/// Name of the context-switching method in use, e.g. `"asm,x86_64"`.
pub fn method() -> &'static str {
    weft_ctx::method()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;
    use weft_ctx::stack::StackMem;

    const STACK_SIZE: usize = 128 * 1024;

    struct Harness {
        cleanups: AtomicUsize,
        hits: Cell<usize>,
        seen_id: Cell<i64>,
    }

    impl Harness {
        fn new() -> Harness {
            Harness {
                cleanups: AtomicUsize::new(0),
                hits: Cell::new(0),
                seen_id: Cell::new(0),
            }
        }
    }

    fn h_cleanup(stack: *mut u8, stack_size: usize, u: *mut ()) {
        drop(unsafe { StackMem::from_raw(stack, stack_size) });
        let h = unsafe { &*(u as *const Harness) };
        h.cleanups.fetch_add(1, SeqCst);
    }

    unsafe fn quick_start(h: &Harness, entry: fn(*mut ())) {
        let (stack, stack_size) = StackMem::map(STACK_SIZE).expect("stack").into_raw();
        start(CoroDesc {
            stack,
            stack_size,
            entry,
            cleanup: Some(h_cleanup),
            udata: h as *const Harness as *mut Harness as *mut (),
        });
    }

    fn co_hit(u: *mut ()) {
        let h = unsafe { &*(u as *const Harness) };
        h.hits.set(h.hits.get() + 1);
        h.seen_id.set(id());
        assert_eq!(udata(), u);
    }

    fn co_pause_once(u: *mut ()) {
        let h = unsafe { &*(u as *const Harness) };
        h.seen_id.set(id());
        pause();
        h.hits.set(h.hits.get() + 1);
    }

    #[test]
    fn test_host_introspection() {
        assert_eq!(id(), 0);
        assert!(udata().is_null());
        assert!(!active());
        assert_eq!(stats().scheduled, 0);
        assert_eq!(stats().running, 0);
        assert_eq!(stats().paused, 0);
    }

    #[test]
    fn test_host_suspension_ops_are_noops() {
        yield_now();
        pause();
        exit();
        resume(0);
        resume(987654321);
        assert!(!active());
    }

    #[test]
    fn test_start_runs_to_completion() {
        let h = Harness::new();
        unsafe { quick_start(&h, co_hit) };
        assert_eq!(h.hits.get(), 1);
        assert_ne!(h.seen_id.get(), 0);
        assert_eq!(h.cleanups.load(SeqCst), 1);
        assert!(!active());
        assert_eq!(stats().scheduled + stats().running + stats().paused, 0);
    }

    #[test]
    fn test_pause_then_resume() {
        let h = Harness::new();
        unsafe { quick_start(&h, co_pause_once) };
        // The coroutine paused itself; start returned with it parked.
        assert_eq!(h.hits.get(), 0);
        assert_eq!(stats().paused, 1);
        assert!(active());

        let coro_id = h.seen_id.get();
        resume(coro_id);
        assert_eq!(stats().paused, 0);
        assert_eq!(stats().scheduled, 1);
        resume(0);
        assert_eq!(h.hits.get(), 1);
        assert_eq!(h.cleanups.load(SeqCst), 1);
        assert!(!active());
    }

    #[test]
    fn test_resume_wrong_state_ignored() {
        let h = Harness::new();
        unsafe { quick_start(&h, co_pause_once) };
        let coro_id = h.seen_id.get();
        // Unknown id: nothing happens.
        resume(coro_id + 100_000);
        assert_eq!(stats().paused, 1);
        // Already scheduled: the second resume is ignored.
        resume(coro_id);
        resume(coro_id);
        assert_eq!(stats().scheduled, 1);
        resume(0);
        assert_eq!(h.cleanups.load(SeqCst), 1);
    }

    #[test]
    fn test_resume_zero_on_empty_scheduler() {
        let before = stats();
        resume(0);
        let after = stats();
        // The detached count is process-wide and may move under other tests;
        // the per-thread counters must not.
        assert_eq!(after.scheduled, before.scheduled);
        assert_eq!(after.running, before.running);
        assert_eq!(after.paused, before.paused);
    }

    #[test]
    fn test_method_names_primitive() {
        assert!(method().starts_with("asm,"));
    }
}
