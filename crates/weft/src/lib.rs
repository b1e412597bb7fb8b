//! Deterministic cooperative scheduling for stackful coroutines.
//!
//! `weft` owns scheduling policy, coroutine identity, lifecycle, and
//! cross-thread migration of suspended coroutines. The actual register
//! save/restore is delegated to the [`weft-ctx`](weft_ctx) crate, and stacks
//! are always caller-owned: the scheduler allocates nothing for its queues
//! and never frees a stack. A coroutine's `cleanup` callback is where the
//! caller reclaims memory, invoked exactly once and never on the stack being
//! released.
//!
//! Each OS thread that calls [`start`] gets an independent scheduler with a
//! strict FIFO run queue and a pause set. Scheduling is cooperative and
//! deterministic: control moves only at [`yield_now`], [`pause`], [`exit`],
//! coroutine termination, and [`start`] itself. A host thread drives its
//! scheduler from an outer runloop with [`resume`]`(0)`, which runs the
//! currently scheduled coroutines and hands control back when only paused
//! coroutines remain, which is the hook an embedding event loop uses to
//! service the things its coroutines are paused on.
//!
//! Paused coroutines can be [`detach`]ed from their thread, published in a
//! process-wide registry, and [`attach`]ed by another thread, which is how a
//! larger runtime migrates blocked work between schedulers.
//!
//! # Example
//!
//! ```no_run
//! use weft::{CoroDesc, StackMem};
//!
//! fn greet(_udata: *mut ()) {
//!     println!("hello from coroutine {}", weft::id());
//!     weft::yield_now();
//!     println!("and goodbye");
//! }
//!
//! fn release(stack: *mut u8, stack_size: usize, _udata: *mut ()) {
//!     drop(unsafe { StackMem::from_raw(stack, stack_size) });
//! }
//!
//! let (stack, stack_size) = StackMem::map_default().unwrap().into_raw();
//! unsafe {
//!     weft::start(CoroDesc {
//!         stack,
//!         stack_size,
//!         entry: greet,
//!         cleanup: Some(release),
//!         udata: std::ptr::null_mut(),
//!     });
//! }
//! while weft::active() {
//!     weft::resume(0);
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod coro;
mod list;
mod registry;
mod sched;

pub use coro::{CleanupFn, CoroDesc, EntryFn};
pub use sched::{
    active, attach, detach, exit, id, method, pause, resume, start, stats, udata, yield_now, Stats,
};

// Re-export the context layer: hosts that embed the scheduler usually need
// the stack helper and the minimum-size constant.
pub use weft_ctx::stack::{StackError, StackMem, DEFAULT_STACK_SIZE};
pub use weft_ctx::MIN_STACK_SIZE;
