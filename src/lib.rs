//! Bounded lock-free queues for cross-core hand-off.
//!
//! `handoff` provides two fixed-capacity ring-buffer channels built for
//! threads pinned to distinct CPU cores:
//!
//! - [`spsc`]: exactly one producer, exactly one consumer. Two atomic
//!   cursors, no compare-and-swap on the hot path.
//! - [`mpsc`]: any number of producers, exactly one consumer. A per-slot
//!   state machine arbitrates concurrent producers without a lock.
//!
//! Both channels allocate their buffer once at construction, never touch a
//! mutex or a kernel wait primitive, and preserve FIFO order from each
//! producer's perspective. Waits (queue full, queue empty) are busy spins
//! that issue a CPU pause hint on every iteration, keeping hand-off latency
//! in the sub-microsecond range at the cost of burning a core while blocked.
//!
//! # Quick Start
//!
//! ```
//! use handoff::spsc;
//!
//! let (tx, rx) = spsc::channel::<u64>(1024);
//!
//! tx.send(42).unwrap();
//! assert_eq!(rx.recv().unwrap(), 42);
//! ```
//!
//! # Capacity
//!
//! Both constructors take the number of ring slots, which must be a power of
//! two and at least 2. One slot is kept as a sentinel to distinguish a full
//! ring from an empty one, so a channel built with capacity `N` holds at
//! most `N - 1` values at once.
//!
//! # Picking a queue
//!
//! The SPSC channel is the faster of the two: producer and consumer each own
//! one cursor outright and publish with a single release store. Reach for
//! the MPSC channel only when values genuinely originate on more than one
//! thread; its producers pay two compare-and-swap operations per send.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod mpsc;
pub mod spsc;
