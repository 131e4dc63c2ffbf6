//! Multi-producer single-consumer (MPSC) bounded channel.
//!
//! Any number of producers send concurrently; a single consumer receives.
//! Producers coordinate through a per-slot state machine: claiming a send
//! position takes two compare-and-swap wins in a row, first the slot's
//! `Empty -> Writing` transition, then the write cursor advance, with the
//! slot claim rolled back if the cursor race is lost. Neither step alone
//! would do: the cursor CAS by itself would let a producer advance onto a
//! slot the consumer has not drained yet, and the slot claim by itself would
//! let two producers that read the same cursor claim different slots.
//!
//! # Example
//!
//! ```
//! use handoff::mpsc;
//! use std::thread;
//!
//! let (tx, mut rx) = mpsc::channel::<u64>(1024);
//! let tx2 = tx.clone();
//!
//! let a = thread::spawn(move || {
//!     for i in 0..100 {
//!         tx.send(i).unwrap();
//!     }
//! });
//! let b = thread::spawn(move || {
//!     for i in 100..200 {
//!         tx2.send(i).unwrap();
//!     }
//! });
//!
//! let mut sum = 0;
//! for _ in 0..200 {
//!     sum += rx.recv().unwrap();
//! }
//! assert_eq!(sum, (0..200).sum());
//!
//! a.join().unwrap();
//! b.join().unwrap();
//! ```
//!
//! # Ordering
//!
//! Values from a single producer arrive in the order that producer sent
//! them. Across producers the interleaving is decided by which cursor
//! advance wins; no fairness beyond that is promised.
//!
//! # Capacity
//!
//! As with the SPSC channel: a power of two, at least 2, holding up to
//! `capacity - 1` values at a time.

mod ring;

use std::fmt;
use std::hint;
use std::ptr::NonNull;

use crossbeam_utils::Backoff;

use ring::RingBuffer;

/// Creates a new MPSC channel with the given capacity.
///
/// Clone the [`Sender`] to add producers; all clones share the same ring.
///
/// # Panics
///
/// Panics unless `capacity` is a power of two and at least 2.
///
/// # Example
///
/// ```
/// use handoff::mpsc;
///
/// let (tx, rx) = mpsc::channel::<String>(16);
/// assert_eq!(tx.capacity(), 16); // holds up to 15 values
/// # drop((tx, rx));
/// ```
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let inner = RingBuffer::<T>::allocate(capacity);

    (Sender { inner }, Receiver { inner })
}

/// The sending half of an MPSC channel.
///
/// Clone it to create multiple producers; every clone may send from its own
/// thread concurrently.
pub struct Sender<T> {
    inner: NonNull<RingBuffer<T>>,
}

// Safety: the slot state machine synchronizes concurrent producers, so the
// sender may be sent to and shared across threads.
unsafe impl<T: Send> Send for Sender<T> {}
unsafe impl<T: Send> Sync for Sender<T> {}

impl<T> Sender<T> {
    /// Attempts to send a value without blocking.
    ///
    /// Retries internally while losing claim races to other producers (that
    /// is contention, not fullness) and returns only once the value is
    /// placed or the ring is genuinely full.
    ///
    /// # Errors
    ///
    /// Returns `Err(TrySendError::Full(value))` if the ring is full.
    /// Returns `Err(TrySendError::Disconnected(value))` if the receiver has
    /// been dropped.
    ///
    /// # Example
    ///
    /// ```
    /// use handoff::mpsc::{self, TrySendError};
    ///
    /// let (tx, rx) = mpsc::channel::<u32>(4);
    ///
    /// assert!(tx.try_send(1).is_ok());
    /// assert!(tx.try_send(2).is_ok());
    /// assert!(tx.try_send(3).is_ok());
    ///
    /// // One slot stays vacant: the ring is full now
    /// assert!(matches!(tx.try_send(4), Err(TrySendError::Full(4))));
    /// # drop(rx);
    /// ```
    #[inline]
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        // Safety: valid pointer from construction
        let inner = unsafe { self.inner.as_ref() };
        let backoff = Backoff::new();

        loop {
            let write = inner.load_write();
            let read = inner.load_read();

            // One slot short of the read cursor means full. The acquire on
            // the read load pairs with the consumer's release fence, so a
            // pass here also means the slot ahead has been drained.
            if inner.distance(write, read) == 1 {
                return self.try_send_full(inner, value);
            }

            let slot = inner.slot(write);

            if slot.try_begin_write() {
                if inner.try_advance_write(write) {
                    // Both races won: the slot is ours. Move the payload in
                    // and only then let the consumer see it.
                    // Safety: we hold the Writing ticket
                    unsafe {
                        slot.write_value(value);
                    }
                    slot.publish();
                    return Ok(());
                }

                // Claimed the slot but lost the cursor race on a stale
                // write index; hand the ticket back before retrying.
                slot.abort_write();
            }

            backoff.spin();
        }
    }

    #[cold]
    fn try_send_full(&self, inner: &RingBuffer<T>, value: T) -> Result<(), TrySendError<T>> {
        if inner.is_receiver_disconnected() {
            Err(TrySendError::Disconnected(value))
        } else {
            Err(TrySendError::Full(value))
        }
    }

    /// Sends a value, spinning while the ring is full.
    ///
    /// Each full-ring attempt issues a CPU pause hint; the call never yields
    /// to the scheduler and never parks.
    ///
    /// # Errors
    ///
    /// Returns the value in `SendError` if the receiver has been dropped.
    pub fn send(&self, mut value: T) -> Result<(), SendError<T>> {
        loop {
            match self.try_send(value) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(v)) => {
                    value = v;
                    hint::spin_loop();
                }
                Err(TrySendError::Disconnected(v)) => return Err(SendError(v)),
            }
        }
    }

    /// Returns the number of slots in the ring.
    ///
    /// The channel holds at most `capacity() - 1` values at a time.
    #[inline]
    pub fn capacity(&self) -> usize {
        // Safety: valid pointer from construction
        unsafe { self.inner.as_ref().capacity() }
    }

    /// Returns `true` if the receiver has been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        // Safety: valid pointer from construction
        unsafe { self.inner.as_ref().is_receiver_disconnected() }
    }

    /// Returns a snapshot of the number of values currently in the channel,
    /// counting slots producers have claimed but not yet published.
    #[inline]
    pub fn len(&self) -> usize {
        // Safety: valid pointer from construction
        unsafe { self.inner.as_ref().len() }
    }

    /// Returns `true` if the channel currently holds no values.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        // Safety: valid pointer from construction
        let inner = unsafe { self.inner.as_ref() };
        inner.add_sender();
        inner.acquire();

        Self { inner: self.inner }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // Safety: valid pointer, no more access after this
        unsafe {
            self.inner.as_ref().remove_sender();
            RingBuffer::release(self.inner);
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.capacity())
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

/// The receiving half of an MPSC channel.
///
/// Cannot be cloned; there is only ever one consumer.
pub struct Receiver<T> {
    inner: NonNull<RingBuffer<T>>,
}

// Safety: Receiver can be sent to another thread, but not shared (not Sync).
unsafe impl<T: Send> Send for Receiver<T> {}

impl<T> Receiver<T> {
    /// Attempts to receive a value without blocking.
    ///
    /// # Errors
    ///
    /// Returns `Err(TryRecvError::Empty)` if no published value is waiting;
    /// this covers both an empty ring and a producer that has claimed the
    /// next slot but not finished writing it.
    ///
    /// Returns `Err(TryRecvError::Disconnected)` if every sender has been
    /// dropped and nothing remains in flight.
    ///
    /// # Example
    ///
    /// ```
    /// use handoff::mpsc::{self, TryRecvError};
    ///
    /// let (tx, mut rx) = mpsc::channel::<u32>(8);
    ///
    /// assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    ///
    /// tx.send(42).unwrap();
    /// assert_eq!(rx.try_recv().unwrap(), 42);
    /// ```
    #[inline]
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        // Safety: valid pointer from construction, and we're the only consumer
        let inner = unsafe { self.inner.as_ref() };

        match unsafe { inner.try_read() } {
            Some(value) => Ok(value),
            None => self.try_recv_slow(inner),
        }
    }

    #[cold]
    fn try_recv_slow(&self, inner: &RingBuffer<T>) -> Result<T, TryRecvError> {
        if inner.sender_count() == 0 {
            // All senders gone. A cursor gap with no published slot would
            // mean a claim that never finished; matching cursors mean the
            // ring is truly drained.
            if inner.len() == 0 {
                return Err(TryRecvError::Disconnected);
            }
        }
        Err(TryRecvError::Empty)
    }

    /// Receives a value, spinning until the next slot in ring order is
    /// published.
    ///
    /// Each failed attempt issues a CPU pause hint; the call never yields to
    /// the scheduler and never parks.
    ///
    /// # Errors
    ///
    /// Returns `RecvError` if every sender has been dropped and the ring has
    /// drained.
    pub fn recv(&mut self) -> Result<T, RecvError> {
        loop {
            match self.try_recv() {
                Ok(value) => return Ok(value),
                Err(TryRecvError::Empty) => hint::spin_loop(),
                Err(TryRecvError::Disconnected) => return Err(RecvError),
            }
        }
    }

    /// Drops every published value and rewinds the channel to its freshly
    /// constructed state.
    ///
    /// Requires the receiver and the sole remaining sender, which guarantees
    /// no send or receive can run concurrently.
    ///
    /// # Panics
    ///
    /// Panics if `sender` belongs to a different channel, or if other sender
    /// clones are still alive.
    ///
    /// # Example
    ///
    /// ```
    /// use handoff::mpsc;
    ///
    /// let (mut tx, mut rx) = mpsc::channel::<u32>(8);
    /// tx.send(1).unwrap();
    /// tx.send(2).unwrap();
    ///
    /// rx.clear(&mut tx);
    /// assert!(rx.is_empty());
    /// ```
    pub fn clear(&mut self, sender: &mut Sender<T>) {
        assert_eq!(
            self.inner.as_ptr(),
            sender.inner.as_ptr(),
            "clear called with a sender from a different channel"
        );

        // Safety: &mut on the receiver and on the only live sender means no
        // other thread can be touching the ring.
        let inner = unsafe { self.inner.as_ref() };
        assert_eq!(
            inner.sender_count(),
            1,
            "clear called while other senders are still alive"
        );

        unsafe {
            inner.clear_slots();
        }
    }

    /// Returns the number of slots in the ring.
    ///
    /// The channel holds at most `capacity() - 1` values at a time.
    #[inline]
    pub fn capacity(&self) -> usize {
        // Safety: valid pointer from construction
        unsafe { self.inner.as_ref().capacity() }
    }

    /// Returns `true` if every sender has been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        // Safety: valid pointer from construction
        unsafe { self.inner.as_ref().sender_count() == 0 }
    }

    /// Returns a snapshot of the number of values currently in the channel,
    /// counting slots producers have claimed but not yet published.
    #[inline]
    pub fn len(&self) -> usize {
        // Safety: valid pointer from construction
        unsafe { self.inner.as_ref().len() }
    }

    /// Returns `true` if the channel currently holds no values.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        // Safety: valid pointer, no more access after this
        unsafe {
            self.inner.as_ref().set_receiver_disconnected();
            RingBuffer::release(self.inner);
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.capacity())
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

/// Error returned by [`Sender::try_send`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// The ring is full. Contains the value that couldn't be sent.
    Full(T),
    /// The receiver has been dropped. Contains the value that couldn't be sent.
    Disconnected(T),
}

impl<T> TrySendError<T> {
    /// Returns the value that couldn't be sent.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(val) | Self::Disconnected(val) => val,
        }
    }

    /// Returns `true` if this error is the `Full` variant.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    /// Returns `true` if this error is the `Disconnected` variant.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "queue is full"),
            Self::Disconnected(_) => write!(f, "receiver disconnected"),
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

impl<T> std::error::Error for TrySendError<T> {}

/// Error returned by [`Sender::send`] when the receiver has been dropped.
///
/// Contains the value that couldn't be sent.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> SendError<T> {
    /// Returns the value that couldn't be sent.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "receiver disconnected")
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SendError(..)")
    }
}

impl<T> std::error::Error for SendError<T> {}

/// Error returned by [`Receiver::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// No published value is waiting.
    Empty,
    /// Every sender has been dropped and the ring has drained.
    Disconnected,
}

impl TryRecvError {
    /// Returns `true` if this error is the `Empty` variant.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns `true` if this error is the `Disconnected` variant.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "queue is empty"),
            Self::Disconnected => write!(f, "all senders disconnected"),
        }
    }
}

impl std::error::Error for TryRecvError {}

/// Error returned by [`Receiver::recv`] when every sender has been dropped
/// and the ring has drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvError;

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all senders disconnected")
    }
}

impl std::error::Error for RecvError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    struct DropCounter(Arc<AtomicUsize>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ========================================================================
    // Construction
    // ========================================================================

    #[test]
    #[should_panic(expected = "power of two")]
    fn capacity_must_be_power_of_two() {
        let _ = channel::<u64>(12);
    }

    #[test]
    #[should_panic(expected = "at least 2")]
    fn capacity_must_be_at_least_two() {
        let _ = channel::<u64>(0);
    }

    // ========================================================================
    // Basic Operations
    // ========================================================================

    #[test]
    fn basic_send_recv() {
        let (tx, mut rx) = channel::<u64>(4);

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.send(3).unwrap();

        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(rx.recv().unwrap(), 3);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn holds_capacity_minus_one() {
        let (tx, mut rx) = channel::<u64>(8);

        for i in 0..7 {
            tx.try_send(i).unwrap();
        }
        assert_eq!(tx.len(), 7);
        assert!(matches!(tx.try_send(7), Err(TrySendError::Full(7))));

        assert_eq!(rx.try_recv().unwrap(), 0);
        tx.try_send(7).unwrap();
        assert!(matches!(tx.try_send(8), Err(TrySendError::Full(8))));

        for i in 1..8 {
            assert_eq!(rx.try_recv().unwrap(), i);
        }
    }

    #[test]
    fn single_producer_fifo_with_wraparound() {
        let (tx, mut rx) = channel::<u64>(4);

        for lap in 0..100 {
            for i in 0..3 {
                tx.try_send(lap * 3 + i).unwrap();
            }
            for i in 0..3 {
                assert_eq!(rx.try_recv().unwrap(), lap * 3 + i);
            }
        }
    }

    #[test]
    fn clone_sender() {
        let (tx1, mut rx) = channel::<u64>(8);
        let tx2 = tx1.clone();

        tx1.send(1).unwrap();
        tx2.send(2).unwrap();

        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
    }

    // ========================================================================
    // Clear
    // ========================================================================

    #[test]
    fn clear_drops_values_and_resets() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (mut tx, mut rx) = channel::<DropCounter>(8);

        tx.send(DropCounter(Arc::clone(&drops))).unwrap();
        tx.send(DropCounter(Arc::clone(&drops))).unwrap();

        rx.clear(&mut tx);

        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert!(rx.is_empty());

        // The cleared channel behaves like a fresh one, including a full
        // fill-and-drain cycle
        for _ in 0..7 {
            tx.send(DropCounter(Arc::clone(&drops))).unwrap();
        }
        for _ in 0..7 {
            drop(rx.recv().unwrap());
        }
        assert_eq!(drops.load(Ordering::SeqCst), 9);
    }

    #[test]
    #[should_panic(expected = "other senders")]
    fn clear_rejects_live_clones() {
        let (mut tx, mut rx) = channel::<u64>(4);
        let _tx2 = tx.clone();

        rx.clear(&mut tx);
    }

    #[test]
    #[should_panic(expected = "different channel")]
    fn clear_rejects_foreign_sender() {
        let (mut tx_a, _rx_a) = channel::<u64>(4);
        let (_tx_b, mut rx_b) = channel::<u64>(4);

        rx_b.clear(&mut tx_a);
    }

    // ========================================================================
    // Disconnection
    // ========================================================================

    #[test]
    fn sender_disconnect_after_drain() {
        let (tx, mut rx) = channel::<u64>(8);

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        drop(tx);

        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        assert!(matches!(rx.recv(), Err(RecvError)));
    }

    #[test]
    fn all_clones_must_drop_for_disconnect() {
        let (tx1, mut rx) = channel::<u64>(8);
        let tx2 = tx1.clone();

        tx1.send(1).unwrap();
        drop(tx1);
        assert!(!rx.is_disconnected());

        drop(tx2);
        assert_eq!(rx.recv().unwrap(), 1);
        assert!(matches!(rx.recv(), Err(RecvError)));
    }

    #[test]
    fn receiver_disconnect_on_full() {
        let (tx, rx) = channel::<u64>(4);

        drop(rx);

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.send(3).unwrap();
        assert!(matches!(tx.send(4), Err(SendError(4))));
    }

    // ========================================================================
    // Conservation
    // ========================================================================

    #[test]
    fn every_value_dropped_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = channel::<DropCounter>(8);

        for _ in 0..5 {
            tx.send(DropCounter(Arc::clone(&drops))).unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(rx.recv().unwrap());
        drop(rx.recv().unwrap());
        assert_eq!(drops.load(Ordering::SeqCst), 2);

        drop(tx);
        drop(rx);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn teardown_drops_residue() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel::<DropCounter>(8);

        tx.send(DropCounter(Arc::clone(&drops))).unwrap();
        tx.send(DropCounter(Arc::clone(&drops))).unwrap();
        tx.send(DropCounter(Arc::clone(&drops))).unwrap();

        drop(tx);
        drop(rx);

        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    // ========================================================================
    // Multi-Producer
    // ========================================================================

    #[test]
    fn interleaved_producers_sum() {
        const PRODUCERS: u64 = 3;
        const PER_PRODUCER: u64 = 1 << 16;
        const TOTAL: u64 = PRODUCERS * PER_PRODUCER;

        let (tx, mut rx) = channel::<u64>(1024);

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let tx = tx.clone();
                thread::spawn(move || {
                    // Producer p sends p, p + 3, p + 6, ... so the union of
                    // all producers covers 0..TOTAL exactly once
                    for i in 0..PER_PRODUCER {
                        tx.send(p + i * PRODUCERS).unwrap();
                    }
                })
            })
            .collect();
        drop(tx);

        let mut sum = 0u64;
        for _ in 0..TOTAL {
            sum += rx.recv().unwrap();
        }
        assert!(matches!(rx.recv(), Err(RecvError)));

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(sum, (TOTAL - 1) * TOTAL / 2);
    }

    #[test]
    #[ignore = "high-volume run, tens of seconds"]
    fn interleaved_producers_sum_full_volume() {
        const PRODUCERS: u64 = 3;
        const PER_PRODUCER: u64 = 1 << 24;
        const TOTAL: u64 = PRODUCERS * PER_PRODUCER;

        let (tx, mut rx) = channel::<u64>(1024);

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        tx.send(p + i * PRODUCERS).unwrap();
                    }
                })
            })
            .collect();
        drop(tx);

        let mut sum = 0u64;
        for _ in 0..TOTAL {
            sum += rx.recv().unwrap();
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(sum, (TOTAL - 1) * TOTAL / 2);
    }

    #[test]
    fn contention_on_minimal_ring() {
        // Effective capacity one: every send fights for the same slot
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 10_000;
        const TOTAL: usize = (PRODUCERS * PER_PRODUCER) as usize;

        let (tx, mut rx) = channel::<u64>(2);

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        tx.send((p << 32) | i).unwrap();
                    }
                })
            })
            .collect();
        drop(tx);

        let mut received = Vec::with_capacity(TOTAL);
        for _ in 0..TOTAL {
            received.push(rx.recv().unwrap());
        }
        assert!(matches!(rx.recv(), Err(RecvError)));

        for handle in handles {
            handle.join().unwrap();
        }

        // Per-producer subsequences are in program order, and together the
        // producers' inputs are recovered exactly
        let mut next = [0u64; PRODUCERS as usize];
        for value in received {
            let p = (value >> 32) as usize;
            let i = value & 0xFFFF_FFFF;
            assert_eq!(i, next[p], "producer {p} out of order");
            next[p] += 1;
        }
        assert_eq!(next, [PER_PRODUCER; PRODUCERS as usize]);
    }

    #[test]
    fn per_producer_fifo() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 5_000;

        let (tx, mut rx) = channel::<(u64, u64)>(64);

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        tx.send((p, i)).unwrap();
                    }
                })
            })
            .collect();
        drop(tx);

        let mut next = [0u64; PRODUCERS as usize];
        loop {
            match rx.recv() {
                Ok((p, i)) => {
                    assert_eq!(i, next[p as usize], "producer {p} out of order");
                    next[p as usize] += 1;
                }
                Err(RecvError) => break,
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(next, [PER_PRODUCER; PRODUCERS as usize]);
    }

    #[test]
    fn no_message_loss_on_disconnect() {
        // Regression guard: messages must not vanish when senders disconnect
        // while values are in flight
        for _ in 0..50 {
            const PRODUCERS: usize = 4;
            const PER_PRODUCER: usize = 1_000;

            let (tx, mut rx) = channel::<u64>(64);

            let handles: Vec<_> = (0..PRODUCERS)
                .map(|_| {
                    let tx = tx.clone();
                    thread::spawn(move || {
                        for i in 0..PER_PRODUCER {
                            tx.send(i as u64).unwrap();
                        }
                    })
                })
                .collect();
            drop(tx);

            let mut count = 0;
            while rx.recv().is_ok() {
                count += 1;
            }

            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(count, PRODUCERS * PER_PRODUCER, "lost messages!");
        }
    }

    // ========================================================================
    // Special Types
    // ========================================================================

    #[test]
    fn zero_sized_type() {
        let (tx, mut rx) = channel::<()>(8);

        tx.send(()).unwrap();
        tx.send(()).unwrap();

        rx.recv().unwrap();
        rx.recv().unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn move_only_type() {
        let (tx, mut rx) = channel::<Box<u64>>(4);

        tx.send(Box::new(9)).unwrap();
        assert_eq!(*rx.recv().unwrap(), 9);
    }

    #[test]
    fn large_struct() {
        struct LargeMessage {
            data: [u8; 256],
            id: u64,
        }

        let (tx, mut rx) = channel::<LargeMessage>(8);

        tx.send(LargeMessage {
            data: [7; 256],
            id: 99,
        })
        .unwrap();

        let received = rx.recv().unwrap();
        assert_eq!(received.id, 99);
        assert_eq!(received.data, [7; 256]);
    }
}
