//! Single-producer single-consumer (SPSC) bounded channel.
//!
//! This is the faster of the two channel variants: producer and consumer
//! each own one ring cursor outright, so the hot path needs no
//! compare-and-swap, only an acquire load on the slow path and a release
//! store to publish.
//!
//! # Example
//!
//! ```
//! use handoff::spsc;
//!
//! let (tx, rx) = spsc::channel::<u64>(8);
//!
//! tx.send(1).unwrap();
//! tx.send(2).unwrap();
//!
//! assert_eq!(rx.recv().unwrap(), 1);
//! assert_eq!(rx.recv().unwrap(), 2);
//! ```
//!
//! # Blocking behavior
//!
//! [`Sender::send`] spins while the ring is full and [`Receiver::recv`]
//! spins while it is empty, issuing a CPU pause hint on every iteration.
//! Neither ever parks on a kernel primitive, so neither can be cancelled or
//! timed out; use the `try_` variants to poll instead. A spin only ends
//! early if the peer handle is dropped, which surfaces as a
//! [`SendError`]/[`RecvError`].
//!
//! # Capacity
//!
//! The capacity passed to [`channel`] must be a power of two and at least 2.
//! One slot stays vacant to tell a full ring from an empty one, so the
//! channel holds at most `capacity - 1` values at a time.

mod ring;

use std::cell::Cell;
use std::fmt;
use std::hint;
use std::ptr::NonNull;

use ring::RingBuffer;

/// Creates a new SPSC channel with the given capacity.
///
/// # Panics
///
/// Panics unless `capacity` is a power of two and at least 2.
///
/// # Example
///
/// ```
/// use handoff::spsc;
///
/// let (tx, rx) = spsc::channel::<String>(16);
/// assert_eq!(tx.capacity(), 16); // holds up to 15 values
/// # drop((tx, rx));
/// ```
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let inner = RingBuffer::<T>::allocate(capacity);

    (
        Sender {
            inner,
            local_write: Cell::new(0),
            cached_read: Cell::new(0),
        },
        Receiver {
            inner,
            local_read: Cell::new(0),
            cached_write: Cell::new(0),
        },
    )
}

/// The sending half of an SPSC channel.
///
/// Owned by exactly one thread at a time (`Send` but not `Sync`, not
/// `Clone`), which is what makes the single-producer protocol sound.
pub struct Sender<T> {
    inner: NonNull<RingBuffer<T>>,

    /// Our write cursor (authoritative, only we update it).
    local_write: Cell<usize>,

    /// Cached snapshot of the consumer's read cursor.
    /// Only refreshed when the ring appears full.
    cached_read: Cell<usize>,
}

// Safety: Sender can be sent to another thread, but cannot be shared across
// threads (not Sync). The ring buffer is properly synchronized.
unsafe impl<T: Send> Send for Sender<T> {}

impl<T> Sender<T> {
    /// Attempts to send a value without blocking.
    ///
    /// # Errors
    ///
    /// Returns `Err(TrySendError::Full(value))` if the ring is full.
    /// Returns `Err(TrySendError::Disconnected(value))` if the receiver has
    /// been dropped and the ring is full.
    ///
    /// # Example
    ///
    /// ```
    /// use handoff::spsc::{self, TrySendError};
    ///
    /// let (tx, rx) = spsc::channel::<u32>(4);
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
        // Safety: valid pointer from construction, and we're the only producer
        let inner = unsafe { self.inner.as_ref() };
        let write = self.local_write.get();

        // Fast path: the cached read cursor can only lag the consumer, so the
        // element count it yields is an overestimate and a pass here is safe.
        if inner.distance(self.cached_read.get(), write) != inner.mask() {
            // Safety: we have exclusive write access to this slot
            unsafe {
                inner.write_slot(write, value);
            }
            let next = inner.increment(write);
            inner.publish_write(next);
            self.local_write.set(next);
            return Ok(());
        }

        self.try_send_slow(inner, write, value)
    }

    #[cold]
    fn try_send_slow(
        &self,
        inner: &RingBuffer<T>,
        write: usize,
        value: T,
    ) -> Result<(), TrySendError<T>> {
        // Refresh the cache; the acquire pairs with the consumer's release,
        // so any slot it freed is really ours to overwrite.
        let read = inner.load_read();
        self.cached_read.set(read);

        if inner.distance(read, write) != inner.mask() {
            // Safety: we have exclusive write access to this slot
            unsafe {
                inner.write_slot(write, value);
            }
            let next = inner.increment(write);
            inner.publish_write(next);
            self.local_write.set(next);
            return Ok(());
        }

        if inner.is_receiver_disconnected() {
            return Err(TrySendError::Disconnected(value));
        }

        Err(TrySendError::Full(value))
    }

    /// Sends a value, spinning while the ring is full.
    ///
    /// Each failed attempt issues a CPU pause hint; the call never yields to
    /// the scheduler and never parks.
    ///
    /// # Errors
    ///
    /// Returns the value in `SendError` if the receiver has been dropped and
    /// the ring can no longer drain.
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
    ///
    /// Note: this may be stale; the receiver could be dropped immediately
    /// after it returns `false`.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        // Safety: valid pointer from construction
        unsafe { self.inner.as_ref().is_receiver_disconnected() }
    }

    /// Returns a snapshot of the number of values currently in the channel.
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

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // Safety: valid pointer, no more access after this
        unsafe {
            self.inner.as_ref().set_sender_disconnected();
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

/// The receiving half of an SPSC channel.
///
/// Owned by exactly one thread at a time (`Send` but not `Sync`, not
/// `Clone`), which is what makes the single-consumer protocol sound.
pub struct Receiver<T> {
    inner: NonNull<RingBuffer<T>>,

    /// Our read cursor (authoritative, only we update it).
    local_read: Cell<usize>,

    /// Cached snapshot of the producer's write cursor.
    /// Only refreshed when the ring appears empty.
    cached_write: Cell<usize>,
}

// Safety: Receiver can be sent to another thread, but cannot be shared
// across threads (not Sync). The ring buffer is properly synchronized.
unsafe impl<T: Send> Send for Receiver<T> {}

impl<T> Receiver<T> {
    /// Attempts to receive a value without blocking.
    ///
    /// # Errors
    ///
    /// Returns `Err(TryRecvError::Empty)` if the ring is empty.
    /// Returns `Err(TryRecvError::Disconnected)` if the sender has been
    /// dropped and the ring has drained.
    ///
    /// # Example
    ///
    /// ```
    /// use handoff::spsc::{self, TryRecvError};
    ///
    /// let (tx, rx) = spsc::channel::<u32>(8);
    ///
    /// assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    ///
    /// tx.try_send(42).unwrap();
    /// assert_eq!(rx.try_recv().unwrap(), 42);
    /// ```
    #[inline]
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        // Safety: valid pointer from construction, and we're the only consumer
        let inner = unsafe { self.inner.as_ref() };
        let read = self.local_read.get();

        // Fast path: the cached write cursor can only lag the producer, so
        // any element it shows is really there.
        if read != self.cached_write.get() {
            // Safety: we have exclusive read access to this slot
            let value = unsafe { inner.read_slot(read) };
            let next = inner.increment(read);
            inner.publish_read(next);
            self.local_read.set(next);
            return Ok(value);
        }

        self.try_recv_slow(inner, read)
    }

    #[cold]
    fn try_recv_slow(&self, inner: &RingBuffer<T>, read: usize) -> Result<T, TryRecvError> {
        // Refresh the cache; the acquire pairs with the producer's release,
        // so the slot's payload is fully visible before we move it out.
        let write = inner.load_write();
        self.cached_write.set(write);

        if read != write {
            // Safety: we have exclusive read access to this slot
            let value = unsafe { inner.read_slot(read) };
            let next = inner.increment(read);
            inner.publish_read(next);
            self.local_read.set(next);
            return Ok(value);
        }

        if inner.is_sender_disconnected() {
            return Err(TryRecvError::Disconnected);
        }

        Err(TryRecvError::Empty)
    }

    /// Receives a value, spinning while the ring is empty.
    ///
    /// Each failed attempt issues a CPU pause hint; the call never yields to
    /// the scheduler and never parks.
    ///
    /// # Errors
    ///
    /// Returns `RecvError` if the sender has been dropped and every
    /// remaining value has been drained.
    pub fn recv(&self) -> Result<T, RecvError> {
        loop {
            match self.try_recv() {
                Ok(value) => return Ok(value),
                Err(TryRecvError::Empty) => hint::spin_loop(),
                Err(TryRecvError::Disconnected) => return Err(RecvError),
            }
        }
    }

    /// Drops every value currently in the channel and rewinds it to its
    /// freshly constructed state.
    ///
    /// Requires both halves of the channel, which guarantees no send or
    /// receive can run concurrently.
    ///
    /// # Panics
    ///
    /// Panics if `sender` belongs to a different channel.
    ///
    /// # Example
    ///
    /// ```
    /// use handoff::spsc;
    ///
    /// let (mut tx, mut rx) = spsc::channel::<u32>(8);
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

        // Safety: &mut on both handles and neither is Sync, so no other
        // thread can be touching the ring.
        unsafe {
            self.inner.as_ref().clear_elements();
        }

        sender.local_write.set(0);
        sender.cached_read.set(0);
        self.local_read.set(0);
        self.cached_write.set(0);
    }

    /// Returns the number of slots in the ring.
    ///
    /// The channel holds at most `capacity() - 1` values at a time.
    #[inline]
    pub fn capacity(&self) -> usize {
        // Safety: valid pointer from construction
        unsafe { self.inner.as_ref().capacity() }
    }

    /// Returns `true` if the sender has been dropped.
    ///
    /// Note: this may be stale; the sender could be dropped immediately
    /// after it returns `false`.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        // Safety: valid pointer from construction
        unsafe { self.inner.as_ref().is_sender_disconnected() }
    }

    /// Returns a snapshot of the number of values currently in the channel.
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
    /// The ring is empty.
    Empty,
    /// The sender has been dropped and the ring has drained.
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
            Self::Disconnected => write!(f, "sender disconnected"),
        }
    }
}

impl std::error::Error for TryRecvError {}

/// Error returned by [`Receiver::recv`] when the sender has been dropped and
/// the ring has drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvError;

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sender disconnected")
    }
}

impl std::error::Error for RecvError {}
