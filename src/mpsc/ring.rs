//! The underlying ring buffer storage for MPSC channels.
//!
//! Unlike the SPSC ring, occupancy cannot be derived from the cursors alone:
//! several producers race on both the write cursor and the slot it points
//! at. Each slot therefore carries its own atomic state, and a producer owns
//! a slot only after winning two transitions in a row: the slot claim and
//! the cursor advance.

use std::cell::UnsafeCell;
use std::mem::{ManuallyDrop, MaybeUninit};
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Lifecycle of a slot: `Empty -> Writing -> Occupied -> Empty`.
///
/// `Writing` is the producer-held ticket between claiming a slot and
/// publishing its payload; the consumer never observes it as ready.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum SlotState {
    /// No payload; available for a producer to claim.
    Empty = 0,
    /// A producer has claimed the slot and is moving its payload in.
    Writing = 1,
    /// The payload is fully constructed and visible to the consumer.
    Occupied = 2,
}

/// A slot in the ring: payload storage plus the state that arbitrates it.
///
/// The state atomic and the payload cell are separate fields on purpose:
/// the state synchronizes producer/consumer hand-off, while the cell is
/// plain storage touched only by whichever side the state says owns it.
#[repr(C)]
pub(crate) struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(SlotState::Empty as u8),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Attempts the `Empty -> Writing` claim.
    ///
    /// Relaxed is enough: winning the claim conveys no payload data, it only
    /// elects which producer may proceed to the cursor race.
    #[inline(always)]
    pub(crate) fn try_begin_write(&self) -> bool {
        self.state
            .compare_exchange_weak(
                SlotState::Empty as u8,
                SlotState::Writing as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Returns the slot to `Empty` after losing the cursor race.
    #[inline(always)]
    pub(crate) fn abort_write(&self) {
        self.state.store(SlotState::Empty as u8, Ordering::Relaxed);
    }

    /// Moves a payload into the slot storage.
    ///
    /// # Safety
    ///
    /// Caller must hold the `Writing` ticket for this slot.
    #[inline(always)]
    pub(crate) unsafe fn write_value(&self, value: T) {
        // Safety: the Writing ticket grants exclusive access to the cell
        unsafe {
            (*self.value.get()).write(value);
        }
    }

    /// Publishes a fully constructed payload to the consumer.
    ///
    /// The release store pairs with the consumer's acquire load of the
    /// state, making the payload write visible.
    #[inline(always)]
    pub(crate) fn publish(&self) {
        self.state
            .store(SlotState::Occupied as u8, Ordering::Release);
    }
}

// Safety: the state protocol guarantees at most one thread touches the
// payload cell at a time.
unsafe impl<T: Send> Sync for Slot<T> {}
unsafe impl<T: Send> Send for Slot<T> {}

/// The backing storage for an MPSC channel.
///
/// Memory layout:
/// ```text
/// ┌───────────────────────────────────────────────────────┐
/// │ write_index (cache-line padded) - producers CAS here  │
/// ├───────────────────────────────────────────────────────┤
/// │ read_index (cache-line padded) - consumer cursor      │
/// ├───────────────────────────────────────────────────────┤
/// │ Slot[0]: { state, value }                             │
/// │ Slot[1]: { state, value }                             │
/// │ ...                                                   │
/// └───────────────────────────────────────────────────────┘
/// ```
#[repr(C)]
pub(crate) struct RingBuffer<T> {
    /// Next slot a producer will attempt to claim. Advanced by CAS.
    write_index: CachePadded<AtomicUsize>,
    /// Next slot the consumer will read. Updated by the receiver only,
    /// observed by producers for the full check.
    read_index: CachePadded<AtomicUsize>,

    buffer: *mut Slot<T>,

    // === Immutable configuration ===
    capacity: usize,
    mask: usize,

    // === Reference counting ===
    ref_count: AtomicUsize,

    // === Liveness tracking (cold path) ===
    /// Number of senders alive. When 0, all producers disconnected.
    sender_count: AtomicUsize,
    /// Set when the receiver is dropped.
    receiver_disconnected: AtomicBool,
}

unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Allocates and initializes a new ring buffer with every slot `Empty`.
    ///
    /// Initial ref_count is 2 (one sender + one receiver).
    ///
    /// # Panics
    ///
    /// Panics unless `capacity` is a power of two and at least 2.
    pub(crate) fn allocate(capacity: usize) -> NonNull<Self> {
        assert!(
            capacity >= 2,
            "channel capacity must be at least 2, got {capacity}"
        );
        assert!(
            capacity.is_power_of_two(),
            "channel capacity must be a power of two, got {capacity}"
        );

        let buffer = ManuallyDrop::new(Vec::<Slot<T>>::with_capacity(capacity)).as_mut_ptr();

        for i in 0..capacity {
            // Safety: i is within the allocation we just made
            unsafe {
                buffer.add(i).write(Slot::new());
            }
        }

        let rb = Box::new(Self {
            write_index: CachePadded::new(AtomicUsize::new(0)),
            read_index: CachePadded::new(AtomicUsize::new(0)),
            buffer,
            capacity,
            mask: capacity - 1,
            ref_count: AtomicUsize::new(2),
            sender_count: AtomicUsize::new(1),
            receiver_disconnected: AtomicBool::new(false),
        });

        unsafe { NonNull::new_unchecked(Box::into_raw(rb)) }
    }

    /// Returns the slot at the given index (automatically masked).
    #[inline(always)]
    pub(crate) fn slot(&self, index: usize) -> &Slot<T> {
        // Safety: buffer is valid and masking keeps the offset in bounds
        unsafe { &*self.buffer.add(index & self.mask) }
    }

    /// Returns the number of slots in the ring.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots from `from` up to `to` in ring order.
    #[inline(always)]
    pub(crate) fn distance(&self, from: usize, to: usize) -> usize {
        to.wrapping_sub(from).wrapping_add(self.capacity) & self.mask
    }

    /// The index one past `index`, wrapped to `[0, capacity)`.
    #[inline(always)]
    pub(crate) fn increment(&self, index: usize) -> usize {
        index.wrapping_add(1) & self.mask
    }

    // === Producer operations ===

    /// Loads the write cursor a producer will race on.
    ///
    /// Relaxed: a stale value only sends the producer through a failed CAS.
    #[inline(always)]
    pub(crate) fn load_write(&self) -> usize {
        self.write_index.load(Ordering::Relaxed)
    }

    /// Loads the read cursor for the full check, synchronizing with the
    /// consumer's slot release.
    #[inline(always)]
    pub(crate) fn load_read(&self) -> usize {
        self.read_index.load(Ordering::Acquire)
    }

    /// Attempts to advance the write cursor from `write` to the next index.
    ///
    /// Failure means the observed cursor was stale; the caller must release
    /// its slot claim and retry from scratch.
    #[inline(always)]
    pub(crate) fn try_advance_write(&self, write: usize) -> bool {
        self.write_index
            .compare_exchange_weak(
                write,
                self.increment(write),
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Snapshot of the current element count (claimed slots included).
    #[inline]
    pub(crate) fn len(&self) -> usize {
        let read = self.read_index.load(Ordering::Relaxed);
        let write = self.write_index.load(Ordering::Relaxed);
        self.distance(read, write)
    }

    // === Consumer operations ===

    /// Attempts to read the slot under the read cursor.
    ///
    /// Returns `None` if that slot holds no published payload, which covers
    /// both an empty ring and a producer mid-write.
    ///
    /// # Safety
    ///
    /// Must only be called from a single consumer thread.
    #[inline]
    pub(crate) unsafe fn try_read(&self) -> Option<T> {
        let read = self.read_index.load(Ordering::Relaxed);
        let slot = self.slot(read);

        // Acquire pairs with the producer's release publish
        if slot.state.load(Ordering::Acquire) != SlotState::Occupied as u8 {
            return None;
        }

        // Safety: Occupied means the payload is fully constructed and no
        // producer will touch this slot until we store Empty
        let value = unsafe { (*slot.value.get()).assume_init_read() };

        // Order the payload read before the two relaxed stores below; a
        // producer that acquires either store must not see a torn read.
        fence(Ordering::Release);

        self.read_index
            .store(self.increment(read), Ordering::Relaxed);
        slot.state.store(SlotState::Empty as u8, Ordering::Relaxed);

        Some(value)
    }

    // === Liveness ===

    #[inline]
    pub(crate) fn add_sender(&self) {
        self.sender_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn remove_sender(&self) -> usize {
        self.sender_count.fetch_sub(1, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn sender_count(&self) -> usize {
        self.sender_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_receiver_disconnected(&self) -> bool {
        self.receiver_disconnected.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_receiver_disconnected(&self) {
        self.receiver_disconnected.store(true, Ordering::Release);
    }

    // === Lifecycle ===

    /// Adds a reference for a cloned sender handle.
    #[inline]
    pub(crate) fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops the payload of every `Occupied` slot, resets all slots to
    /// `Empty` and both cursors to zero.
    ///
    /// # Safety
    ///
    /// No other thread may access the ring while this runs.
    pub(crate) unsafe fn clear_slots(&self) {
        for i in 0..self.capacity {
            let slot = self.slot(i);
            if slot.state.load(Ordering::Relaxed) == SlotState::Occupied as u8 {
                // Safety: Occupied slots hold values written but never read
                unsafe {
                    ptr::drop_in_place(slot.value.get().cast::<T>());
                }
                slot.state.store(SlotState::Empty as u8, Ordering::Relaxed);
            }
        }

        self.read_index.store(0, Ordering::Relaxed);
        self.write_index.store(0, Ordering::Relaxed);
    }

    /// Decrements the reference count; the last release drops every
    /// `Occupied` payload and frees the slot buffer and the header.
    ///
    /// # Safety
    ///
    /// Must only be called when a handle (Sender or Receiver) is being
    /// dropped. The pointer must not be used after this call returns.
    pub(crate) unsafe fn release(this: NonNull<Self>) {
        let inner = unsafe { this.as_ref() };

        if inner.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            unsafe {
                inner.clear_slots();

                // Reconstruct and drop the Vec to free the slot buffer
                let _ = Vec::from_raw_parts(inner.buffer, 0, inner.capacity);

                // Reconstruct and drop the Box to free the header
                let _ = Box::from_raw(this.as_ptr());
            }
        }
    }
}
