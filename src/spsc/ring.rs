//! The underlying ring buffer storage for SPSC channels.
//!
//! A single heap allocation holds `capacity` payload cells; a separately
//! boxed header carries the two cursors and channel lifecycle state. Slot
//! occupancy is derived entirely from the cursors: the cells in
//! `[read_index, write_index)` (in ring order) hold live values, everything
//! else is uninitialized storage.

use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// The backing storage for an SPSC channel.
///
/// Memory layout:
/// ```text
/// ┌───────────────────────────────────────────────────────┐
/// │ write_index (cache-line padded) - producer cursor     │
/// ├───────────────────────────────────────────────────────┤
/// │ read_index (cache-line padded) - consumer cursor      │
/// ├───────────────────────────────────────────────────────┤
/// │ buffer pointer, capacity, mask, lifecycle flags       │
/// └───────────────────────────────────────────────────────┘
/// ```
///
/// Both cursors stay in `[0, capacity)`; advancing wraps through the modulo
/// mask. Keeping them on separate cache lines stops producer stores from
/// invalidating the consumer's line and vice versa.
#[repr(C)]
pub(crate) struct RingBuffer<T> {
    /// Next slot the producer will write. Updated by the sender only,
    /// observed by the receiver.
    write_index: CachePadded<AtomicUsize>,
    /// Next slot the consumer will read. Updated by the receiver only,
    /// observed by the sender.
    read_index: CachePadded<AtomicUsize>,

    /// Contiguous payload cells, `capacity` of them.
    buffer: *mut T,

    // === Immutable configuration (set once at construction) ===
    capacity: usize,
    mask: usize,

    // === Reference counting ===
    ref_count: AtomicUsize,

    // === Disconnect flags (only checked on slow paths) ===
    sender_disconnected: AtomicBool,
    receiver_disconnected: AtomicBool,
}

// Safety: RingBuffer can be shared across threads. The atomic cursors
// provide the necessary synchronization; slot cells are touched only by the
// side that currently owns them per the cursor protocol.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Allocates and initializes a new ring buffer.
    ///
    /// The returned `NonNull` has a reference count of 2 (one for the
    /// sender, one for the receiver).
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

        // Vec handles size/alignment for us; the pointer is detached here
        // and handed back to a Vec in `release` for deallocation.
        let buffer = ManuallyDrop::new(Vec::<T>::with_capacity(capacity)).as_mut_ptr();

        let rb = Box::new(Self {
            write_index: CachePadded::new(AtomicUsize::new(0)),
            read_index: CachePadded::new(AtomicUsize::new(0)),
            buffer,
            capacity,
            mask: capacity - 1,
            ref_count: AtomicUsize::new(2),
            sender_disconnected: AtomicBool::new(false),
            receiver_disconnected: AtomicBool::new(false),
        });

        // Leak the Box, we manage lifetime manually via ref_count
        unsafe { NonNull::new_unchecked(Box::into_raw(rb)) }
    }

    /// Returns a pointer to the slot at the given index (automatically masked).
    #[inline(always)]
    fn slot_ptr(&self, index: usize) -> *mut T {
        // Safety: buffer is valid and masking keeps the offset in bounds
        unsafe { self.buffer.add(index & self.mask) }
    }

    /// Returns the number of slots in the ring.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the modulo mask, `capacity - 1`.
    #[inline(always)]
    pub(crate) fn mask(&self) -> usize {
        self.mask
    }

    /// Number of slots from `from` up to `to` in ring order.
    ///
    /// `distance(read, write)` is the current element count;
    /// `distance(read, write) == mask` means the ring is full.
    #[inline(always)]
    pub(crate) fn distance(&self, from: usize, to: usize) -> usize {
        to.wrapping_sub(from).wrapping_add(self.capacity) & self.mask
    }

    /// The index one past `index`, wrapped to `[0, capacity)`.
    #[inline(always)]
    pub(crate) fn increment(&self, index: usize) -> usize {
        index.wrapping_add(1) & self.mask
    }

    // === Cursor operations ===

    /// Loads the producer cursor, synchronizing with its release store.
    #[inline(always)]
    pub(crate) fn load_write(&self) -> usize {
        self.write_index.load(Ordering::Acquire)
    }

    /// Loads the consumer cursor, synchronizing with its release store.
    #[inline(always)]
    pub(crate) fn load_read(&self) -> usize {
        self.read_index.load(Ordering::Acquire)
    }

    /// Publishes a new producer cursor after the slot write completed.
    #[inline(always)]
    pub(crate) fn publish_write(&self, index: usize) {
        self.write_index.store(index, Ordering::Release);
    }

    /// Publishes a new consumer cursor after the slot read completed.
    #[inline(always)]
    pub(crate) fn publish_read(&self, index: usize) {
        self.read_index.store(index, Ordering::Release);
    }

    /// Snapshot of the current element count.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        let read = self.read_index.load(Ordering::Relaxed);
        let write = self.write_index.load(Ordering::Relaxed);
        self.distance(read, write)
    }

    // === Slot operations ===

    /// Moves a value into the slot at the given index.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive write access to this slot and the slot
    /// must not hold a live value.
    #[inline(always)]
    pub(crate) unsafe fn write_slot(&self, index: usize, value: T) {
        // Safety: caller guarantees exclusive access and the slot is vacant
        unsafe {
            self.slot_ptr(index).write(value);
        }
    }

    /// Moves the value out of the slot at the given index.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive read access to this slot and the slot must
    /// hold an initialized value.
    #[inline(always)]
    pub(crate) unsafe fn read_slot(&self, index: usize) -> T {
        // Safety: caller guarantees exclusive access and initialized data
        unsafe { self.slot_ptr(index).read() }
    }

    // === Disconnect operations ===

    /// Returns true if the sender has been dropped.
    #[inline(always)]
    pub(crate) fn is_sender_disconnected(&self) -> bool {
        self.sender_disconnected.load(Ordering::Relaxed)
    }

    /// Returns true if the receiver has been dropped.
    #[inline(always)]
    pub(crate) fn is_receiver_disconnected(&self) -> bool {
        self.receiver_disconnected.load(Ordering::Relaxed)
    }

    /// Marks the sender as disconnected.
    #[inline(always)]
    pub(crate) fn set_sender_disconnected(&self) {
        self.sender_disconnected.store(true, Ordering::Release);
    }

    /// Marks the receiver as disconnected.
    #[inline(always)]
    pub(crate) fn set_receiver_disconnected(&self) {
        self.receiver_disconnected.store(true, Ordering::Release);
    }

    // === Lifecycle ===

    /// Drops every element in `[read_index, write_index)` and resets both
    /// cursors to zero, leaving the ring observably fresh.
    ///
    /// # Safety
    ///
    /// No other thread may access the ring while this runs.
    pub(crate) unsafe fn clear_elements(&self) {
        let read = self.read_index.load(Ordering::Relaxed);
        let write = self.write_index.load(Ordering::Relaxed);

        let mut index = read;
        while index != write {
            // Safety: slots in [read, write) hold values written but never read
            unsafe {
                ptr::drop_in_place(self.slot_ptr(index));
            }
            index = self.increment(index);
        }

        self.read_index.store(0, Ordering::Relaxed);
        self.write_index.store(0, Ordering::Relaxed);
    }

    /// Decrements the reference count; the last release drops any remaining
    /// elements and frees the buffer and the header.
    ///
    /// # Safety
    ///
    /// Must only be called when a handle (Sender or Receiver) is being
    /// dropped. The pointer must not be used after this call returns.
    pub(crate) unsafe fn release(this: NonNull<Self>) {
        let inner = unsafe { this.as_ref() };

        if inner.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Sole owner now; plain accesses cannot race.
            unsafe {
                inner.clear_elements();

                // Reconstruct and drop the Vec to free the slot buffer
                let _ = Vec::from_raw_parts(inner.buffer, 0, inner.capacity);

                // Reconstruct and drop the Box to free the header
                let _ = Box::from_raw(this.as_ptr());
            }
        }
    }
}
