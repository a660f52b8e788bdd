//! Fixed pool of event buffers shared by the receive path and the engine.
//!
//! The transport callback context acquires a buffer, copies an incoming
//! payload into it and hands it to the update engine. The engine returns it
//! once the payload has been processed. Buffers are never allocated beyond
//! the `N` slots of the pool: when all of them are owned, `acquire` fails
//! immediately instead of waiting.
//!
//! Ownership of a slot is represented by an [`EventBuffer`] token. The token
//! cannot be cloned and frees its slot when it is released or dropped, so a
//! slot cannot be released twice or touched after release.

use core::cell::RefCell;
use core::fmt;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::error::RouteError;

/// Number of event buffers used when none is configured.
pub const DEFAULT_BUFFER_COUNT: usize = 4;

/// Size of one event buffer used when none is configured: a 4 KiB file block
/// plus the framing around it.
pub const DEFAULT_BUFFER_SIZE: usize = 4096 + 30;

struct EventData<const SIZE: usize> {
    data: [u8; SIZE],
    len: usize,
}

impl<const SIZE: usize> EventData<SIZE> {
    const fn new() -> Self {
        Self {
            data: [0; SIZE],
            len: 0,
        }
    }

    fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// Access to the slots of the pool a buffer came from.
trait SlotAccess<const SIZE: usize>: Sync {
    fn with_slot(&self, index: usize, f: &mut dyn FnMut(&mut EventData<SIZE>));
    fn release_slot(&self, index: usize);
}

/// A fixed array of `N` reusable buffers of `SIZE` bytes each.
///
/// The in-use flags and the slot contents sit behind two blocking mutexes.
/// The flag lock is held for one scan of the flags, so waiting on it is
/// bounded by `N`. The slot lock is held while a buffer is filled or read.
///
/// # Example
///
/// ```ignore
/// static POOL: EventBufferPool<CriticalSectionRawMutex, 4, 1024> = EventBufferPool::new();
///
/// if let Some(mut buf) = POOL.acquire() {
///     buf.fill(payload)?;
///     engine.signal_event(AgentEvent::ReceivedFileBlock(buf))?;
/// }
/// ```
pub struct EventBufferPool<
    M: RawMutex,
    const N: usize = DEFAULT_BUFFER_COUNT,
    const SIZE: usize = DEFAULT_BUFFER_SIZE,
> {
    in_use: Mutex<M, RefCell<[bool; N]>>,
    slots: Mutex<M, [RefCell<EventData<SIZE>>; N]>,
}

impl<M: RawMutex, const N: usize, const SIZE: usize> EventBufferPool<M, N, SIZE> {
    /// Creates a pool with every buffer free.
    pub const fn new() -> Self {
        Self {
            in_use: Mutex::new(RefCell::new([false; N])),
            slots: Mutex::new([const { RefCell::new(EventData::new()) }; N]),
        }
    }

    /// Total number of buffers.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Size of each buffer in bytes.
    pub const fn buffer_size(&self) -> usize {
        SIZE
    }

    /// Number of buffers not currently owned.
    pub fn available(&self) -> usize {
        self.in_use
            .lock(|flags| flags.borrow().iter().filter(|used| !**used).count())
    }
}

impl<M: RawMutex + Sync, const N: usize, const SIZE: usize> EventBufferPool<M, N, SIZE> {
    /// Takes the first free buffer, or returns `None` if all are owned.
    ///
    /// The returned buffer is empty.
    pub fn acquire(&self) -> Option<EventBuffer<'_, SIZE>> {
        let index = self.in_use.lock(|flags| {
            let mut flags = flags.borrow_mut();
            let index = flags.iter().position(|used| !*used)?;
            flags[index] = true;
            Some(index)
        });

        let Some(index) = index else {
            debug!("event buffer pool exhausted ({} buffers)", N);
            return None;
        };

        self.with_slot(index, &mut |slot| slot.len = 0);
        trace!("acquired event buffer {}", index);

        Some(EventBuffer { index, pool: self })
    }

    /// Returns a buffer to the pool.
    ///
    /// Equivalent to dropping the buffer; the token is consumed either way.
    pub fn release(&self, buffer: EventBuffer<'_, SIZE>) {
        let owner = buffer.pool as *const dyn SlotAccess<SIZE>;
        if !core::ptr::addr_eq(owner, self as *const Self) {
            error!("event buffer {} released into a foreign pool", buffer.index);
        }
        drop(buffer);
    }
}

impl<M: RawMutex, const N: usize, const SIZE: usize> Default for EventBufferPool<M, N, SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex + Sync, const N: usize, const SIZE: usize> SlotAccess<SIZE>
    for EventBufferPool<M, N, SIZE>
{
    fn with_slot(&self, index: usize, f: &mut dyn FnMut(&mut EventData<SIZE>)) {
        self.slots.lock(|slots| f(&mut slots[index].borrow_mut()));
    }

    fn release_slot(&self, index: usize) {
        self.in_use.lock(|flags| {
            flags.borrow_mut()[index] = false;
        });
        trace!("released event buffer {}", index);
    }
}

/// Exclusive ownership of one pool slot.
///
/// The bytes stay in the pool; they are reached through [`fill`](Self::fill),
/// [`with_payload`](Self::with_payload) and [`read`](Self::read).
pub struct EventBuffer<'p, const SIZE: usize> {
    index: usize,
    pool: &'p dyn SlotAccess<SIZE>,
}

impl<const SIZE: usize> EventBuffer<'_, SIZE> {
    /// Replaces the buffer content with `payload`.
    ///
    /// Fails without touching the buffer if the payload is larger than `SIZE`.
    pub fn fill(&mut self, payload: &[u8]) -> Result<(), RouteError> {
        if payload.len() > SIZE {
            return Err(RouteError::PayloadTooLarge);
        }
        self.pool.with_slot(self.index, &mut |slot| {
            slot.data[..payload.len()].copy_from_slice(payload);
            slot.len = payload.len();
        });
        Ok(())
    }

    /// Calls `f` with the stored payload.
    ///
    /// `f` runs with the pool's slot lock held, so it must not acquire or
    /// release buffers of the same pool.
    pub fn with_payload(&self, mut f: impl FnMut(&[u8])) {
        self.pool.with_slot(self.index, &mut |slot| f(slot.payload()));
    }

    /// Copies the stored payload into `dst` and returns the number of bytes
    /// copied, which is less than [`len`](Self::len) if `dst` is shorter.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        self.with_payload(|payload| {
            copied = payload.len().min(dst.len());
            dst[..copied].copy_from_slice(&payload[..copied]);
        });
        copied
    }

    pub fn len(&self) -> usize {
        let mut len = 0;
        self.pool.with_slot(self.index, &mut |slot| len = slot.len);
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum payload size.
    pub const fn capacity(&self) -> usize {
        SIZE
    }

    /// Index of the pool slot this buffer occupies.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the buffer to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl<const SIZE: usize> Drop for EventBuffer<'_, SIZE> {
    fn drop(&mut self) {
        self.pool.release_slot(self.index);
    }
}

impl<const SIZE: usize> fmt::Debug for EventBuffer<'_, SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBuffer")
            .field("index", &self.index)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use std::thread;
    use std::vec::Vec;

    type Pool = EventBufferPool<CriticalSectionRawMutex, 3, 16>;

    #[test]
    fn acquires_up_to_capacity() {
        let pool = Pool::new();
        let held: Vec<_> = (0..3).map(|_| pool.acquire()).collect();
        assert!(held.iter().all(Option::is_some));
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn release_frees_exactly_one_slot() {
        let pool = Pool::new();
        let mut held: Vec<_> = (0..3).filter_map(|_| pool.acquire()).collect();
        let released = held.remove(1);
        let index = released.index();
        pool.release(released);

        let again = pool.acquire().expect("one buffer was released");
        assert_eq!(again.index(), index);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn dropping_a_buffer_releases_it() {
        let pool = Pool::new();
        {
            let _a = pool.acquire().unwrap();
            let _b = pool.acquire().unwrap();
            assert_eq!(pool.available(), 1);
        }
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn first_free_slot_is_reused() {
        let pool = Pool::new();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        a.release();
        assert_eq!(pool.acquire().unwrap().index(), 0);
    }

    #[test]
    fn fill_copies_payload() {
        let pool = Pool::new();
        let mut buf = pool.acquire().unwrap();
        assert!(buf.is_empty());
        buf.fill(b"block").unwrap();
        buf.with_payload(|payload| assert_eq!(payload, b"block"));
        assert_eq!(buf.len(), 5);

        let mut short = [0u8; 3];
        assert_eq!(buf.read(&mut short), 3);
        assert_eq!(&short, b"blo");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let pool = Pool::new();
        let mut buf = pool.acquire().unwrap();
        buf.fill(b"ok").unwrap();
        assert_eq!(buf.fill(&[0u8; 17]), Err(RouteError::PayloadTooLarge));
        buf.with_payload(|payload| assert_eq!(payload, b"ok"));
        buf.fill(&[7u8; 16]).unwrap();
        assert_eq!(buf.len(), buf.capacity());
    }

    #[test]
    fn reacquired_buffer_starts_empty() {
        let pool = EventBufferPool::<CriticalSectionRawMutex, 1, 8>::new();
        let mut buf = pool.acquire().unwrap();
        buf.fill(b"stale").unwrap();
        drop(buf);
        assert!(pool.acquire().unwrap().is_empty());
    }

    #[test]
    fn pool_can_be_static() {
        static POOL: EventBufferPool<CriticalSectionRawMutex, 2, 4> = EventBufferPool::new();
        let buf = POOL.acquire().unwrap();
        assert_eq!(POOL.available(), 1);
        drop(buf);
        assert_eq!(POOL.available(), 2);
    }

    #[test]
    fn concurrent_owners_never_share_a_slot() {
        static POOL: EventBufferPool<CriticalSectionRawMutex, 3, 16> = EventBufferPool::new();

        thread::scope(|scope| {
            for worker in 0..6u8 {
                scope.spawn(move || {
                    for round in 0..500u16 {
                        let Some(mut buf) = POOL.acquire() else {
                            thread::yield_now();
                            continue;
                        };
                        let stamp = [worker; 16];
                        buf.fill(&stamp[..(round % 16) as usize + 1]).unwrap();
                        thread::yield_now();
                        buf.with_payload(|payload| {
                            assert_eq!(payload.len(), (round % 16) as usize + 1);
                            assert!(payload.iter().all(|byte| *byte == worker));
                        });
                    }
                });
            }
        });

        assert_eq!(POOL.available(), POOL.capacity());
    }
}
