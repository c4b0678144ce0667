//! Message Pool
//!
//! A fixed arena of preallocated message buffers. Callers hold a
//! [`MessageHandle`] (an index into the arena) from `allocate` until the
//! matching `release`; the pool is the single source of truth for how many
//! messages are outstanding.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::database::state::PoolStats;
use crate::messaging::Completion;
use crate::replication::protocol::{MessageHeader, MessageKind};

/// Reference to an allocated pool message. Deliberately not `Clone`: each
/// allocation is released exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct MessageHandle(u32);

impl MessageHandle {
    pub fn index(&self) -> u32 {
        self.0
    }

    /// Recover a handle from the correlation value a transport echoed back
    pub(crate) fn from_raw(index: u32) -> Self {
        Self(index)
    }
}

/// Where an allocation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOrigin {
    /// Holding a message this node sends
    Outbound(MessageKind),
    /// Holding a copy of a received message
    Inbound,
}

/// Storage behind one handle
struct Slot {
    origin: Option<SlotOrigin>,
    header: MessageHeader,
    /// Preallocated at the largest message size
    body: Vec<u8>,
    completion: Option<Completion>,
}

struct FreeList {
    free: VecDeque<u32>,
    outstanding: Vec<bool>,
}

/// Fixed-capacity pool of message buffers
pub struct MessagePool {
    slots: Vec<Mutex<Slot>>,
    lists: Mutex<FreeList>,
    outstanding: AtomicUsize,
    high_water: AtomicUsize,
    allocation_failures: AtomicU64,
    buffer_size: usize,
}

impl MessagePool {
    /// Create a pool of `capacity` buffers of `buffer_size` bytes each
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(Slot {
                    origin: None,
                    header: MessageHeader { kind: 0, declared_size: 0 },
                    body: Vec::with_capacity(buffer_size),
                    completion: None,
                })
            })
            .collect();
        Self {
            slots,
            lists: Mutex::new(FreeList {
                free: (0..capacity as u32).collect(),
                outstanding: vec![false; capacity],
            }),
            outstanding: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            allocation_failures: AtomicU64::new(0),
            buffer_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Size of every message buffer
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            outstanding: self.outstanding(),
            high_water: self.high_water.load(Ordering::SeqCst),
            allocation_failures: self.allocation_failures.load(Ordering::SeqCst),
        }
    }

    /// Take a free message. Never blocks; `None` when the pool is empty.
    pub fn allocate(&self) -> Option<MessageHandle> {
        let mut lists = self.lists.lock();
        let Some(index) = lists.free.pop_front() else {
            self.allocation_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        lists.outstanding[index as usize] = true;
        let outstanding = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(outstanding, Ordering::SeqCst);
        Some(MessageHandle(index))
    }

    /// Return a message to the free list
    pub fn release(&self, handle: MessageHandle) {
        let index = handle.0 as usize;
        if let Some(slot) = self.slots.get(index) {
            let mut slot = slot.lock();
            slot.origin = None;
            slot.completion = None;
            slot.body.clear();
        }
        let mut lists = self.lists.lock();
        match lists.outstanding.get_mut(index) {
            Some(flag) if *flag => {
                *flag = false;
                lists.free.push_back(handle.0);
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
            }
            _ => tracing::error!("Release of message {} that is not outstanding", index),
        }
    }

    /// Record an outbound message and the completion to run when its send
    /// resolves
    pub fn prepare_outbound(&self, handle: &MessageHandle, kind: MessageKind, completion: Completion) {
        if let Some(slot) = self.slots.get(handle.0 as usize) {
            let mut slot = slot.lock();
            slot.origin = Some(SlotOrigin::Outbound(kind));
            slot.completion = Some(completion);
        }
    }

    /// Detach the completion of an outbound message
    pub fn take_completion(&self, handle: &MessageHandle) -> Option<(MessageKind, Completion)> {
        let slot = self.slots.get(handle.0 as usize)?;
        let mut slot = slot.lock();
        match slot.origin {
            Some(SlotOrigin::Outbound(kind)) => slot.completion.take().map(|c| (kind, c)),
            _ => None,
        }
    }

    /// Copy a received body into the message.
    ///
    /// The buffer is zeroed to `local_size` and at most `local_size` bytes of
    /// `body` are copied, never more than the sender declared. Returns the
    /// number of bytes copied.
    pub fn store_inbound(
        &self,
        handle: &MessageHandle,
        header: MessageHeader,
        body: &[u8],
        local_size: usize,
    ) -> usize {
        let Some(slot) = self.slots.get(handle.0 as usize) else {
            return 0;
        };
        let local_size = local_size.min(self.buffer_size);
        let copy = (header.declared_size as usize).min(local_size).min(body.len());
        let mut slot = slot.lock();
        slot.origin = Some(SlotOrigin::Inbound);
        slot.header = header;
        slot.body.clear();
        slot.body.resize(local_size, 0);
        slot.body[..copy].copy_from_slice(&body[..copy]);
        copy
    }

    /// Read a received message in place
    pub fn with_inbound<R>(&self, handle: &MessageHandle, f: impl FnOnce(&MessageHeader, &[u8]) -> R) -> Option<R> {
        let slot = self.slots.get(handle.0 as usize)?;
        let slot = slot.lock();
        match slot.origin {
            Some(SlotOrigin::Inbound) => Some(f(&slot.header, &slot.body)),
            _ => None,
        }
    }

    /// Wait for outstanding messages to come back. Returns `false` and logs
    /// a possible leak if the timeout elapses first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let outstanding = self.outstanding();
            if outstanding == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "{} messages still outstanding after {:?}, possible leak",
                    outstanding,
                    timeout
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_allocate_until_empty() {
        let pool = MessagePool::new(3, 64);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());
        assert_eq!(pool.outstanding(), 3);
        assert_eq!(pool.stats().allocation_failures, 1);

        pool.release(b);
        let d = pool.allocate().unwrap();
        assert_eq!(pool.outstanding(), 3);
        for handle in [a, c, d] {
            pool.release(handle);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.stats().high_water, 3);
    }

    #[test]
    fn test_random_sequences_conserve_messages() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let capacity = rng.gen_range(1..32);
            let pool = MessagePool::new(capacity, 16);
            let mut held = Vec::new();
            let (mut allocations, mut releases) = (0usize, 0usize);

            for _ in 0..500 {
                if rng.gen_bool(0.55) {
                    match pool.allocate() {
                        Some(handle) => {
                            assert!(!held.iter().any(|h: &MessageHandle| h.index() == handle.index()));
                            held.push(handle);
                            allocations += 1;
                        }
                        None => assert_eq!(held.len(), capacity),
                    }
                } else if !held.is_empty() {
                    let index = rng.gen_range(0..held.len());
                    pool.release(held.swap_remove(index));
                    releases += 1;
                }
                assert_eq!(pool.outstanding(), allocations - releases);
                assert!(pool.outstanding() <= capacity);
            }
        }
    }

    #[test]
    fn test_inbound_copy_is_bounded_by_local_size() {
        let pool = MessagePool::new(1, 1024);
        let handle = pool.allocate().unwrap();
        let body = vec![0xAB; 600];
        let header = MessageHeader { kind: 0x0002, declared_size: 600 };

        let copied = pool.store_inbound(&handle, header, &body, 400);
        assert_eq!(copied, 400);
        let len = pool.with_inbound(&handle, |h, b| {
            assert_eq!(h.declared_size, 600);
            b.len()
        });
        assert_eq!(len, Some(400));

        // A short declaration leaves the rest of the buffer zeroed
        let header = MessageHeader { kind: 0x0002, declared_size: 10 };
        assert_eq!(pool.store_inbound(&handle, header, &body, 400), 10);
        pool.with_inbound(&handle, |_, b| {
            assert!(b[..10].iter().all(|x| *x == 0xAB));
            assert!(b[10..].iter().all(|x| *x == 0));
        });
        pool.release(handle);
    }

    #[tokio::test]
    async fn test_drain_waits_for_release() {
        let pool = std::sync::Arc::new(MessagePool::new(2, 16));
        let handle = pool.allocate().unwrap();
        assert!(!pool.drain(Duration::from_millis(30)).await);

        let releaser = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.release(handle);
        });
        assert!(pool.drain(Duration::from_secs(2)).await);
    }
}
