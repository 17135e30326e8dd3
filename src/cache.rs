//! Single-slot holder of a camera's latest processed frame.
//!
//! One writer (the camera's worker) replaces the whole entry; any number of readers take
//! an `Arc` snapshot. Nothing is queued: a slow reader skips intermediate frames.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Immutable view of one processed frame and the counts that went with it.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameCacheEntry {
    pub encoded_frame: Vec<u8>,
    pub current_count: u32,
    pub total_unique: u32,
    pub updated_at: Instant,
    /// Increments on every write; lets readers tell a new frame from a re-read.
    pub seq: u64,
}

#[derive(Default)]
struct Slot {
    entry: Option<Arc<FrameCacheEntry>>,
    next_seq: u64,
}

#[derive(Default)]
pub struct FrameCache {
    slot: Mutex<Slot>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry. Returns the sequence number assigned to it.
    pub fn publish(&self, encoded_frame: Vec<u8>, current_count: u32, total_unique: u32) -> Result<u64> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| anyhow!("frame cache lock poisoned"))?;
        slot.next_seq += 1;
        let seq = slot.next_seq;
        slot.entry = Some(Arc::new(FrameCacheEntry {
            encoded_frame,
            current_count,
            total_unique,
            updated_at: Instant::now(),
            seq,
        }));
        Ok(seq)
    }

    pub fn latest(&self) -> Result<Option<Arc<FrameCacheEntry>>> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| anyhow!("frame cache lock poisoned"))?;
        Ok(slot.entry.clone())
    }

    /// Drop the entry. Readers holding a snapshot keep it alive until they let go.
    pub fn clear(&self) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| anyhow!("frame cache lock poisoned"))?;
        slot.entry = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn read_after_write_returns_that_write() -> Result<()> {
        let cache = FrameCache::new();
        assert!(cache.latest()?.is_none());

        let seq = cache.publish(vec![1, 2, 3], 2, 5)?;
        let entry = cache.latest()?.ok_or_else(|| anyhow!("missing entry"))?;
        assert_eq!(entry.encoded_frame, vec![1, 2, 3]);
        assert_eq!((entry.current_count, entry.total_unique, entry.seq), (2, 5, seq));

        cache.publish(vec![4], 1, 6)?;
        // The earlier snapshot is unaffected by the overwrite.
        assert_eq!(entry.encoded_frame, vec![1, 2, 3]);
        assert_eq!(cache.latest()?.map(|e| e.seq), Some(seq + 1));
        Ok(())
    }

    #[test]
    fn clear_removes_entry() -> Result<()> {
        let cache = FrameCache::new();
        cache.publish(vec![9], 0, 0)?;
        cache.clear()?;
        assert!(cache.latest()?.is_none());
        Ok(())
    }

    #[test]
    fn concurrent_readers_never_see_torn_entries() {
        let cache = Arc::new(FrameCache::new());
        let writer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for n in 0..500u32 {
                    let byte = (n % 251) as u8;
                    cache.publish(vec![byte; 64], n, n).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(entry) = cache.latest().unwrap() {
                            let byte = (entry.current_count % 251) as u8;
                            assert!(entry.encoded_frame.iter().all(|b| *b == byte));
                            assert_eq!(entry.current_count, entry.total_unique);
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
