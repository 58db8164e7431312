// Fixed-capacity per-channel sample buffers
//
// Each channel owns a zero-filled ring of f64 slots. The ingestion flush is the
// only writer; renderers and latest-value queries read through `ChannelReader`
// handles. Slots are guarded by a parking_lot RwLock so a reader never sees a
// half-applied write across the wrap boundary.

use crate::error::{EegError, EegResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Storage that the buffer maintainer can inspect and shrink back to capacity
pub trait CompactableBuffer {
    /// Length of the backing storage (may exceed `capacity` for growable
    /// implementations)
    fn storage_len(&self) -> usize;

    /// Nominal capacity
    fn capacity(&self) -> usize;

    /// Keep the most recent `capacity` entries in chronological order and
    /// restart the write position at 0
    fn compact(&mut self);
}

/// Circular buffer for one signal channel
#[derive(Debug, Clone)]
pub struct ChannelRingBuffer {
    slots: Vec<f64>,
    capacity: usize,
    write_index: usize,
    total_written: u64,
}

impl ChannelRingBuffer {
    pub fn new(capacity: usize) -> EegResult<Self> {
        if capacity == 0 {
            return Err(EegError::InvalidCapacity(capacity));
        }

        Ok(Self {
            slots: vec![0.0; capacity],
            capacity,
            write_index: 0,
            total_written: 0,
        })
    }

    /// Store a sample at the write index and advance with wrap-around
    pub fn write(&mut self, sample: f64) {
        self.slots[self.write_index] = sample;
        self.write_index = (self.write_index + 1) % self.capacity;
        self.total_written += 1;
    }

    pub fn write_all(&mut self, samples: &[f64]) {
        for &sample in samples {
            self.write(sample);
        }
    }

    /// Most recently written sample, 0.0 on an unwritten buffer
    pub fn latest(&self) -> f64 {
        self.slots[(self.write_index + self.capacity - 1) % self.capacity]
    }

    /// The `n` most recent samples, oldest first
    ///
    /// `n` is clamped to the capacity. The ring is pre-filled with zeros, so
    /// the result always has exactly `n` values with leading zeros until
    /// enough real data has arrived.
    pub fn window(&self, n: usize) -> Vec<f64> {
        let n = n.min(self.capacity);
        (0..n)
            .map(|i| self.slots[(self.write_index + self.capacity - n + i) % self.capacity])
            .collect()
    }

    /// Whole ring in chronological order
    pub fn snapshot(&self) -> Vec<f64> {
        self.window(self.capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    pub fn storage_len(&self) -> usize {
        self.slots.len()
    }

    /// Samples written since creation or the last reset
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Zero-fill and rewind
    pub fn reset(&mut self) {
        self.slots.clear();
        self.slots.resize(self.capacity, 0.0);
        self.write_index = 0;
        self.total_written = 0;
    }
}

impl CompactableBuffer for ChannelRingBuffer {
    fn storage_len(&self) -> usize {
        self.slots.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn compact(&mut self) {
        if self.slots.len() > self.capacity {
            let excess = self.slots.len() - self.capacity;
            self.slots.drain(..excess);
            self.write_index = 0;
        }
    }
}

/// Read-only view of a registered channel
#[derive(Clone)]
pub struct ChannelReader {
    name: String,
    buffer: Arc<RwLock<ChannelRingBuffer>>,
}

impl ChannelReader {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn latest(&self) -> f64 {
        self.buffer.read().latest()
    }

    pub fn window(&self, n: usize) -> Vec<f64> {
        self.buffer.read().window(n)
    }

    pub fn capacity(&self) -> usize {
        self.buffer.read().capacity()
    }

    pub fn write_index(&self) -> usize {
        self.buffer.read().write_index()
    }
}

struct ChannelSlot {
    name: String,
    buffer: Arc<RwLock<ChannelRingBuffer>>,
}

/// Per-channel statistics for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBufferStats {
    pub channel: String,
    pub capacity: usize,
    pub storage_len: usize,
    pub write_index: usize,
    pub total_written: u64,
    pub latest: f64,
}

/// Ring buffers keyed by channel name, in registration order
pub struct BufferRegistry {
    capacity: usize,
    display_window: usize,
    channels: RwLock<Vec<ChannelSlot>>,
}

impl BufferRegistry {
    pub fn new(capacity: usize, display_window: usize, channels: &[String]) -> EegResult<Self> {
        if capacity == 0 {
            return Err(EegError::InvalidCapacity(capacity));
        }

        let registry = Self {
            capacity,
            display_window: display_window.min(capacity),
            channels: RwLock::new(Vec::with_capacity(channels.len())),
        };
        for channel in channels {
            registry.register(channel)?;
        }
        Ok(registry)
    }

    /// Register a channel; an already registered channel is zero-filled
    pub fn register(&self, channel: &str) -> EegResult<()> {
        let mut channels = self.channels.write();
        if let Some(slot) = channels.iter().find(|slot| slot.name == channel) {
            slot.buffer.write().reset();
            return Ok(());
        }

        channels.push(ChannelSlot {
            name: channel.to_string(),
            buffer: Arc::new(RwLock::new(ChannelRingBuffer::new(self.capacity)?)),
        });
        log::debug!("Registered channel {} (capacity {})", channel, self.capacity);
        Ok(())
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.read().iter().any(|slot| slot.name == channel)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().iter().map(|slot| slot.name.clone()).collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn display_window_len(&self) -> usize {
        self.display_window
    }

    pub fn reader(&self, channel: &str) -> Option<ChannelReader> {
        self.channels
            .read()
            .iter()
            .find(|slot| slot.name == channel)
            .map(|slot| ChannelReader {
                name: slot.name.clone(),
                buffer: Arc::clone(&slot.buffer),
            })
    }

    pub fn latest(&self, channel: &str) -> Option<f64> {
        self.reader(channel).map(|reader| reader.latest())
    }

    pub fn window(&self, channel: &str, n: usize) -> Option<Vec<f64>> {
        self.reader(channel).map(|reader| reader.window(n))
    }

    /// Window sized for the chart (`display_window` samples)
    pub fn display_window(&self, channel: &str) -> Option<Vec<f64>> {
        self.window(channel, self.display_window)
    }

    pub fn latest_values(&self) -> BTreeMap<String, f64> {
        self.channels
            .read()
            .iter()
            .map(|slot| (slot.name.clone(), slot.buffer.read().latest()))
            .collect()
    }

    /// Append samples to a channel; returns false when the channel is unknown
    pub(crate) fn write_samples(&self, channel: &str, samples: &[f64]) -> bool {
        let channels = self.channels.read();
        match channels.iter().find(|slot| slot.name == channel) {
            Some(slot) => {
                slot.buffer.write().write_all(samples);
                true
            }
            None => false,
        }
    }

    /// Zero-fill every channel
    pub fn reset_all(&self) {
        for slot in self.channels.read().iter() {
            slot.buffer.write().reset();
        }
    }

    /// Run `f` against each buffer under its write lock
    pub(crate) fn for_each_mut<F>(&self, mut f: F)
    where
        F: FnMut(&str, &mut ChannelRingBuffer),
    {
        for slot in self.channels.read().iter() {
            f(&slot.name, &mut slot.buffer.write());
        }
    }

    pub fn stats(&self) -> Vec<ChannelBufferStats> {
        self.channels
            .read()
            .iter()
            .map(|slot| {
                let buffer = slot.buffer.read();
                ChannelBufferStats {
                    channel: slot.name.clone(),
                    capacity: buffer.capacity(),
                    storage_len: buffer.storage_len(),
                    write_index: buffer.write_index(),
                    total_written: buffer.total_written(),
                    latest: buffer.latest(),
                }
            })
            .collect()
    }
}
