// Periodic compaction of channel buffers
//
// Fixed-length ring buffers never outgrow their capacity, so on the default
// registry this pass only confirms the bound. It still runs for any
// `CompactableBuffer` whose storage can grow.

use crate::buffer::{BufferRegistry, CompactableBuffer};
use crate::ingest::IngestionStager;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// False when the interval had not elapsed yet
    pub ran: bool,
    /// Channels (or buffer indices) that were compacted
    pub compacted: Vec<String>,
}

pub struct BufferMaintainer {
    interval: Duration,
    slack: f64,
    last_run: Mutex<Option<Instant>>,
}

impl BufferMaintainer {
    pub fn new(interval: Duration, slack: f64) -> Self {
        Self {
            interval,
            slack: slack.max(1.0),
            last_run: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Largest storage length tolerated for a buffer of `capacity`
    pub fn limit_for(&self, capacity: usize) -> usize {
        (capacity as f64 * self.slack).floor() as usize
    }

    /// Claim the current run slot if the interval has elapsed
    fn due(&self, now: Instant) -> bool {
        let mut last_run = self.last_run.lock();
        let due = match *last_run {
            Some(previous) => now.saturating_duration_since(previous) >= self.interval,
            None => true,
        };
        if due {
            *last_run = Some(now);
        }
        due
    }

    /// Compact every registry channel whose storage exceeds the limit
    pub fn maintain(&self, registry: &BufferRegistry, now: Instant) -> MaintenanceReport {
        if !self.due(now) {
            return MaintenanceReport::default();
        }

        let mut compacted = Vec::new();
        registry.for_each_mut(|name, buffer| {
            if self.compact_if_oversized(buffer) {
                compacted.push(name.to_string());
            }
        });

        if !compacted.is_empty() {
            log::info!("Compacted {} channel buffer(s): {:?}", compacted.len(), compacted);
        }
        MaintenanceReport {
            ran: true,
            compacted,
        }
    }

    /// Same pass over arbitrary buffers; reported by index
    pub fn maintain_buffers(
        &self,
        buffers: &mut [&mut dyn CompactableBuffer],
        now: Instant,
    ) -> MaintenanceReport {
        if !self.due(now) {
            return MaintenanceReport::default();
        }

        let compacted = buffers
            .iter_mut()
            .enumerate()
            .filter_map(|(index, buffer)| {
                self.compact_if_oversized(&mut **buffer)
                    .then(|| index.to_string())
            })
            .collect();

        MaintenanceReport {
            ran: true,
            compacted,
        }
    }

    fn compact_if_oversized(&self, buffer: &mut dyn CompactableBuffer) -> bool {
        let limit = self.limit_for(buffer.capacity());
        if buffer.storage_len() <= limit {
            return false;
        }
        log::debug!(
            "Buffer storage {} exceeds limit {}, compacting to {}",
            buffer.storage_len(),
            limit,
            buffer.capacity()
        );
        buffer.compact();
        true
    }

    /// Zero-fill all buffers, drop staged data and restart the interval
    pub fn reset(&self, stager: &IngestionStager) {
        stager.clear();
        stager.registry().reset_all();
        *self.last_run.lock() = None;
        log::debug!("Reset channel buffers and pending queues");
    }
}
