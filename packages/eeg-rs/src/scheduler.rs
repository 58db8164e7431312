// Injected timer capability
//
// The stage machine never touches wall-clock timers directly. Production code
// uses `TokioScheduler`; tests and offline replays use `ManualScheduler`, whose
// clock only moves when `advance` is called.

use crate::error::{EegError, EegResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a scheduled timer for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// One-shot timer scheduling
///
/// Implementations must never run `task` synchronously from inside
/// `schedule_once`; callers may hold locks while scheduling.
pub trait Scheduler: Send + Sync {
    fn schedule_once(&self, delay: Duration, task: TimerTask) -> TimerHandle;

    /// Cancel a pending timer; unknown or already fired handles are ignored
    fn cancel(&self, handle: TimerHandle);

    fn now(&self) -> Instant;
}

struct PendingTimer {
    id: u64,
    deadline: Duration,
    task: TimerTask,
}

struct ManualState {
    elapsed: Duration,
    next_id: u64,
    pending: Vec<PendingTimer>,
}

/// Deterministic scheduler driven by explicit clock advances
pub struct ManualScheduler {
    origin: Instant,
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(ManualState {
                elapsed: Duration::ZERO,
                next_id: 1,
                pending: Vec::new(),
            }),
        }
    }

    /// Move the clock forward, firing every timer that falls due
    ///
    /// Timers fire in deadline order with the clock set to their deadline.
    /// Timers scheduled by a firing task run in the same call if they fall
    /// due before the target time. Returns the number of timers fired.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().elapsed + by;
        let mut fired = 0;

        loop {
            let due = {
                let mut state = self.state.lock();
                let next = state
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, timer)| timer.deadline <= target)
                    .min_by_key(|(_, timer)| (timer.deadline, timer.id))
                    .map(|(index, _)| index);

                match next {
                    Some(index) => {
                        let timer = state.pending.remove(index);
                        state.elapsed = state.elapsed.max(timer.deadline);
                        Some(timer)
                    }
                    None => {
                        state.elapsed = target;
                        None
                    }
                }
            };

            // Run outside the lock so the task can schedule or cancel timers
            match due {
                Some(timer) => {
                    (timer.task)();
                    fired += 1;
                }
                None => break,
            }
        }

        fired
    }

    pub fn advance_ms(&self, ms: u64) -> usize {
        self.advance(Duration::from_millis(ms))
    }

    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let deadline = state.elapsed + delay;
        state.pending.push(PendingTimer { id, deadline, task });
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.state.lock().pending.retain(|timer| timer.id != handle.0);
    }

    fn now(&self) -> Instant {
        self.origin + self.state.lock().elapsed
    }
}

/// Scheduler backed by tokio sleep tasks
pub struct TokioScheduler {
    handle: Handle,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Use the runtime the caller is running on
    pub fn current() -> EegResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| EegError::InvalidConfig(format!("no tokio runtime: {}", e)))?;
        Ok(Self::new(handle))
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);

        // Hold the map while spawning so the task cannot finish and deregister
        // before it has been registered
        let mut registered = self.tasks.lock();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if tasks.lock().remove(&id).is_some() {
                task();
            }
        });
        registered.insert(id, join);

        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(join) = self.tasks.lock().remove(&handle.0) {
            join.abort();
        }
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, join) in self.tasks.lock().drain() {
            join.abort();
        }
    }
}
