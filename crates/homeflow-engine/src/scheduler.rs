/*!
 * Timer scheduling.
 *
 * Every delay, trigger, idle, guard, sync and calendar timer in the
 * process is driven by one worker task holding a binary-heap timer queue.
 * Timers are addressed by [`TimerKey`]; arming a key again replaces the
 * pending fire for that key.
 */
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, trace};

use crate::error::{Error, Result};

/// A callback run on the scheduler task
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Identity of one timer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey(u64);

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

enum Request {
    Arm {
        key: TimerKey,
        deadline: Instant,
        period: Option<Duration>,
        callback: TimerCallback,
    },
    Cancel(TimerKey),
    Shutdown,
}

struct Entry {
    seq: u64,
    period: Option<Duration>,
    callback: TimerCallback,
}

/// Handle to the shared timer worker
#[derive(Clone)]
pub struct Scheduler {
    requests: mpsc::UnboundedSender<Request>,
    next_key: Arc<AtomicU64>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .finish()
    }
}

impl Scheduler {
    /// Start the worker on the current tokio runtime
    pub fn start() -> Self {
        let (requests, inbox) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(inbox));
        debug!("Timer scheduler started");
        Self {
            requests,
            next_key: Arc::new(AtomicU64::new(1)),
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Allocate a fresh timer key
    pub fn key(&self) -> TimerKey {
        TimerKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    /// Fire `callback` once after `after`, replacing whatever `key` had pending
    pub fn arm(&self, key: TimerKey, after: Duration, callback: TimerCallback) -> Result<()> {
        self.submit(Request::Arm {
            key,
            deadline: Instant::now() + after,
            period: None,
            callback,
        })
    }

    /// Fire `callback` every `period`, first after one period
    pub fn arm_periodic(&self, key: TimerKey, period: Duration, callback: TimerCallback) -> Result<()> {
        if period.is_zero() {
            return Err(Error::scheduler("Periodic timer needs a non-zero period"));
        }
        self.submit(Request::Arm {
            key,
            deadline: Instant::now() + period,
            period: Some(period),
            callback,
        })
    }

    /// Drop whatever `key` has pending
    pub fn cancel(&self, key: TimerKey) {
        let _ = self.requests.send(Request::Cancel(key));
    }

    /// Stop the worker; pending timers never fire
    pub fn shutdown(&self) {
        if self.requests.send(Request::Shutdown).is_ok() {
            debug!("Timer scheduler stopping");
        }
    }

    /// Whether the worker is still accepting timers
    pub fn is_running(&self) -> bool {
        !self.requests.is_closed()
            && self
                .task
                .lock()
                .map(|task| task.as_ref().map_or(false, |t| !t.is_finished()))
                .unwrap_or(false)
    }

    fn submit(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| Error::scheduler("Timer scheduler has stopped"))
    }
}

async fn run(mut inbox: mpsc::UnboundedReceiver<Request>) {
    let mut queue: BinaryHeap<Reverse<(Instant, u64, TimerKey)>> = BinaryHeap::new();
    let mut live: HashMap<TimerKey, Entry> = HashMap::new();
    let mut seq: u64 = 0;

    loop {
        let next = queue.peek().map(|Reverse((at, _, _))| *at);

        tokio::select! {
            request = inbox.recv() => match request {
                Some(Request::Arm { key, deadline, period, callback }) => {
                    seq += 1;
                    live.insert(key, Entry { seq, period, callback });
                    queue.push(Reverse((deadline, seq, key)));
                }
                Some(Request::Cancel(key)) => {
                    live.remove(&key);
                }
                Some(Request::Shutdown) | None => break,
            },
            _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                let now = Instant::now();
                while let Some(Reverse((at, entry_seq, key))) = queue.peek().copied() {
                    if at > now {
                        break;
                    }
                    queue.pop();

                    // Superseded or cancelled entries stay in the heap until they surface
                    let callback = match live.get_mut(&key) {
                        Some(entry) if entry.seq == entry_seq => {
                            let callback = entry.callback.clone();
                            match entry.period {
                                Some(period) => {
                                    seq += 1;
                                    entry.seq = seq;
                                    queue.push(Reverse((at + period, seq, key)));
                                }
                                None => {
                                    live.remove(&key);
                                }
                            }
                            callback
                        }
                        _ => continue,
                    };

                    trace!(timer = %key, "Timer fired");
                    if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                        error!(timer = %key, "Timer callback panicked");
                    }
                }
            }
        }
    }

    debug!(pending = live.len(), "Timer scheduler stopped");
}

/// Shared state of a one-shot timer.
///
/// The generation is bumped on every arm and stop, and a fire only runs
/// the callback when its generation is still current. Cancellation is
/// therefore effective as soon as `stop` returns, even if the worker has
/// already dequeued the entry.
#[derive(Debug, Default)]
struct DelayState {
    generation: AtomicU64,
    deadline: Mutex<Option<Instant>>,
}

/// A timer that fires once unless stopped or re-armed first
pub struct OneShotDelay {
    scheduler: Scheduler,
    key: TimerKey,
    state: Arc<DelayState>,
}

impl fmt::Debug for OneShotDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneShotDelay")
            .field("key", &self.key)
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl OneShotDelay {
    /// Create an idle timer
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
            key: scheduler.key(),
            state: Arc::new(DelayState::default()),
        }
    }

    /// Fire `callback` after `after`, replacing any pending fire
    pub fn arm<F>(&self, after: Duration, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut deadline) = self.state.deadline.lock() {
            *deadline = Some(Instant::now() + after);
        }

        let state = self.state.clone();
        let fire: TimerCallback = Arc::new(move || {
            {
                let Ok(mut deadline) = state.deadline.lock() else {
                    return;
                };
                if state.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                *deadline = None;
            }
            callback();
        });

        if let Err(e) = self.scheduler.arm(self.key, after, fire) {
            debug!(timer = %self.key, "Cannot arm timer: {}", e);
            self.clear();
        }
    }

    /// Cancel the pending fire, if any
    pub fn stop(&self) {
        if self.clear() {
            self.scheduler.cancel(self.key);
        }
    }

    /// Whether a fire is pending
    pub fn is_pending(&self) -> bool {
        self.state
            .deadline
            .lock()
            .map(|deadline| deadline.is_some())
            .unwrap_or(false)
    }

    /// Time left before the pending fire
    pub fn remaining(&self) -> Option<Duration> {
        let deadline = self.state.deadline.lock().ok()?.as_ref().copied()?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    fn clear(&self) -> bool {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        self.state
            .deadline
            .lock()
            .map(|mut deadline| deadline.take().is_some())
            .unwrap_or(false)
    }
}

impl Drop for OneShotDelay {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A repeating timer
pub struct PeriodicTick {
    scheduler: Scheduler,
    key: TimerKey,
    period: Duration,
}

impl fmt::Debug for PeriodicTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTick")
            .field("key", &self.key)
            .field("period", &self.period)
            .finish()
    }
}

impl PeriodicTick {
    /// Start ticking every `period`
    pub fn start<F>(scheduler: &Scheduler, period: Duration, callback: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let key = scheduler.key();
        scheduler.arm_periodic(key, period, Arc::new(callback))?;
        Ok(Self {
            scheduler: scheduler.clone(),
            key,
            period,
        })
    }

    /// The tick period
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stop ticking
    pub fn stop(&self) {
        self.scheduler.cancel(self.key);
    }
}

impl Drop for PeriodicTick {
    fn drop(&mut self) {
        self.stop();
    }
}
