/*!
 * Calendar timers.
 *
 * One shared one-second tick evaluates every registered [`CronTimer`]
 * against the wall clock. A timer fires at most once per matching second.
 * Each evaluation covers every second since the previous one, so a tick
 * drifting across a second boundary skips nothing; after a larger jump of
 * the clock only the current second is evaluated.
 */
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{NaiveDateTime, Timelike};
use tracing::{debug, trace};

use homeflow_core::time::{CronSpec, SharedClock};

use crate::error::{Error, Result};
use crate::scheduler::{PeriodicTick, Scheduler};

/// Longest gap, in seconds, that is replayed second by second
const MAX_CATCH_UP_SECS: i64 = 60;

struct CronEntry {
    spec: CronSpec,
    callback: Box<dyn Fn() + Send + Sync>,
    active: AtomicBool,
    last_fired: Mutex<Option<NaiveDateTime>>,
}

impl CronEntry {
    /// Fire if `now` matches and this second has not fired yet
    fn evaluate(&self, now: NaiveDateTime) -> bool {
        if !self.active.load(Ordering::SeqCst) || !self.spec.matches(&now) {
            return false;
        }
        {
            let Ok(mut last) = self.last_fired.lock() else {
                return false;
            };
            if *last == Some(now) {
                return false;
            }
            *last = Some(now);
        }
        (self.callback)();
        true
    }
}

/// A registered calendar timer; dropping it unregisters the timer
pub struct CronTimer {
    entry: Arc<CronEntry>,
}

impl fmt::Debug for CronTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronTimer")
            .field("spec", &self.entry.spec.to_string())
            .field("active", &self.is_active())
            .finish()
    }
}

impl CronTimer {
    /// The calendar specification
    pub fn spec(&self) -> &CronSpec {
        &self.entry.spec
    }

    /// Whether the timer can still fire
    pub fn is_active(&self) -> bool {
        self.entry.active.load(Ordering::SeqCst)
    }

    /// Stop the timer
    pub fn stop(&self) {
        self.entry.active.store(false, Ordering::SeqCst);
    }
}

struct TickerInner {
    scheduler: Scheduler,
    clock: SharedClock,
    entries: Mutex<Vec<Weak<CronEntry>>>,
    tick: Mutex<Option<PeriodicTick>>,
    last_evaluated: Mutex<Option<NaiveDateTime>>,
}

impl TickerInner {
    fn evaluate(&self) -> usize {
        let now = self.clock.now();
        let now = now.with_nanosecond(0).unwrap_or(now);
        let seconds = match self.last_evaluated.lock() {
            Ok(mut last) => {
                let seconds = pending_seconds(*last, now);
                *last = Some(now);
                seconds
            }
            Err(_) => vec![now],
        };

        let entries: Vec<Arc<CronEntry>> = match self.entries.lock() {
            Ok(mut entries) => {
                entries.retain(|entry| entry.strong_count() > 0);
                entries.iter().filter_map(Weak::upgrade).collect()
            }
            Err(_) => return 0,
        };

        let fired: usize = seconds
            .iter()
            .map(|&at| entries.iter().filter(|entry| entry.evaluate(at)).count())
            .sum();
        if fired > 0 {
            trace!(at = %now, fired, "Calendar timers fired");
        }
        fired
    }
}

/// The seconds to evaluate at `now`, given the last evaluated second
fn pending_seconds(last: Option<NaiveDateTime>, now: NaiveDateTime) -> Vec<NaiveDateTime> {
    let Some(last) = last else {
        return vec![now];
    };
    let gap = (now - last).num_seconds();
    if gap <= 1 || gap > MAX_CATCH_UP_SECS {
        return vec![now];
    }
    (1..=gap)
        .map(|offset| last + chrono::Duration::seconds(offset))
        .collect()
}

/// The shared one-second calendar tick
#[derive(Clone)]
pub struct CronTicker {
    inner: Arc<TickerInner>,
}

impl fmt::Debug for CronTicker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronTicker")
            .field("timers", &self.len())
            .finish()
    }
}

impl CronTicker {
    /// Create a ticker; the tick starts with the first registered timer
    pub fn new(scheduler: &Scheduler, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(TickerInner {
                scheduler: scheduler.clone(),
                clock,
                entries: Mutex::new(Vec::new()),
                tick: Mutex::new(None),
                last_evaluated: Mutex::new(None),
            }),
        }
    }

    /// Register a calendar timer
    pub fn add<F>(&self, spec: CronSpec, callback: F) -> Result<CronTimer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let entry = Arc::new(CronEntry {
            spec,
            callback: Box::new(callback),
            active: AtomicBool::new(true),
            last_fired: Mutex::new(None),
        });

        self.inner
            .entries
            .lock()
            .map_err(|_| Error::scheduler("Failed to acquire calendar timer list"))?
            .push(Arc::downgrade(&entry));
        self.ensure_ticking()?;

        debug!(spec = %entry.spec, "Calendar timer registered");
        Ok(CronTimer { entry })
    }

    fn ensure_ticking(&self) -> Result<()> {
        let mut tick = self
            .inner
            .tick
            .lock()
            .map_err(|_| Error::scheduler("Failed to acquire calendar tick"))?;
        if tick.is_none() {
            let inner = Arc::downgrade(&self.inner);
            *tick = Some(PeriodicTick::start(
                &self.inner.scheduler,
                Duration::from_secs(1),
                move || {
                    if let Some(inner) = inner.upgrade() {
                        inner.evaluate();
                    }
                },
            )?);
        }
        Ok(())
    }

    /// Evaluate every timer against the clock now; returns how many fired
    pub fn evaluate(&self) -> usize {
        self.inner.evaluate()
    }

    /// Number of registered timers still alive
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .map(|entries| entries.iter().filter(|e| e.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Whether no timer is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the shared tick
    pub fn stop(&self) {
        if let Ok(mut tick) = self.inner.tick.lock() {
            tick.take();
        }
    }
}
