use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use crate::config::FlowConfig;

/// Engagement snapshot the interval policy is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowState {
    /// Completed cycles so far.
    pub cycle_count: u32,
    pub last_interaction_at: Instant,
}

impl FlowState {
    pub fn new(now: Instant) -> Self {
        Self {
            cycle_count: 0,
            last_interaction_at: now,
        }
    }

    pub fn record_interaction(&mut self, now: Instant) {
        self.last_interaction_at = now;
    }

    pub fn complete_cycle(&mut self) {
        self.cycle_count = self.cycle_count.saturating_add(1);
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_interaction_at)
    }
}

/// How long to wait before the next cycle.
///
/// The first cycle always uses the warm-up interval. After that, a user who
/// interacted within the engagement window gets the engaged interval and
/// everyone else the idle one.
pub fn flow_interval(state: &FlowState, now: Instant, config: &FlowConfig) -> Duration {
    if state.cycle_count < 1 {
        return config.warmup();
    }
    if state.idle_for(now) <= config.engagement_window() {
        config.engaged()
    } else {
        config.idle()
    }
}

/// [`flow_interval`] with the default policy, in milliseconds.
pub fn flow_interval_ms(state: &FlowState, now: Instant) -> u64 {
    flow_interval(state, now, &FlowConfig::default()).as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// One-shot timers supplied by the host environment.
pub trait TimerProvider: Send + Sync {
    fn set_timeout(&self, delay: Duration, callback: TimerCallback) -> TimerId;

    /// Cancels `id`. Unknown or already fired ids are ignored.
    fn clear_timeout(&self, id: TimerId);
}

/// Owns at most one pending wake-up.
pub struct FlowScheduler {
    timers: Option<Arc<dyn TimerProvider>>,
    /// Outstanding timer. The timer empties it when it fires.
    pending: Arc<Mutex<Option<TimerId>>>,
    /// Generation of the armed timer, 0 when none is outstanding.
    armed: Arc<AtomicU64>,
    generation: u64,
}

impl FlowScheduler {
    /// `None` means there is no timing context and scheduling does nothing.
    pub fn new(timers: Option<Arc<dyn TimerProvider>>) -> Self {
        Self {
            timers,
            pending: Arc::new(Mutex::new(None)),
            armed: Arc::new(AtomicU64::new(0)),
            generation: 0,
        }
    }

    /// Cancels any pending wake-up, then arms one that runs `callback` after
    /// `delay()`. The delay is evaluated now.
    pub fn schedule<D, F>(&mut self, delay: D, callback: F) -> Option<TimerId>
    where
        D: FnOnce() -> Duration,
        F: FnOnce() + Send + 'static,
    {
        self.clear();
        let timers = self.timers.clone()?;

        self.generation += 1;
        let generation = self.generation;
        self.armed.store(generation, Ordering::SeqCst);

        let armed = self.armed.clone();
        let pending = self.pending.clone();
        let delay = delay();
        let id = timers.set_timeout(
            delay,
            Box::new(move || {
                let fired = {
                    let mut slot = lock(&pending);
                    let fired = armed
                        .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok();
                    if fired {
                        slot.take();
                    }
                    fired
                };
                if fired {
                    callback();
                }
            }),
        );

        // The provider may already have fired the timer, possibly on another
        // thread. Only record the id while it is still armed.
        {
            let mut slot = lock(&self.pending);
            if self.armed.load(Ordering::SeqCst) == generation {
                *slot = Some(id);
            }
        }
        tracing::debug!(delay_ms = delay.as_millis() as u64, "flow wake-up scheduled");
        Some(id)
    }

    /// Cancels the pending wake-up, if any.
    pub fn clear(&mut self) {
        let id = {
            let mut slot = lock(&self.pending);
            self.armed.store(0, Ordering::SeqCst);
            slot.take()
        };
        if let (Some(id), Some(timers)) = (id, &self.timers) {
            timers.clear_timeout(id);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.armed.load(Ordering::SeqCst) != 0
    }

    /// Id of the outstanding timer. `None` once it has fired or been cleared.
    pub fn pending_timer(&self) -> Option<TimerId> {
        *lock(&self.pending)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for FlowScheduler {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for FlowScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowScheduler")
            .field("has_timers", &self.timers.is_some())
            .field("pending", &self.pending_timer())
            .finish()
    }
}
