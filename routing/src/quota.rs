use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const UNKNOWN: u64 = u64::MAX;

/// What a backend knows about the calls it may still make
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub limit: Option<u64>,
    pub remaining: u64,
    /// When the provider refills the quota
    pub reset_at: Option<Instant>,
}

impl QuotaSnapshot {
    pub fn exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// Call quota shared by all workers using a backend. The counter is only changed with atomic
/// operations, the reset instant sits behind a mutex that is never held across an await.
#[derive(Debug)]
pub struct QuotaTracker {
    known: AtomicBool,
    limit: AtomicU64,
    remaining: AtomicU64,
    reset_at: Mutex<Option<Instant>>,
}

impl QuotaTracker {
    /// Nothing is known until the provider reports its quota
    pub fn unknown() -> Self {
        Self {
            known: AtomicBool::new(false),
            limit: AtomicU64::new(UNKNOWN),
            remaining: AtomicU64::new(UNKNOWN),
            reset_at: Mutex::new(None),
        }
    }

    /// A local quota of `limit` calls that is never refilled
    pub fn with_limit(limit: u64) -> Self {
        Self {
            known: AtomicBool::new(true),
            limit: AtomicU64::new(limit),
            remaining: AtomicU64::new(limit),
            reset_at: Mutex::new(None),
        }
    }

    /// Takes one call from the quota. Fails if the quota is known to be exhausted.
    pub fn try_acquire(&self) -> bool {
        if !self.known.load(Ordering::Acquire) {
            return true;
        }
        self.refill_if_reset();

        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                if remaining == UNKNOWN {
                    Some(remaining)
                } else {
                    remaining.checked_sub(1)
                }
            })
            .is_ok()
    }

    /// Records the quota reported by the provider with a response. Responses can arrive out of
    /// order, so within one window the counter only ever goes down.
    pub fn observe(&self, remaining: u64, limit: Option<u64>, reset_in: Option<Duration>) {
        let new_reset = reset_in.and_then(|reset_in| Instant::now().checked_add(reset_in));
        let new_window = {
            let mut reset_at = match self.reset_at.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Reset instants computed from relative seconds jitter a little
            let new_window = match (*reset_at, new_reset) {
                (Some(current), Some(new)) => new > current + Duration::from_secs(1),
                (None, Some(_)) => true,
                _ => false,
            };
            if new_window || reset_at.is_none() {
                *reset_at = new_reset.or(*reset_at);
            }
            new_window
        };

        if let Some(limit) = limit {
            self.limit.store(limit, Ordering::Release);
        }
        if new_window || !self.known.load(Ordering::Acquire) {
            self.remaining.store(remaining, Ordering::Release);
        } else {
            self.remaining.fetch_min(remaining, Ordering::AcqRel);
        }
        self.known.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> Option<QuotaSnapshot> {
        if !self.known.load(Ordering::Acquire) {
            return None;
        }
        self.refill_if_reset();

        let limit = self.limit.load(Ordering::Acquire);
        Some(QuotaSnapshot {
            limit: (limit != UNKNOWN).then_some(limit),
            remaining: self.remaining.load(Ordering::Acquire),
            reset_at: self.current_reset(),
        })
    }

    fn current_reset(&self) -> Option<Instant> {
        match self.reset_at.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn refill_if_reset(&self) {
        let Some(reset_at) = self.current_reset() else { return };
        if Instant::now() < reset_at {
            return;
        }
        let limit = self.limit.load(Ordering::Acquire);
        if limit == UNKNOWN {
            return;
        }

        let mut guard = match self.reset_at.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Only the first caller after the reset refills
        if *guard == Some(reset_at) {
            *guard = None;
            self.remaining.store(limit, Ordering::Release);
        }
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::unknown()
    }
}
