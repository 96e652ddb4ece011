use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    thread::{self, Thread},
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
struct Shared {
    pending: AtomicBool,
    stamp_us: AtomicU64,
    overruns: AtomicU32,
    consumer: OnceLock<Thread>,
}

/// Producer half, safe to call from a timer callback. Never blocks, never
/// allocates.
#[derive(Debug, Clone)]
pub struct SampleTrigger {
    shared: Arc<Shared>,
}

/// Consumer half, owned by the polling thread.
#[derive(Debug)]
pub struct SampleWaiter {
    shared: Arc<Shared>,
}

pub fn sample_channel() -> (SampleTrigger, SampleWaiter) {
    let shared = Arc::new(Shared::default());
    (
        SampleTrigger {
            shared: shared.clone(),
        },
        SampleWaiter { shared },
    )
}

impl SampleTrigger {
    pub fn fire(&self, now_us: u64) {
        self.shared.stamp_us.store(now_us, Ordering::Release);
        if self.shared.pending.swap(true, Ordering::AcqRel) {
            self.shared.overruns.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(consumer) = self.shared.consumer.get() {
            consumer.unpark();
        }
    }
}

impl SampleWaiter {
    /// Parks until the trigger fires or `timeout` elapses. Returns the
    /// timestamp of the latest trigger.
    pub fn wait(&self, timeout: Duration) -> Option<u64> {
        self.shared.consumer.get_or_init(thread::current);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(stamp) = self.take() {
                return Some(stamp);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            // park may wake spuriously
            thread::park_timeout(deadline - now);
        }
    }

    fn take(&self) -> Option<u64> {
        self.shared
            .pending
            .swap(false, Ordering::AcqRel)
            .then(|| self.shared.stamp_us.load(Ordering::Acquire))
    }

    /// Triggers that fired while a previous one was still pending.
    pub fn overruns(&self) -> u32 {
        self.shared.overruns.load(Ordering::Relaxed)
    }
}
