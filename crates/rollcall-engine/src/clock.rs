//! Time sources and cancellation for capture loops.

use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time for deadlines plus wall-clock time for record stamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn local_now(&self) -> DateTime<Local>;
    /// Block the calling thread; used to back off when no frame is ready.
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn local_now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Shared stop flag, checked between frames.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
fn test_wall_start() -> DateTime<Local> {
    use chrono::TimeZone;
    Local.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap()
}

/// Clock that advances by a fixed step on every `now()` call. Sleeping
/// does not move it.
#[cfg(test)]
pub(crate) struct StepClock {
    start: Instant,
    wall: DateTime<Local>,
    step: Duration,
    ticks: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl StepClock {
    pub(crate) fn new(step: Duration) -> Self {
        Self {
            start: Instant::now(),
            wall: test_wall_start(),
            step,
            ticks: std::sync::atomic::AtomicU32::new(0),
        }
    }

    fn elapsed(&self, ticks: u32) -> Duration {
        self.step * ticks
    }
}

#[cfg(test)]
impl Clock for StepClock {
    fn now(&self) -> Instant {
        let ticks = self.ticks.fetch_add(1, Ordering::SeqCst);
        self.start + self.elapsed(ticks)
    }

    fn local_now(&self) -> DateTime<Local> {
        let ticks = self.ticks.load(Ordering::SeqCst);
        let elapsed = chrono::Duration::from_std(self.elapsed(ticks)).unwrap();
        self.wall + elapsed
    }

    fn sleep(&self, _duration: Duration) {}
}

/// Clock that only moves when something sleeps on it.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct SleepClock {
    slept: std::sync::Mutex<Duration>,
    start: std::sync::OnceLock<Instant>,
}

#[cfg(test)]
impl SleepClock {
    fn elapsed(&self) -> Duration {
        *self.slept.lock().unwrap()
    }
}

#[cfg(test)]
impl Clock for SleepClock {
    fn now(&self) -> Instant {
        *self.start.get_or_init(Instant::now) + self.elapsed()
    }

    fn local_now(&self) -> DateTime<Local> {
        test_wall_start() + chrono::Duration::from_std(self.elapsed()).unwrap()
    }

    fn sleep(&self, duration: Duration) {
        *self.slept.lock().unwrap() += duration;
    }
}
