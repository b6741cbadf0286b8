//! Wall-clock sources used to stamp call lifecycle milestones.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// A source of wall-clock time.
///
/// The server stamps every milestone of a call through this trait, which lets
/// tests substitute a deterministic clock for the system one.
///
/// # Example
///
/// ```
/// use grpc_echo_core::clock::Clock;
/// use std::time::{Duration, SystemTime, UNIX_EPOCH};
///
/// struct FixedTime;
/// impl Clock for FixedTime {
///     fn now(&self) -> SystemTime {
///         UNIX_EPOCH + Duration::from_secs(1234)
///     }
/// }
///
/// assert_eq!(FixedTime.now(), UNIX_EPOCH + Duration::from_secs(1234));
/// ```
pub trait Clock: Send + Sync + 'static {
    /// Returns the current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// The operating system's real-time clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that advances by a fixed step every time it is read.
///
/// Successive reads are strictly increasing, which makes ordering assertions
/// exact regardless of scheduler timing.
#[derive(Clone, Debug)]
pub struct SteppingClock {
    nanos: Arc<AtomicU64>,
    step: Duration,
}

impl SteppingClock {
    /// Creates a clock starting at `start` that advances by `step` per read.
    pub fn new(start: SystemTime, step: Duration) -> Self {
        let nanos = start
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self {
            nanos: Arc::new(AtomicU64::new(nanos)),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> SystemTime {
        let step = self.step.as_nanos() as u64;
        let nanos = self.nanos.fetch_add(step, Ordering::Relaxed);
        UNIX_EPOCH + Duration::from_nanos(nanos)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> SystemTime {
        (**self).now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stepping_clock_is_strictly_increasing() {
        let clock = SteppingClock::new(UNIX_EPOCH, Duration::from_millis(1));
        let a = clock.now();
        let b = clock.now();
        let c = clock.clone().now();
        assert_eq!(a, UNIX_EPOCH);
        assert_eq!(b - Duration::from_millis(1), a);
        assert!(c > b, "clones share the same counter");
    }

    #[test]
    fn system_clock_tracks_real_time() {
        let before = SystemTime::now();
        let observed = SystemClock.now();
        assert!(observed >= before);
    }
}
