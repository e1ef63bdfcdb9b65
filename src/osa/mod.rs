//! OS abstraction: clock, sleeping, completions and the host claim gate.
//!
//! With the `std` feature these map onto `std::time` and `std::sync`.
//! Without it the platform registers an [`OsaPlatform`] through
//! [`osa_init`] and the blocking primitives spin on it.

mod completion;
mod sync;

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

pub use completion::{Completion, CompletionSender, completion};
pub use sync::Semaphore;

/// Clock and sleep services supplied by a `no_std` platform.
pub trait OsaPlatform: Send + Sync {
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

#[cfg(feature = "std")]
mod imp {
    use core::time::Duration;
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();

    pub fn now() -> Duration {
        START.get_or_init(Instant::now).elapsed()
    }

    pub fn sleep(duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(not(feature = "std"))]
mod imp {
    use core::time::Duration;
    use kspin::SpinNoIrq;

    use super::OsaPlatform;

    static PLATFORM: SpinNoIrq<Option<&'static dyn OsaPlatform>> = SpinNoIrq::new(None);

    pub fn install(platform: &'static dyn OsaPlatform) {
        *PLATFORM.lock() = Some(platform);
    }

    fn platform() -> Option<&'static dyn OsaPlatform> {
        *PLATFORM.lock()
    }

    pub fn now() -> Duration {
        platform().map_or(Duration::ZERO, |p| p.now())
    }

    pub fn sleep(duration: Duration) {
        match platform() {
            Some(p) => p.sleep(duration),
            None => {
                for _ in 0..duration.as_micros().min(u32::MAX as u128) * 100 {
                    core::hint::spin_loop();
                }
            }
        }
    }
}

/// Registers the platform clock. Must run before any queue or host is used.
#[cfg(not(feature = "std"))]
pub fn osa_init(platform: &'static dyn OsaPlatform) {
    imp::install(platform);
}

/// Monotonic time since the first call.
pub fn now() -> Duration {
    imp::now()
}

pub fn osa_sleep(duration: Duration) {
    imp::sleep(duration);
}

pub fn msleep(ms: u64) {
    osa_sleep(Duration::from_millis(ms));
}

/// Sleeps for a random duration in `[min_us, max_us]`.
pub fn usleep_range(min_us: u64, max_us: u64) {
    osa_sleep(Duration::from_micros(jitter(min_us, max_us)));
}

static JITTER_SEED: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

/// Cheap xorshift draw in `[min, max]`.
pub fn jitter(min: u64, max: u64) -> u64 {
    if max <= min {
        return min;
    }
    let mut x = JITTER_SEED.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    JITTER_SEED.store(x, Ordering::Relaxed);
    min + x % (max - min + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..1000 {
            let v = jitter(1000, 5000);
            assert!((1000..=5000).contains(&v));
        }
        assert_eq!(jitter(7, 7), 7);
    }

    #[test]
    fn clock_is_monotonic() {
        let a = now();
        msleep(2);
        assert!(now() >= a + Duration::from_millis(2));
    }
}
