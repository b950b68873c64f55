//! Microsecond dwell timing.
//!
//! Pixel dwells are tens of microseconds, below what `thread::sleep` can hit
//! reliably on a desktop scheduler, so the raster driver spins on the
//! monotonic clock instead. A spinning dwell keeps one core at 100% for the
//! whole scan.

use std::time::{Duration, Instant};

/// Convert a (possibly fractional) microsecond count to a `Duration`.
/// Negative and NaN values become zero.
pub fn micros(us: f64) -> Duration {
    if us.is_nan() || us <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((us * 1000.0).round() as u64)
}

/// Busy-wait until `duration` has elapsed since `start`.
///
/// Returns the time actually elapsed, which is never shorter than `duration`.
pub fn spin_until(start: Instant, duration: Duration) -> Duration {
    loop {
        let elapsed = start.elapsed();
        if elapsed >= duration {
            return elapsed;
        }
        std::hint::spin_loop();
    }
}

/// Busy-wait for `duration` starting now
pub fn spin_wait(duration: Duration) -> Duration {
    spin_until(Instant::now(), duration)
}
