/*!
 * Utility functions and helpers for HomeFlow.
 *
 * Conversions shared by the configuration layers.
 */
use std::time::Duration;

/// Convert whole seconds, possibly fractional, to a Duration
///
/// Negative and non-finite values yield a zero duration.
pub fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}
