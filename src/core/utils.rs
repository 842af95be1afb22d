// src/core/utils.rs

//! Small helpers shared across the agent: random staggers for spreading
//! periodic work across a cluster, and log-safe text mangling.

use rand::Rng;
use std::time::Duration;

/// Returns a uniformly random duration in `[0, d)`. Zero stays zero.
pub fn random_stagger(d: Duration) -> Duration {
    if d.is_zero() {
        return Duration::ZERO;
    }
    let nanos = d.as_nanos() as u64;
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}

/// Returns `3d/4 + uniform(0, d/2)`: a jittered duration whose expected
/// value is `d`, bounded to `[0.75d, 1.25d)`.
pub fn random_stagger_quarter(d: Duration) -> Duration {
    d * 3 / 4 + random_stagger(d / 2)
}

/// Replaces newlines so multi-line child-process output fits one log record.
pub fn escape_newlines(s: &str) -> String {
    s.replace('\r', "\\r").replace('\n', "\\n")
}
