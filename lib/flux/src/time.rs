use std::time::{Instant, SystemTime};

/// Returns the current unix timestamp in whole seconds (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Milliseconds elapsed between an earlier `Instant` and now. Used for signup-timeout and
/// idle bookkeeping where wall clock jumps shouldn't matter.
#[inline]
pub fn elapsed_millis(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
