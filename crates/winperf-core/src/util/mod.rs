//! Unit conversions shared by collectors.

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const MS_PER_SEC: f64 = 1000.0;

/// Megabytes to bytes.
pub fn mb_to_bytes(mb: f64) -> f64 {
    mb * BYTES_PER_MB
}

/// Milliseconds to seconds.
pub fn ms_to_sec(ms: f64) -> f64 {
    ms / MS_PER_SEC
}

/// Divides a raw numerator by its divisor at read time.
///
/// Counters like "% Time in JIT" ship the numerator and the divisor as two
/// separate raw values. A zero divisor reads as `0.0`.
pub fn ratio(numerator: f64, divisor: f64) -> f64 {
    if divisor == 0.0 {
        0.0
    } else {
        numerator / divisor
    }
}
