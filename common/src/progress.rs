//! Byte-level progress accounting with throttled percent emission.

/// Tracks processed bytes against a fixed total and decides when the integer
/// percentage has advanced enough to be worth reporting.
///
/// The counter is mutex-guarded; the lock is held only across the arithmetic
/// and the emission decision so workers crediting bytes never serialize on
/// anything slower than that.
pub struct ProgressTracker {
    total_bytes: u64,
    inner: std::sync::Mutex<Inner>,
}

struct Inner {
    processed_bytes: u64,
    last_percent: Option<u8>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            inner: std::sync::Mutex::new(Inner {
                processed_bytes: 0,
                last_percent: None,
            }),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn processed_bytes(&self) -> u64 {
        self.inner.lock().unwrap().processed_bytes
    }

    /// Credit `bytes` as processed. Returns the new integer percentage when it
    /// strictly advanced past the last emitted value, `None` otherwise.
    pub fn credit(&self, bytes: u64) -> Option<u8> {
        let mut inner = self.inner.lock().unwrap();
        inner.processed_bytes = inner.processed_bytes.saturating_add(bytes);
        let percent = if self.total_bytes == 0 {
            100
        } else {
            std::cmp::min(
                100,
                (inner.processed_bytes.saturating_mul(100) / self.total_bytes) as u8,
            )
        };
        if inner.last_percent.map_or(true, |last| percent > last) {
            inner.last_percent = Some(percent);
            Some(percent)
        } else {
            None
        }
    }
}
