use std::time::Duration;

/// Base delay for transient store failures.
pub const STORE_BACKOFF_BASE: Duration = Duration::from_millis(200);
/// Upper bound for transient store failures.
pub const STORE_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Exponential backoff that doubles from `base` up to `cap`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use ringwatch_common::backoff::Backoff;
///
/// let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(300));
/// assert_eq!(b.next_delay(), Duration::from_millis(100));
/// assert_eq!(b.next_delay(), Duration::from_millis(200));
/// assert_eq!(b.next_delay(), Duration::from_millis(300));
/// assert_eq!(b.next_delay(), Duration::from_millis(300));
/// b.reset();
/// assert_eq!(b.next_delay(), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base = base.min(cap);
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// Backoff for ConfigStore/TSDB transient errors.
    pub fn for_store() -> Self {
        Self::new(STORE_BACKOFF_BASE, STORE_BACKOFF_CAP)
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
