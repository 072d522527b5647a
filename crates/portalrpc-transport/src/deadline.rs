//! Deadlines for blocking waits.
//!
//! Deadlines use the tokio clock so paused-time tests can drive them.

use std::time::Duration;

use tokio::time::Instant;

/// Absolute point in time after which a wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Creates a new deadline from now + timeout.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    /// Builds a deadline from an optional timeout in milliseconds.
    pub fn from_millis(timeout_ms: Option<u64>) -> Option<Self> {
        timeout_ms.map(|ms| Self::after(Duration::from_millis(ms)))
    }

    /// Returns the remaining time, or `None` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        if self.at > now {
            Some(self.at - now)
        } else {
            None
        }
    }

    /// Returns `true` if the deadline has expired.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// The timeout this deadline was created with, in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    /// Suspends until the deadline passes.
    pub async fn elapsed(self) {
        tokio::time::sleep_until(self.at).await;
    }
}

/// Suspends until `deadline` passes, or forever without one.
pub async fn expire(deadline: Option<Deadline>) {
    match deadline {
        Some(d) => d.elapsed().await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_new() {
        let deadline = Deadline::after(Duration::from_secs(5));
        assert!(!deadline.is_expired());
        assert!(deadline.remaining().unwrap() > Duration::from_secs(4));
        assert_eq!(deadline.timeout_ms(), 5000);
    }

    #[tokio::test]
    async fn test_deadline_zero_is_expired() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_elapses_with_clock() {
        let deadline = Deadline::after(Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(!deadline.is_expired());
        deadline.elapsed().await;
        assert!(deadline.is_expired());
    }

    #[test]
    fn test_from_millis_none() {
        assert!(Deadline::from_millis(None).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_without_deadline_never_fires() {
        let res = tokio::time::timeout(Duration::from_secs(60), expire(None)).await;
        assert!(res.is_err());
    }
}
