//! Read-query options and deadlines.

use crate::error::{Result, TrackerError};
use std::time::{Duration, Instant};

/// Options for read queries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Abort with [`TrackerError::Timeout`] once this much time has passed.
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub(crate) fn deadline(&self) -> Deadline {
        Deadline::after(self.timeout)
    }
}

/// A point in time past which a read gives up.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    at: Option<(Instant, Duration)>,
}

impl Deadline {
    pub(crate) fn none() -> Self {
        Self { at: None }
    }

    pub(crate) fn after(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|t| (Instant::now() + t, t)),
        }
    }

    /// Fail if the deadline has passed. Reads call this between rows.
    pub(crate) fn check(&self) -> Result<()> {
        match self.at {
            Some((at, timeout)) if Instant::now() >= at => Err(TrackerError::Timeout(timeout)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_deadline_never_expires() {
        assert!(Deadline::none().check().is_ok());
        assert!(QueryOptions::default().deadline().check().is_ok());
    }

    #[test]
    fn test_zero_timeout_expires_immediately() {
        let deadline = QueryOptions::with_timeout(Duration::ZERO).deadline();
        assert!(matches!(deadline.check(), Err(TrackerError::Timeout(_))));
    }

    #[test]
    fn test_generous_timeout_passes() {
        let deadline = QueryOptions::with_timeout(Duration::from_secs(60)).deadline();
        assert!(deadline.check().is_ok());
    }
}
