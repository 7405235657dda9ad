use std::time::Instant;

use super::request::UpdateRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRetry {
    pub request: UpdateRequest,
    /// Preflight attempts made so far for this request.
    pub attempt_count: u32,
    pub next_attempt: Instant,
}

/// Holds at most one deferred request. Storing replaces whatever was there.
#[derive(Debug, Default)]
pub struct RetrySlot {
    slot: Option<PendingRetry>,
}

impl RetrySlot {
    /// Returns the retry that was displaced, if any.
    pub fn store(&mut self, retry: PendingRetry) -> Option<PendingRetry> {
        self.slot.replace(retry)
    }

    pub fn clear(&mut self) -> Option<PendingRetry> {
        self.slot.take()
    }

    pub fn peek(&self) -> Option<&PendingRetry> {
        self.slot.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.slot.as_ref().map(|retry| retry.next_attempt)
    }

    pub fn take_due(&mut self, now: Instant) -> Option<PendingRetry> {
        if self.deadline()? <= now {
            self.slot.take()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::firmware::digest::ChecksumAlgorithm;
    use crate::firmware::request::Delivery;

    fn retry(version: &str, at: Instant) -> PendingRetry {
        PendingRetry {
            request: UpdateRequest {
                title: "sensor-node".into(),
                version: version.into(),
                size: 1,
                checksum: "00".into(),
                algorithm: ChecksumAlgorithm::Unrecognized("none".into()),
                delivery: Delivery::Lookup,
            },
            attempt_count: 1,
            next_attempt: at,
        }
    }

    #[test]
    fn newer_retry_overwrites_older() {
        let now = Instant::now();
        let mut slot = RetrySlot::default();
        assert!(slot.store(retry("1.0.1", now)).is_none());
        let displaced = slot.store(retry("1.0.2", now)).unwrap();
        assert_eq!(displaced.request.version, "1.0.1");
        assert_eq!(slot.peek().unwrap().request.version, "1.0.2");
    }

    #[test]
    fn take_due_waits_for_deadline() {
        let now = Instant::now();
        let mut slot = RetrySlot::default();
        slot.store(retry("1.0.1", now + Duration::from_secs(60)));
        assert!(slot.take_due(now).is_none());
        assert!(slot.peek().is_some());
        assert!(slot.take_due(now + Duration::from_secs(60)).is_some());
        assert!(slot.peek().is_none());
        assert!(slot.take_due(now + Duration::from_secs(120)).is_none());
    }
}
