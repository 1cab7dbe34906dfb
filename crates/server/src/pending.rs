//! Pending-URB table (C3): tracks in-flight URBs keyed by
//! `(LocalDeviceId, UrbId)`, correlating submissions with completions.
//!
//! Grounded on the teacher's `PendingTransfersMap` (a map of in-flight
//! transfers per device handle, completed by a cancellation signal on
//! teardown) in its connection handler, generalised here to the richer
//! submit/complete/cancel/timeout contract section 4.3 spells out.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use protocol::types::{Direction, LocalDeviceId, SessionId, UrbId};
use protocol::StatusCode;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PendingError {
    #[error("duplicate URB id {1} on device {0}")]
    DuplicateUrb(u32, u32),
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub submit_timestamp: Instant,
    pub deadline: Instant,
    pub direction: Direction,
    pub buf_len: u32,
    pub owning_session: SessionId,
}

/// Outcome of a completed/cancelled/timed-out URB, handed back to the
/// router so it can invoke the external completer.
#[derive(Debug, Clone)]
pub struct ResolvedUrb {
    pub device: LocalDeviceId,
    pub urb_id: UrbId,
    pub status: StatusCode,
    pub actual_length: u32,
    pub data_in: Option<Vec<u8>>,
}

/// Per-side table of in-flight URBs. Not capacity-bounded by design
/// (section 4.3): callers are expected to rate-limit submissions upstream
/// (the session's bounded receive queue) rather than here.
pub struct PendingTable {
    entries: HashMap<(u32, u32), PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn key(device: LocalDeviceId, urb_id: UrbId) -> (u32, u32) {
        (device.0, urb_id.0)
    }

    /// Insert a freshly submitted URB. A collision on `(device, urb_id)`
    /// is fatal for the owning session per section 4.3's uniqueness rule.
    pub fn insert(
        &mut self,
        device: LocalDeviceId,
        urb_id: UrbId,
        direction: Direction,
        buf_len: u32,
        owning_session: SessionId,
        timeout: Duration,
    ) -> Result<(), PendingError> {
        let key = Self::key(device, urb_id);
        if self.entries.contains_key(&key) {
            return Err(PendingError::DuplicateUrb(device.0, urb_id.0));
        }
        let now = Instant::now();
        self.entries.insert(
            key,
            PendingEntry {
                submit_timestamp: now,
                deadline: now + timeout,
                direction,
                buf_len,
                owning_session,
            },
        );
        Ok(())
    }

    /// First matching completion removes the entry (at-most-once). A
    /// completion for an unknown key is a non-fatal `SpuriousCompletion`:
    /// logged and dropped, `None` returned.
    pub fn complete(
        &mut self,
        device: LocalDeviceId,
        urb_id: UrbId,
        status: StatusCode,
        actual_length: u32,
        data_in: Option<Vec<u8>>,
    ) -> Option<ResolvedUrb> {
        let key = Self::key(device, urb_id);
        if self.entries.remove(&key).is_none() {
            warn!(
                device = device.0,
                urb_id = urb_id.0,
                "spurious completion for unknown or already-resolved URB"
            );
            return None;
        }
        Some(ResolvedUrb {
            device,
            urb_id,
            status,
            actual_length,
            data_in,
        })
    }

    /// Cancel is idempotent: a second cancel on an already-resolved key is
    /// a no-op returning `None`.
    pub fn cancel(&mut self, device: LocalDeviceId, urb_id: UrbId) -> Option<ResolvedUrb> {
        let key = Self::key(device, urb_id);
        self.entries.remove(&key)?;
        Some(ResolvedUrb {
            device,
            urb_id,
            status: StatusCode::Cancelled,
            actual_length: 0,
            data_in: None,
        })
    }

    /// Remove every entry belonging to a device (device destruction
    /// cancels every URB it still holds).
    pub fn purge_device(&mut self, device: LocalDeviceId, status: StatusCode) -> Vec<ResolvedUrb> {
        let mut resolved = Vec::new();
        self.entries.retain(|&(dev, urb), _| {
            if dev == device.0 {
                resolved.push((dev, urb));
                false
            } else {
                true
            }
        });
        resolved
            .into_iter()
            .map(|(dev, urb)| ResolvedUrb {
                device: LocalDeviceId(dev),
                urb_id: UrbId(urb),
                status,
                actual_length: 0,
                data_in: None,
            })
            .collect()
    }

    /// Remove every entry owned by a session (session teardown).
    pub fn purge_session(&mut self, session: SessionId) -> Vec<ResolvedUrb> {
        let mut resolved = Vec::new();
        self.entries.retain(|&(dev, urb), entry| {
            if entry.owning_session == session {
                resolved.push((dev, urb));
                false
            } else {
                true
            }
        });
        resolved
            .into_iter()
            .map(|(dev, urb)| ResolvedUrb {
                device: LocalDeviceId(dev),
                urb_id: UrbId(urb),
                status: StatusCode::NoDevice,
                actual_length: 0,
                data_in: None,
            })
            .collect()
    }

    /// Sweep entries whose deadline has passed, completing them with
    /// `Timeout`. Intended to be called periodically by a background task.
    pub fn sweep_timeouts(&mut self) -> Vec<ResolvedUrb> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.entries.retain(|&(dev, urb), entry| {
            if entry.deadline <= now {
                expired.push((dev, urb));
                false
            } else {
                true
            }
        });
        expired
            .into_iter()
            .map(|(dev, urb)| ResolvedUrb {
                device: LocalDeviceId(dev),
                urb_id: UrbId(urb),
                status: StatusCode::Timeout,
                actual_length: 0,
                data_in: None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_session(&self, session: SessionId) -> bool {
        self.entries.values().any(|e| e.owning_session == session)
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_urb_rejected() {
        let mut table = PendingTable::new();
        table
            .insert(
                LocalDeviceId(1),
                UrbId(7),
                Direction::In,
                64,
                SessionId(1),
                Duration::from_secs(5),
            )
            .unwrap();
        let err = table
            .insert(
                LocalDeviceId(1),
                UrbId(7),
                Direction::In,
                64,
                SessionId(1),
                Duration::from_secs(5),
            )
            .unwrap_err();
        assert_eq!(err, PendingError::DuplicateUrb(1, 7));
    }

    #[test]
    fn test_at_most_once_completion() {
        let mut table = PendingTable::new();
        table
            .insert(
                LocalDeviceId(1),
                UrbId(7),
                Direction::In,
                64,
                SessionId(1),
                Duration::from_secs(5),
            )
            .unwrap();

        let first = table.complete(LocalDeviceId(1), UrbId(7), StatusCode::Success, 8, None);
        assert!(first.is_some());

        let second = table.complete(LocalDeviceId(1), UrbId(7), StatusCode::Success, 8, None);
        assert!(second.is_none());
    }

    #[test]
    fn test_idempotent_cancel() {
        let mut table = PendingTable::new();
        table
            .insert(
                LocalDeviceId(1),
                UrbId(9),
                Direction::Out,
                0,
                SessionId(1),
                Duration::from_secs(5),
            )
            .unwrap();

        let first = table.cancel(LocalDeviceId(1), UrbId(9));
        assert!(first.is_some());
        let second = table.cancel(LocalDeviceId(1), UrbId(9));
        assert!(second.is_none());
    }

    #[test]
    fn test_purge_session_completes_with_no_device() {
        let mut table = PendingTable::new();
        table
            .insert(
                LocalDeviceId(1),
                UrbId(1),
                Direction::In,
                64,
                SessionId(5),
                Duration::from_secs(5),
            )
            .unwrap();
        table
            .insert(
                LocalDeviceId(2),
                UrbId(2),
                Direction::In,
                64,
                SessionId(5),
                Duration::from_secs(5),
            )
            .unwrap();
        table
            .insert(
                LocalDeviceId(3),
                UrbId(3),
                Direction::In,
                64,
                SessionId(6),
                Duration::from_secs(5),
            )
            .unwrap();

        let resolved = table.purge_session(SessionId(5));
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|r| r.status == StatusCode::NoDevice));
        assert!(table.contains_session(SessionId(6)));
        assert!(!table.contains_session(SessionId(5)));
    }

    #[test]
    fn test_purge_device_cancels_all() {
        let mut table = PendingTable::new();
        table
            .insert(
                LocalDeviceId(1),
                UrbId(1),
                Direction::In,
                64,
                SessionId(1),
                Duration::from_secs(5),
            )
            .unwrap();
        table
            .insert(
                LocalDeviceId(1),
                UrbId(2),
                Direction::Out,
                0,
                SessionId(1),
                Duration::from_secs(5),
            )
            .unwrap();

        let resolved = table.purge_device(LocalDeviceId(1), StatusCode::Cancelled);
        assert_eq!(resolved.len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_sweep_timeouts() {
        let mut table = PendingTable::new();
        table
            .insert(
                LocalDeviceId(1),
                UrbId(1),
                Direction::In,
                64,
                SessionId(1),
                Duration::from_millis(0),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let expired = table.sweep_timeouts();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, StatusCode::Timeout);
        assert!(table.is_empty());
    }
}
