//! Device registry (C2): the authoritative local-device-id <-> owning
//! session <-> client-side remote-id mapping.
//!
//! Grounded on the slot-table shape of the teacher's `DeviceManager`
//! (`devices` keyed by a stable identity, looked up by both a numeric id
//! and by owner) but unified per the design's ambiguity note in section 9:
//! this is the single authoritative table, sessions only hold the set of
//! `LocalDeviceId`s they own.

use std::collections::HashMap;

use protocol::types::{DeviceInfo, LocalDeviceId, SessionId};
use protocol::MAX_DEVICES;
use thiserror::Error;
use tracing::debug;

/// Lifecycle state of a registered device (informational; all submissions
/// are valid in `Attached`/`Configured`/`Suspended`, per the design's state
/// machine. `Detaching` rejects new submissions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Attached,
    Configured,
    Suspended,
    Detaching,
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub local_id: LocalDeviceId,
    pub owning_session: SessionId,
    pub remote_id: u32,
    pub info: DeviceInfo,
    pub descriptors: Vec<u8>,
    pub state: DeviceState,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry full: {0} device slots already occupied")]
    TooManyDevices(usize),
    #[error("malformed device descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Validate a raw USB configuration-descriptor byte stream per the
/// summarised rule in section 9: a configuration descriptor's declared
/// `wTotalLength` must be reachable by walking descriptor-length-prefixed
/// records to the end of the buffer. An empty buffer is valid (some
/// devices attach with no cached descriptors).
fn validate_descriptors(bytes: &[u8]) -> Result<(), RegistryError> {
    if bytes.is_empty() {
        return Ok(());
    }
    if bytes.len() < 2 {
        return Err(RegistryError::InvalidDescriptor(
            "buffer shorter than one descriptor header".into(),
        ));
    }

    let mut offset = 0usize;
    while offset < bytes.len() {
        if offset + 2 > bytes.len() {
            return Err(RegistryError::InvalidDescriptor(
                "truncated descriptor header".into(),
            ));
        }
        let len = bytes[offset] as usize;
        if len < 2 {
            return Err(RegistryError::InvalidDescriptor(format!(
                "descriptor at offset {offset} declares length {len} < 2"
            )));
        }
        if offset + len > bytes.len() {
            return Err(RegistryError::InvalidDescriptor(format!(
                "descriptor at offset {offset} declares length {len}, overruns buffer of {}",
                bytes.len()
            )));
        }
        offset += len;
    }
    Ok(())
}

/// Authoritative server-side device table, guarded by the caller with a
/// single exclusive-access contract (one writer or many readers): callers
/// wrap a `Registry` in whatever mutex/rwlock fits their runtime, the type
/// itself is a plain, non-thread-safe slot table.
pub struct Registry {
    slots: Vec<Option<RegistryEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_DEVICES).map(|_| None).collect(),
        }
    }

    /// Attach a device, picking the lowest free slot. `local_id` is
    /// `slot_index + 1` per the design's numbering.
    pub fn attach(
        &mut self,
        session: SessionId,
        remote_id: u32,
        info: DeviceInfo,
        descriptors: Vec<u8>,
    ) -> Result<LocalDeviceId, RegistryError> {
        validate_descriptors(&descriptors)?;

        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(RegistryError::TooManyDevices(MAX_DEVICES))?;

        let local_id = LocalDeviceId((slot + 1) as u32);
        self.slots[slot] = Some(RegistryEntry {
            local_id,
            owning_session: session,
            remote_id,
            info,
            descriptors,
            state: DeviceState::Attached,
        });
        debug!(local_id = local_id.0, session = session.0, "device attached");
        Ok(local_id)
    }

    pub fn detach(&mut self, local_id: LocalDeviceId) -> Option<RegistryEntry> {
        let idx = local_id.0.checked_sub(1)? as usize;
        let entry = self.slots.get_mut(idx)?.take();
        if entry.is_some() {
            debug!(local_id = local_id.0, "device detached");
        }
        entry
    }

    pub fn by_local(&self, local_id: LocalDeviceId) -> Option<&RegistryEntry> {
        let idx = local_id.0.checked_sub(1)? as usize;
        self.slots.get(idx)?.as_ref()
    }

    pub fn by_local_mut(&mut self, local_id: LocalDeviceId) -> Option<&mut RegistryEntry> {
        let idx = local_id.0.checked_sub(1)? as usize;
        self.slots.get_mut(idx)?.as_mut()
    }

    pub fn by_session(&self, session: SessionId) -> impl Iterator<Item = &RegistryEntry> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .filter(move |e| e.owning_session == session)
    }

    /// Remove and return every entry owned by `session` (session teardown).
    pub fn detach_session(&mut self, session: SessionId) -> Vec<RegistryEntry> {
        let mut removed = Vec::new();
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|e| e.owning_session == session) {
                removed.push(slot.take().unwrap());
            }
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<(LocalDeviceId, DeviceInfo)> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .map(|e| (e.local_id, e.info.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::types::DeviceSpeed;

    fn sample_info() -> DeviceInfo {
        DeviceInfo {
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_class: 0xFF,
            device_subclass: 0,
            device_protocol: 0,
            speed: DeviceSpeed::High,
            num_configurations: 1,
            num_interfaces: 1,
            manufacturer: String::new(),
            product: String::new(),
            serial_number: String::new(),
        }
    }

    #[test]
    fn test_attach_assigns_lowest_free_slot() {
        let mut reg = Registry::new();
        let id1 = reg.attach(SessionId(1), 0, sample_info(), vec![]).unwrap();
        assert_eq!(id1, LocalDeviceId(1));
        reg.detach(id1);
        let id2 = reg.attach(SessionId(1), 0, sample_info(), vec![]).unwrap();
        assert_eq!(id2, LocalDeviceId(1));
    }

    #[test]
    fn test_too_many_devices() {
        let mut reg = Registry::new();
        for _ in 0..MAX_DEVICES {
            reg.attach(SessionId(1), 0, sample_info(), vec![]).unwrap();
        }
        let err = reg.attach(SessionId(1), 0, sample_info(), vec![]).unwrap_err();
        assert_eq!(err, RegistryError::TooManyDevices(MAX_DEVICES));
    }

    #[test]
    fn test_invalid_descriptor_rejected() {
        let mut reg = Registry::new();
        let bad = vec![0x12, 0x01, 0x00]; // declares length 0x12=18 but buffer is 3 bytes
        let err = reg.attach(SessionId(1), 0, sample_info(), bad).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_detach_session_closure() {
        let mut reg = Registry::new();
        reg.attach(SessionId(1), 0, sample_info(), vec![]).unwrap();
        reg.attach(SessionId(1), 1, sample_info(), vec![]).unwrap();
        reg.attach(SessionId(2), 0, sample_info(), vec![]).unwrap();

        let removed = reg.detach_session(SessionId(1));
        assert_eq!(removed.len(), 2);
        assert_eq!(reg.by_session(SessionId(1)).count(), 0);
        assert_eq!(reg.by_session(SessionId(2)).count(), 1);
    }

    #[test]
    fn test_by_local_after_detach_is_none() {
        let mut reg = Registry::new();
        let id = reg.attach(SessionId(1), 0, sample_info(), vec![]).unwrap();
        reg.detach(id);
        assert!(reg.by_local(id).is_none());
    }
}
