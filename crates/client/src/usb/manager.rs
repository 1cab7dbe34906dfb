//! Device enumeration, filtering, and hot-plug tracking.
//!
//! Runs on the USB worker thread. Devices are indexed by a stable `usize`
//! slot assigned the first time they are seen; the slot is the id this
//! crate's network session uses as the `device` field on the wire (the
//! server maps it to its own local id in `DEVICE_ATTACH_RESP`).

use std::collections::HashMap;

use common::UsbEvent;
use protocol::types::DeviceInfo;
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use tracing::{debug, error, info, warn};

use crate::usb::device::UsbDevice;

pub struct DeviceManager {
    context: Context,
    devices: HashMap<(u8, u8), UsbDevice>,
    slot_of_key: HashMap<(u8, u8), usize>,
    key_of_slot: HashMap<usize, (u8, u8)>,
    next_slot: usize,
    hotplug_registration: Option<Registration<Context>>,
    event_sender: async_channel::Sender<UsbEvent>,
    allowed_filters: Vec<String>,
}

impl DeviceManager {
    pub fn new(
        event_sender: async_channel::Sender<UsbEvent>,
        allowed_filters: Vec<String>,
    ) -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
            devices: HashMap::new(),
            slot_of_key: HashMap::new(),
            key_of_slot: HashMap::new(),
            next_slot: 0,
            hotplug_registration: None,
            event_sender,
            allowed_filters,
        })
    }

    pub fn initialize(&mut self) -> Result<(), rusb::Error> {
        self.enumerate_devices()?;
        self.register_hotplug()?;
        info!("device manager initialized with {} devices", self.devices.len());
        Ok(())
    }

    fn enumerate_devices(&mut self) -> Result<(), rusb::Error> {
        for device in self.context.devices()?.iter() {
            if let Err(e) = self.add_device(device) {
                debug!("device not added during enumeration: {e}");
            }
        }
        Ok(())
    }

    fn register_hotplug(&mut self) -> Result<(), rusb::Error> {
        let callback = HotplugCallback;
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(callback))?;
        self.hotplug_registration = Some(registration);
        Ok(())
    }

    fn add_device(&mut self, device: Device<Context>) -> Result<usize, rusb::Error> {
        let key = (device.bus_number(), device.address());

        if !self.is_device_allowed(&device) {
            return Err(rusb::Error::Access);
        }
        if let Some(&slot) = self.slot_of_key.get(&key) {
            return Ok(slot);
        }

        if let Ok(desc) = device.device_descriptor() {
            if desc.vendor_id() == 0x1d6b && desc.class_code() == 9 {
                return Err(rusb::Error::NotSupported);
            }
        }

        let usb_device = UsbDevice::new(device)?;
        let slot = self.next_slot;
        self.next_slot += 1;

        debug!(
            "added device slot={slot}: vid={:#x} pid={:#x}",
            usb_device.vendor_id(),
            usb_device.product_id()
        );

        self.slot_of_key.insert(key, slot);
        self.key_of_slot.insert(slot, key);
        self.devices.insert(key, usb_device);
        Ok(slot)
    }

    fn remove_device(&mut self, key: (u8, u8)) -> Option<usize> {
        let slot = self.slot_of_key.remove(&key)?;
        self.key_of_slot.remove(&slot);
        self.devices.remove(&key);
        Some(slot)
    }

    pub fn handle_device_arrived(&mut self, device: Device<Context>) {
        match self.add_device(device) {
            Ok(slot) => {
                if let Some(key) = self.key_of_slot.get(&slot).copied() {
                    if let Some(d) = self.devices.get(&key) {
                        let info = d.device_info();
                        if let Err(e) = self
                            .event_sender
                            .send_blocking(UsbEvent::DeviceArrived { index: slot, info })
                        {
                            error!("failed to publish device arrival: {e}");
                        }
                    }
                }
            }
            Err(e) => warn!("ignoring arrived device: {e}"),
        }
    }

    pub fn handle_device_left(&mut self, bus: u8, address: u8) {
        if let Some(slot) = self.remove_device((bus, address))
            && let Err(e) = self
                .event_sender
                .send_blocking(UsbEvent::DeviceLeft { index: slot })
        {
            error!("failed to publish device removal: {e}");
        }
    }

    pub fn list_devices(&self) -> Vec<(usize, DeviceInfo)> {
        self.key_of_slot
            .iter()
            .filter_map(|(slot, key)| self.devices.get(key).map(|d| (*slot, d.device_info())))
            .collect()
    }

    pub fn device_mut(&mut self, slot: usize) -> Option<&mut UsbDevice> {
        let key = *self.key_of_slot.get(&slot)?;
        self.devices.get_mut(&key)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn is_device_allowed(&self, device: &Device<Context>) -> bool {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => return false,
        };
        Self::check_filter(desc.vendor_id(), desc.product_id(), &self.allowed_filters)
    }

    fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
        if filters.is_empty() {
            return true;
        }
        for filter in filters {
            let parts: Vec<&str> = filter.split(':').collect();
            if parts.len() != 2 {
                continue;
            }
            let vid_match = parts[0] == "*"
                || u16::from_str_radix(parts[0].trim_start_matches("0x"), 16)
                    .map(|v| v == vid)
                    .unwrap_or(false);
            if !vid_match {
                continue;
            }
            let pid_match = parts[1] == "*"
                || u16::from_str_radix(parts[1].trim_start_matches("0x"), 16)
                    .map(|p| p == pid)
                    .unwrap_or(false);
            if pid_match {
                return true;
            }
        }
        false
    }
}

struct HotplugCallback;

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "hot-plug: device arrived bus={} addr={}",
            device.bus_number(),
            device.address()
        );
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            "hot-plug: device left bus={} addr={}",
            device.bus_number(),
            device.address()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec!["0x1234:0x5678".to_string(), "0xABCD:*".to_string()];
        assert!(DeviceManager::check_filter(0x1234, 0x5678, &filters));
        assert!(DeviceManager::check_filter(0xABCD, 0x1111, &filters));
        assert!(!DeviceManager::check_filter(0x1234, 0x9999, &filters));
        assert!(!DeviceManager::check_filter(0x0000, 0x0000, &filters));
        assert!(DeviceManager::check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_manager_creation() {
        let (tx, _rx) = async_channel::bounded(1);
        let manager = DeviceManager::new(tx, vec![]);
        assert!(manager.is_ok() || manager.is_err());
    }
}
