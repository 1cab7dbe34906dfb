//! Physical USB device wrapper.
//!
//! Wraps an `rusb::Device` with its cached descriptor and a convenient
//! conversion to [`protocol::types::DeviceInfo`]. The open/close sequence
//! mirrors what a standard USB/IP exporter does: detach any kernel driver
//! from every interface, claim them all for exclusive use, and reverse
//! that on close so the device goes back to normal local use.

use protocol::types::{DeviceInfo, DeviceSpeed};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use tracing::{debug, warn};

use crate::error::ClientError;

pub struct UsbDevice {
    device: Device<Context>,
    descriptor: DeviceDescriptor,
    handle: Option<DeviceHandle<Context>>,
    speed: DeviceSpeed,
    num_interfaces: u8,
}

impl UsbDevice {
    pub fn new(device: Device<Context>) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        let speed = map_device_speed(device.speed());

        Ok(Self {
            device,
            descriptor,
            handle: None,
            speed,
            num_interfaces: 0,
        })
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn device_address(&self) -> u8 {
        self.device.address()
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id()
    }

    /// Snapshot this device's summary for `DEVICE_ATTACH`/`DEVICE_LIST_RESP`.
    pub fn device_info(&self) -> DeviceInfo {
        let strings = self
            .device
            .open()
            .ok()
            .map(|handle| self.read_string_descriptors(&handle));
        let (manufacturer, product, serial_number) = strings.unwrap_or_default();

        DeviceInfo {
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            device_class: self.descriptor.class_code(),
            device_subclass: self.descriptor.sub_class_code(),
            device_protocol: self.descriptor.protocol_code(),
            speed: self.speed,
            num_configurations: self.descriptor.num_configurations(),
            num_interfaces: self.num_interfaces,
            manufacturer,
            product,
            serial_number,
        }
    }

    /// Returns the raw USB configuration descriptor bytes for the active
    /// configuration, carried as-is in `DEVICE_ATTACH`'s `descriptors` field.
    pub fn raw_descriptors(&self) -> Vec<u8> {
        self.device
            .active_config_descriptor()
            .map(|c| c.extra().to_vec())
            .unwrap_or_default()
    }

    /// Open the device, detaching kernel drivers and claiming every
    /// interface of the active configuration for exclusive use.
    pub fn open(&mut self) -> Result<(), ClientError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let handle = self.device.open().map_err(|e| {
            warn!("failed to open device: {e}");
            ClientError::Usb(e)
        })?;

        let num_interfaces = match self.device.active_config_descriptor() {
            Ok(config) => config.num_interfaces(),
            Err(e) => {
                warn!("failed to read config descriptor, assuming 1 interface: {e}");
                1
            }
        };

        for iface in 0..num_interfaces {
            match handle.kernel_driver_active(iface) {
                Ok(true) => {
                    if let Err(e) = handle.detach_kernel_driver(iface) {
                        warn!("failed to detach kernel driver from interface {iface}: {e}");
                    }
                }
                Ok(false) => {}
                Err(e) => debug!("cannot query kernel driver on interface {iface}: {e}"),
            }
        }

        for iface in 0..num_interfaces {
            if let Err(e) = handle.claim_interface(iface) {
                warn!("failed to claim interface {iface}: {e}");
            }
        }

        self.num_interfaces = num_interfaces;
        self.handle = Some(handle);
        Ok(())
    }

    /// Release every claimed interface and reattach kernel drivers.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            for iface in 0..self.num_interfaces {
                if let Err(e) = handle.release_interface(iface) {
                    warn!("failed to release interface {iface}: {e}");
                }
            }
            for iface in 0..self.num_interfaces {
                if let Err(e) = handle.attach_kernel_driver(iface) {
                    debug!("could not reattach kernel driver to interface {iface}: {e}");
                }
            }
            self.num_interfaces = 0;
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&DeviceHandle<Context>> {
        self.handle.as_ref()
    }

    pub fn handle_mut(&mut self) -> Option<&mut DeviceHandle<Context>> {
        self.handle.as_mut()
    }

    fn read_string_descriptors(&self, handle: &DeviceHandle<Context>) -> (String, String, String) {
        let read = |idx: Option<u8>| {
            idx.and_then(|i| handle.read_string_descriptor_ascii(i).ok())
                .unwrap_or_default()
        };
        (
            read(self.descriptor.manufacturer_string_index()),
            read(self.descriptor.product_string_index()),
            read(self.descriptor.serial_number_string_index()),
        )
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), DeviceSpeed::Low);
        assert_eq!(map_device_speed(rusb::Speed::High), DeviceSpeed::High);
        assert_eq!(map_device_speed(rusb::Speed::Super), DeviceSpeed::Super);
        assert_eq!(
            map_device_speed(rusb::Speed::SuperPlus),
            DeviceSpeed::SuperPlus
        );
    }
}
