//! USB backend capability interface (C6): enumerates and drives real local
//! USB hardware via `rusb` on a dedicated OS thread, bridged to the async
//! session task through [`common::channel`].

pub mod device;
pub mod manager;
pub mod transfers;
pub mod worker;

pub use device::UsbDevice;
pub use manager::DeviceManager;
pub use worker::{spawn_usb_worker, UsbWorkerThread};
