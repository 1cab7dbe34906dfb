//! Shared utilities between the server and client crates: the async/blocking
//! channel bridge used to talk to the USB worker thread, a common error
//! type, and tracing setup.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
