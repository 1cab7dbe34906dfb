//! Async channel bridge between the Tokio runtime and the USB worker thread.
//!
//! `rusb`'s event loop and blocking transfer calls are not `Send`-friendly
//! across an await point, so the worker runs on its own OS thread and
//! exchanges commands/events with async code through this bridge: an
//! `async_channel` pair for commands in and events out, with a
//! `tokio::sync::oneshot` per command for its individual response.

use async_channel::{Receiver, Sender, bounded};
use protocol::types::{DeviceInfo, UrbCompletion, UrbId, UrbRequest};

/// Commands from the Tokio runtime to the USB worker thread.
#[derive(Debug)]
pub enum UsbCommand {
    /// List currently enumerated devices matching the worker's filters,
    /// each tagged with the manager slot index used to address it.
    ListDevices {
        response: tokio::sync::oneshot::Sender<Vec<(usize, DeviceInfo)>>,
    },

    /// Open and claim a device by its manager slot index. The response
    /// carries the raw USB configuration descriptor bytes alongside the
    /// summary info, since both are needed to build `DEVICE_ATTACH`.
    OpenDevice {
        index: usize,
        response: tokio::sync::oneshot::Sender<Result<(DeviceInfo, Vec<u8>), crate::Error>>,
    },

    /// Release a previously opened device.
    CloseDevice {
        index: usize,
        response: tokio::sync::oneshot::Sender<Result<(), crate::Error>>,
    },

    /// Submit a URB for execution against an open device.
    SubmitUrb {
        index: usize,
        request: UrbRequest,
        response: tokio::sync::oneshot::Sender<UrbCompletion>,
    },

    /// Cancel a previously submitted, still-pending URB.
    CancelUrb {
        index: usize,
        urb_id: UrbId,
        response: tokio::sync::oneshot::Sender<bool>,
    },

    /// Shut the worker thread down gracefully.
    Shutdown,
}

/// Events pushed from the USB worker thread to the Tokio runtime.
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// A device matching the worker's filters was plugged in.
    DeviceArrived { index: usize, info: DeviceInfo },

    /// A previously-seen device was unplugged.
    DeviceLeft { index: usize },
}

/// Handle held by the Tokio runtime (async side).
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB worker thread.
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next event from the USB worker thread.
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle held by the USB worker thread (blocking side).
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Public so the worker thread's event loop can push directly.
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command, blocking the calling OS thread.
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Poll for a command without blocking, for use between event-loop ticks.
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Push an event, blocking the calling OS thread.
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge pair: `(async-side handle, worker-side handle)`.
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(protocol::SEND_LANE_CAPACITY);
    let (event_tx, event_rx) = bounded(protocol::SEND_LANE_CAPACITY);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_usb_bridge();

        let handle = std::thread::spawn(move || {
            let cmd = worker.recv_command().unwrap();
            matches!(cmd, UsbCommand::ListDevices { .. })
        });

        let (tx, _rx) = tokio::sync::oneshot::channel();
        bridge
            .send_command(UsbCommand::ListDevices { response: tx })
            .await
            .unwrap();

        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn test_event_roundtrip() {
        let (bridge, worker) = create_usb_bridge();
        let info = DeviceInfo {
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            speed: protocol::DeviceSpeed::High,
            num_configurations: 1,
            num_interfaces: 1,
            manufacturer: String::new(),
            product: String::new(),
            serial_number: String::new(),
        };
        worker
            .send_event(UsbEvent::DeviceArrived { index: 0, info })
            .unwrap();
        let event = bridge.recv_event().await.unwrap();
        assert!(matches!(event, UsbEvent::DeviceArrived { index: 0, .. }));
    }
}
