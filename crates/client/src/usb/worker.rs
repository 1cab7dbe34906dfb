//! USB worker thread.
//!
//! Dedicated OS thread that owns the `rusb::Context`, runs its blocking
//! `handle_events` loop, and communicates with the Tokio runtime over the
//! [`common::channel`] bridge. Grounded on the teacher's
//! `crates/server/src/usb/worker.rs`: the same interleave of a non-blocking
//! command poll and a timed `handle_events` call, generalised from the
//! teacher's device-handle addressing to this crate's manager-slot model.

use std::time::Duration;

use common::{UsbCommand, UsbWorker};
use protocol::types::UrbCompletion;
use protocol::StatusCode;
use rusb::UsbContext;
use tracing::{debug, error, info, warn};

use crate::usb::{manager::DeviceManager, transfers};

const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Owns the USB context and command channel for the lifetime of the thread.
pub struct UsbWorkerThread {
    manager: DeviceManager,
    worker: UsbWorker,
}

impl UsbWorkerThread {
    pub fn new(worker: UsbWorker, allowed_filters: Vec<String>) -> Result<Self, rusb::Error> {
        let mut manager = DeviceManager::new(worker.event_tx.clone(), allowed_filters)?;
        manager.initialize()?;
        Ok(Self { manager, worker })
    }

    /// Run the event loop until a `Shutdown` command is received.
    pub fn run(mut self) {
        info!("usb worker thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(UsbCommand::Shutdown) => {
                    info!("usb worker thread shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None => {}
            }

            match self.manager.context().handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => debug!("usb event handling interrupted"),
                Err(e) => {
                    warn!("error handling usb events: {e}");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }

        info!("usb worker thread stopped");
    }

    fn handle_command(&mut self, cmd: UsbCommand) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));
        if let Err(e) = result {
            error!("panic in usb command handler: {e:?}");
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::ListDevices { response } => {
                let devices = self.manager.list_devices();
                debug!("listing {} devices", devices.len());
                let _ = response.send(devices);
            }

            UsbCommand::OpenDevice { index, response } => {
                let result = match self.manager.device_mut(index) {
                    Some(device) => device
                        .open()
                        .map(|()| (device.device_info(), device.raw_descriptors()))
                        .map_err(Into::into),
                    None => Err(common::Error::Usb(format!("no device at slot {index}"))),
                };
                let _ = response.send(result);
            }

            UsbCommand::CloseDevice { index, response } => {
                let result = match self.manager.device_mut(index) {
                    Some(device) => {
                        device.close();
                        Ok(())
                    }
                    None => Err(common::Error::Usb(format!("no device at slot {index}"))),
                };
                let _ = response.send(result);
            }

            UsbCommand::SubmitUrb {
                index,
                request,
                response,
            } => {
                debug!(slot = index, urb_id = request.urb_id.0, "submitting urb");
                let completion = match self.manager.device_mut(index) {
                    Some(device) => match device.handle_mut() {
                        Some(handle) => transfers::execute_urb(handle, &request),
                        None => no_device_completion(&request),
                    },
                    None => no_device_completion(&request),
                };
                let _ = response.send(completion);
            }

            UsbCommand::CancelUrb {
                index: _,
                urb_id,
                response,
            } => {
                // Transfers run synchronously to completion (or timeout) on
                // this thread, so by the time a cancel arrives the URB has
                // always already been resolved; nothing left to cancel.
                debug!(urb_id = urb_id.0, "cancel requested for already-resolved urb");
                let _ = response.send(false);
            }

            UsbCommand::Shutdown => unreachable!("handled in run()"),
        }
    }
}

fn no_device_completion(request: &protocol::types::UrbRequest) -> UrbCompletion {
    UrbCompletion {
        device: request.device,
        urb_id: request.urb_id,
        status: StatusCode::NoDevice,
        actual_length: 0,
        data_in: None,
    }
}

/// Spawn the USB worker on its own OS thread and return its join handle.
pub fn spawn_usb_worker(worker: UsbWorker, filters: Vec<String>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || match UsbWorkerThread::new(worker, filters) {
            Ok(thread) => thread.run(),
            Err(e) => error!("failed to initialize usb worker thread: {e}"),
        })
        .expect("failed to spawn usb worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_usb_bridge;

    #[test]
    fn test_usb_worker_creation() {
        let (_bridge, worker) = create_usb_bridge();
        match UsbWorkerThread::new(worker, vec![]) {
            Ok(_) => {}
            Err(e) => eprintln!("usb worker creation failed (expected without permissions): {e}"),
        }
    }
}
