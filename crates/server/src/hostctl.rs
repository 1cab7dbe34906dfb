//! Host-controller queue (section 4.5, section 6): the abstract interface
//! to the external local submitter (the kernel-mode virtual host-controller
//! driver). The driver itself is out of scope for this crate; section 9
//! notes the reference implementation realises this via two ioctls
//! (`GET_PENDING_URB`, `COMPLETE_URB`) and that "any equivalent mechanism
//! satisfies the contract" — including, explicitly, an async channel
//! receive in place of the blocking pull. This module is that channel.

use protocol::types::{LocalDeviceId, UrbId, UrbRequest};
use protocol::StatusCode;
use tokio::sync::mpsc;

/// A URB completion handed back to whatever is on the other side of the
/// queue (the driver, or in tests, an assertion).
#[derive(Debug, Clone)]
pub struct HostCompletion {
    pub device: LocalDeviceId,
    pub urb_id: UrbId,
    pub status: StatusCode,
    pub actual_length: u32,
    pub data_in: Option<Vec<u8>>,
}

/// Handle used by the external submitter (the driver, or a test harness
/// standing in for it) to push requests in and pull completions/cancels
/// out.
pub struct HostControllerHandle {
    submit_tx: mpsc::Sender<UrbRequest>,
    complete_rx: mpsc::UnboundedReceiver<HostCompletion>,
    cancel_tx: mpsc::UnboundedSender<(LocalDeviceId, UrbId)>,
}

impl HostControllerHandle {
    /// Non-blocking enqueue of a URB request (section 4.5's `submit_urb`).
    pub async fn submit_urb(&self, request: UrbRequest) -> Result<(), UrbRequest> {
        self.submit_tx.send(request).await.map_err(|e| e.0)
    }

    /// Await the next completion the router has produced.
    pub async fn recv_completion(&mut self) -> Option<HostCompletion> {
        self.complete_rx.recv().await
    }

    /// Asynchronous cancel (section 4.5's `cancel_urb`): advisory, may race
    /// a completion already in flight.
    pub fn cancel_urb(&self, device: LocalDeviceId, urb_id: UrbId) {
        let _ = self.cancel_tx.send((device, urb_id));
    }
}

/// Handle used by the router (C5) to pull submissions and push completions.
pub struct HostControllerQueue {
    submit_rx: mpsc::Receiver<UrbRequest>,
    complete_tx: mpsc::UnboundedSender<HostCompletion>,
    cancel_rx: mpsc::UnboundedReceiver<(LocalDeviceId, UrbId)>,
}

impl HostControllerQueue {
    /// Blocking pull from the submit queue (section 4.5's
    /// `get_pending_urb`). `None` means the submitter side has been
    /// dropped, e.g. on shutdown.
    pub async fn get_pending_urb(&mut self) -> Option<UrbRequest> {
        self.submit_rx.recv().await
    }

    /// Try to pull a cancel request without blocking, between submissions.
    pub fn try_recv_cancel(&mut self) -> Option<(LocalDeviceId, UrbId)> {
        self.cancel_rx.try_recv().ok()
    }

    pub fn complete_urb(&self, completion: HostCompletion) {
        let _ = self.complete_tx.send(completion);
    }
}

/// Create the paired channel endpoints: `(driver-facing handle, router-facing queue)`.
pub fn channel_queue() -> (HostControllerHandle, HostControllerQueue) {
    let (submit_tx, submit_rx) = mpsc::channel(protocol::SEND_LANE_CAPACITY);
    let (complete_tx, complete_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();

    (
        HostControllerHandle {
            submit_tx,
            complete_rx,
            cancel_tx,
        },
        HostControllerQueue {
            submit_rx,
            complete_tx,
            cancel_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::types::{Direction, SetupPacket, TransferType};

    fn sample_request() -> UrbRequest {
        UrbRequest {
            device: 1,
            urb_id: UrbId(7),
            endpoint: 0x81,
            transfer_type: TransferType::Bulk,
            direction: Direction::In,
            flags: 0,
            buf_len: 64,
            interval: 0,
            setup: SetupPacket::default(),
            data_out: None,
        }
    }

    #[tokio::test]
    async fn test_submit_and_pull() {
        let (handle, mut queue) = channel_queue();
        handle.submit_urb(sample_request()).await.unwrap();
        let req = queue.get_pending_urb().await.unwrap();
        assert_eq!(req.urb_id, UrbId(7));
    }

    #[tokio::test]
    async fn test_complete_and_recv() {
        let (mut handle, queue) = channel_queue();
        queue.complete_urb(HostCompletion {
            device: LocalDeviceId(1),
            urb_id: UrbId(7),
            status: StatusCode::Success,
            actual_length: 8,
            data_in: Some(vec![1, 2, 3, 4, 5, 6, 7, 8]),
        });
        let completion = handle.recv_completion().await.unwrap();
        assert_eq!(completion.actual_length, 8);
    }

    #[tokio::test]
    async fn test_cancel_is_advisory() {
        let (handle, mut queue) = channel_queue();
        handle.cancel_urb(LocalDeviceId(1), UrbId(9));
        assert_eq!(
            queue.try_recv_cancel(),
            Some((LocalDeviceId(1), UrbId(9)))
        );
        assert_eq!(queue.try_recv_cancel(), None);
    }
}
