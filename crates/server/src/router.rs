//! URB router (C5): the single task that owns the host-controller queue,
//! matches submissions to the session that owns the target device, and
//! feeds completions back out to whichever side asked for them.
//!
//! Grounded on the teacher's transfer-dispatch loop (one task pulling
//! from a work queue, looking up the owning connection, and forwarding)
//! generalised to the three-way rendezvous between the local queue, the
//! session lanes and the shared completion channel this design calls for.

use std::sync::Arc;
use std::time::Duration;

use protocol::messages::UrbSubmitHeader;
use protocol::types::{LocalDeviceId, UrbId};
use protocol::{Message, StatusCode};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::hostctl::{HostCompletion, HostControllerQueue};
use crate::pending::ResolvedUrb;
use crate::session::{Outbound, Shared};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

fn setup_packet_bytes(setup: &protocol::types::SetupPacket) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[0] = setup.bm_request_type;
    bytes[1] = setup.b_request;
    bytes[2..4].copy_from_slice(&setup.w_value.to_le_bytes());
    bytes[4..6].copy_from_slice(&setup.w_index.to_le_bytes());
    bytes[6..8].copy_from_slice(&setup.w_length.to_le_bytes());
    bytes
}

/// Main router loop. Runs until the host-controller queue's submit side
/// is dropped (process shutdown) or `shutdown` fires.
pub async fn run_router(
    mut queue: HostControllerQueue,
    shared: Arc<Shared>,
    mut completions_rx: mpsc::UnboundedReceiver<ResolvedUrb>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            pending = queue.get_pending_urb() => {
                match pending {
                    Some(request) => submit(&mut queue, &shared, request).await,
                    None => {
                        debug!("host controller handle dropped, router stopping");
                        return;
                    }
                }
            }
            Some(resolved) = completions_rx.recv() => {
                complete(&queue, resolved);
            }
            _ = sweep.tick() => {
                if let Some((device, urb_id)) = queue.try_recv_cancel() {
                    handle_cancel(&queue, &shared, device, urb_id).await;
                }
                sweep_timeouts(&queue, &shared).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("router shutting down");
                    return;
                }
            }
        }
    }
}

async fn submit(
    queue: &mut HostControllerQueue,
    shared: &Arc<Shared>,
    request: protocol::types::UrbRequest,
) {
    let device = LocalDeviceId(request.device);
    let urb_id = request.urb_id;

    let registry = shared.registry.lock().await;
    let entry = registry.by_local(device).cloned();
    drop(registry);

    let Some(entry) = entry else {
        warn!(device = device.0, urb_id = urb_id.0, "submit for unknown device, no device");
        queue.complete_urb(HostCompletion {
            device,
            urb_id,
            status: StatusCode::NoDevice,
            actual_length: 0,
            data_in: None,
        });
        return;
    };

    let sessions = shared.sessions.lock().await;
    let Some(lane) = sessions.get(&entry.owning_session).cloned() else {
        drop(sessions);
        warn!(device = device.0, "owning session gone, no device");
        queue.complete_urb(HostCompletion {
            device,
            urb_id,
            status: StatusCode::NoDevice,
            actual_length: 0,
            data_in: None,
        });
        return;
    };
    drop(sessions);

    let mut pending = shared.pending.lock().await;
    let insert = pending.insert(
        device,
        urb_id,
        request.direction,
        request.buf_len,
        entry.owning_session,
        shared.urb_timeout,
    );
    drop(pending);

    if let Err(e) = insert {
        warn!("rejecting submission: {e}");
        queue.complete_urb(HostCompletion {
            device,
            urb_id,
            status: StatusCode::InvalidParam,
            actual_length: 0,
            data_in: None,
        });
        return;
    }

    let header = UrbSubmitHeader {
        device_id: entry.remote_id,
        urb_id: urb_id.0,
        endpoint_address: request.endpoint,
        transfer_type: request.transfer_type as u8,
        direction: request.direction as u8,
        reserved: 0,
        transfer_flags: request.flags,
        buf_len: request.buf_len,
        interval: request.interval,
        setup_packet: setup_packet_bytes(&request.setup),
    };

    let message = Message::SubmitUrb {
        header,
        data_out: request.data_out,
    };

    if lane.tx.send(Outbound::Request(message)).await.is_err() {
        warn!(device = device.0, "session lane closed mid-submit");
        let mut pending = shared.pending.lock().await;
        if let Some(resolved) = pending.cancel(device, urb_id) {
            drop(pending);
            queue.complete_urb(HostCompletion {
                device: resolved.device,
                urb_id: resolved.urb_id,
                status: StatusCode::NoDevice,
                actual_length: 0,
                data_in: None,
            });
        }
    }
}

fn complete(queue: &HostControllerQueue, resolved: ResolvedUrb) {
    queue.complete_urb(HostCompletion {
        device: resolved.device,
        urb_id: resolved.urb_id,
        status: resolved.status,
        actual_length: resolved.actual_length,
        data_in: resolved.data_in,
    });
}

async fn handle_cancel(
    queue: &HostControllerQueue,
    shared: &Arc<Shared>,
    device: LocalDeviceId,
    urb_id: UrbId,
) {
    let mut pending = shared.pending.lock().await;
    let resolved = pending.cancel(device, urb_id);
    drop(pending);

    let Some(resolved) = resolved else {
        debug!(device = device.0, urb_id = urb_id.0, "cancel for already-resolved urb, ignored");
        return;
    };
    complete(queue, resolved);

    let registry = shared.registry.lock().await;
    let entry = registry.by_local(device).cloned();
    drop(registry);

    let Some(entry) = entry else { return };
    let sessions = shared.sessions.lock().await;
    let Some(lane) = sessions.get(&entry.owning_session).cloned() else {
        return;
    };
    drop(sessions);

    lane.tx
        .send(Outbound::Request(Message::CancelUrb {
            device: entry.remote_id,
            urb_id: urb_id.0,
        }))
        .await
        .ok();
}

async fn sweep_timeouts(queue: &HostControllerQueue, shared: &Arc<Shared>) {
    let expired = shared.pending.lock().await.sweep_timeouts();
    if expired.is_empty() {
        return;
    }
    for resolved in expired {
        warn!(
            device = resolved.device.0,
            urb_id = resolved.urb_id.0,
            "urb timed out"
        );
        complete(queue, resolved);
    }
}

