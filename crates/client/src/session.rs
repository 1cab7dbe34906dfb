//! Session manager (C4) and URB dispatcher (C6): the single TCP connection
//! to the bridge server, its send lane, and the translation between
//! wire-level `SUBMIT_URB`/`CANCEL_URB` frames and the local USB worker.
//!
//! Grounded on the server's `session.rs`: the same reader-task/send-lane
//! split and heartbeat select loop, generalised from the server's
//! many-sessions bookkeeping to this crate's single outbound connection,
//! plus a sequence-keyed pending-request table since (unlike the server)
//! this side actively awaits responses to the requests it sends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{UsbBridge, UsbCommand};
use protocol::messages::{UrbCompleteHeader, UrbSubmitHeader};
use protocol::types::{Direction, SetupPacket, TransferType, UrbId, UrbRequest};
use protocol::{FrameHeader, Message, StatusCode};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);

/// A frame queued for the send lane, always pre-sequenced: unlike the
/// server, this side must know a request's sequence number up front in
/// order to register the pending-response entry before sending it.
enum Outbound {
    Frame(Message, u32),
}

/// Commands the rest of the client issues against the live session.
enum SessionCommand {
    AttachDevice {
        slot: usize,
        info: protocol::DeviceInfo,
        descriptors: Vec<u8>,
        response: oneshot::Sender<Result<u32>>,
    },
    DetachDevice {
        local_device_id: u32,
    },
    ListDevices {
        response: oneshot::Sender<Result<Vec<(u32, protocol::DeviceInfo)>>>,
    },
}

/// Handle used by the rest of the client to drive an established session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Attach a locally-enumerated device (by USB worker slot) to the
    /// server, returning the server-assigned local device id.
    pub async fn attach_device(
        &self,
        slot: usize,
        info: protocol::DeviceInfo,
        descriptors: Vec<u8>,
    ) -> Result<u32> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::AttachDevice {
                slot,
                info,
                descriptors,
                response,
            })
            .await
            .map_err(|_| ClientError::NoDevice)?;
        rx.await.map_err(|_| ClientError::NoDevice)?
    }

    /// Detach a previously attached device. Fire-and-forget: the wire
    /// protocol defines no response to `DEVICE_DETACH`.
    pub async fn detach_device(&self, local_device_id: u32) {
        self.tx
            .send(SessionCommand::DetachDevice { local_device_id })
            .await
            .ok();
    }

    pub async fn list_devices(&self) -> Result<Vec<(u32, protocol::DeviceInfo)>> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::ListDevices { response })
            .await
            .map_err(|_| ClientError::NoDevice)?;
        rx.await.map_err(|_| ClientError::NoDevice)?
    }
}

struct Pending {
    requests: HashMap<u32, oneshot::Sender<Message>>,
}

/// Per-session state owned exclusively by the dispatch task: the
/// remote-id assignment counter and the mapping back to USB worker slots.
/// `remote_id` is this session's own wire-level handle for a device,
/// assigned in the same attach order the server assigns its
/// `local_by_remote` counter, so the two stay implicitly in lockstep.
struct DeviceMap {
    next_remote_id: u32,
    remote_to_slot: HashMap<u32, usize>,
    local_to_remote: HashMap<u32, u32>,
}

impl DeviceMap {
    fn new() -> Self {
        Self {
            next_remote_id: 0,
            remote_to_slot: HashMap::new(),
            local_to_remote: HashMap::new(),
        }
    }

    fn assign(&mut self, slot: usize) -> u32 {
        let remote_id = self.next_remote_id;
        self.next_remote_id += 1;
        self.remote_to_slot.insert(remote_id, slot);
        remote_id
    }

    fn confirm(&mut self, remote_id: u32, local_device_id: u32) {
        self.local_to_remote.insert(local_device_id, remote_id);
    }

    fn forget(&mut self, local_device_id: u32) {
        if let Some(remote_id) = self.local_to_remote.remove(&local_device_id) {
            self.remote_to_slot.remove(&remote_id);
        }
    }
}

fn setup_packet_from_bytes(bytes: [u8; 8]) -> SetupPacket {
    SetupPacket {
        bm_request_type: bytes[0],
        b_request: bytes[1],
        w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
        w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
        w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
    }
}

/// Connect to `addr`, complete the CONNECT/CONNECT_RESP handshake, and
/// spawn the session's background tasks. Returns a handle for issuing
/// attach/detach/list commands plus the session id the server assigned.
pub async fn connect(
    addr: &str,
    client_name: String,
    bridge: UsbBridge,
    shutdown: watch::Receiver<bool>,
) -> Result<(SessionHandle, u32, oneshot::Receiver<()>)> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = stream.into_split();

    let (lane_tx, mut lane_rx) = mpsc::channel::<Outbound>(protocol::SEND_LANE_CAPACITY);
    let next_seq = Arc::new(AtomicU32::new(1));

    let writer_handle = tokio::spawn(async move {
        while let Some(Outbound::Frame(msg, seq)) = lane_rx.recv().await {
            if let Err(e) = protocol::write_frame_async(&mut writer, &msg, seq).await {
                warn!("send lane write failed: {e}");
                break;
            }
        }
    });

    let connect_seq = next_seq.fetch_add(1, Ordering::Relaxed);
    lane_tx
        .send(Outbound::Frame(
            Message::Connect {
                client_version: protocol::CURRENT_VERSION as u32,
                caps: 0,
                client_name,
            },
            connect_seq,
        ))
        .await
        .map_err(|_| ClientError::Io(std::io::Error::other("send lane closed")))?;

    let (header, message) = protocol::read_frame_async(&mut reader, true).await?;
    if header.sequence != connect_seq {
        warn!("connect response sequence mismatch, proceeding anyway");
    }
    let (status, session_id) = match message {
        Message::ConnectResp {
            status,
            session_id,
            ..
        } => (status, session_id),
        other => {
            writer_handle.abort();
            return Err(ClientError::Protocol(protocol::ProtocolError::InvalidPayload(
                format!("expected CONNECT_RESP, got {:?}", other.command()),
            )));
        }
    };
    if !status.is_success() {
        writer_handle.abort();
        return Err(ClientError::Config(format!(
            "server refused connection: status={status:?}"
        )));
    }
    info!(session_id, "connected to server");

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let pending = Arc::new(AsyncMutex::new(Pending {
        requests: HashMap::new(),
    }));

    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(run_session(
        reader,
        lane_tx,
        cmd_rx,
        next_seq,
        pending,
        bridge,
        writer_handle,
        shutdown,
        done_tx,
    ));

    Ok((SessionHandle { tx: cmd_tx }, session_id, done_rx))
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    lane_tx: mpsc::Sender<Outbound>,
    mut commands: mpsc::Receiver<SessionCommand>,
    next_seq: Arc<AtomicU32>,
    pending: Arc<AsyncMutex<Pending>>,
    bridge: UsbBridge,
    writer_handle: tokio::task::JoinHandle<()>,
    mut shutdown: watch::Receiver<bool>,
    done_tx: oneshot::Sender<()>,
) {
    let mut devices = DeviceMap::new();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = tokio::time::Instant::now();

    loop {
        tokio::select! {
            frame = protocol::read_frame_async(&mut reader, true) => {
                match frame {
                    Ok((header, message)) => {
                        last_seen = tokio::time::Instant::now();
                        dispatch_incoming(&lane_tx, &pending, &bridge, &next_seq, &devices, header, message).await;
                    }
                    Err(e) => {
                        debug!("receive loop ending: {e}");
                        break;
                    }
                }
            }
            Some(cmd) = commands.recv() => {
                handle_command(&lane_tx, &pending, &next_seq, &mut devices, cmd).await;
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > HEARTBEAT_TIMEOUT {
                    warn!("heartbeat timeout, closing session");
                    break;
                }
                let seq = next_seq.fetch_add(1, Ordering::Relaxed);
                if lane_tx.send(Outbound::Frame(Message::Ping, seq)).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let seq = next_seq.fetch_add(1, Ordering::Relaxed);
                    lane_tx.send(Outbound::Frame(Message::Disconnect, seq)).await.ok();
                    break;
                }
            }
        }
    }

    drop(lane_tx);
    writer_handle.abort();
    let _ = done_tx.send(());
    info!("session closed");
}

async fn handle_command(
    lane_tx: &mpsc::Sender<Outbound>,
    pending: &Arc<AsyncMutex<Pending>>,
    next_seq: &Arc<AtomicU32>,
    devices: &mut DeviceMap,
    cmd: SessionCommand,
) {
    match cmd {
        SessionCommand::AttachDevice {
            slot,
            info,
            descriptors,
            response,
        } => {
            // Reserve the remote id before the frame goes out: the server
            // assigns its matching counter in the order it processes
            // DEVICE_ATTACH frames, which on a single ordered stream is the
            // order they are sent.
            let remote_id = devices.assign(slot);
            let seq = next_seq.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            pending.lock().await.requests.insert(seq, tx);
            if lane_tx
                .send(Outbound::Frame(Message::DeviceAttach { info, descriptors }, seq))
                .await
                .is_err()
            {
                let _ = response.send(Err(ClientError::Io(std::io::Error::other(
                    "send lane closed",
                ))));
                return;
            }
            let result = match rx.await {
                Ok(Message::DeviceAttachResp { status, local_device_id }) if status.is_success() => {
                    devices.confirm(remote_id, local_device_id);
                    Ok(local_device_id)
                }
                Ok(Message::DeviceAttachResp { status, .. }) => Err(ClientError::Config(format!(
                    "attach rejected: status={status:?}"
                ))),
                _ => Err(ClientError::NoDevice),
            };
            let _ = response.send(result);
        }

        SessionCommand::DetachDevice { local_device_id } => {
            devices.forget(local_device_id);
            let seq = next_seq.fetch_add(1, Ordering::Relaxed);
            lane_tx
                .send(Outbound::Frame(
                    Message::DeviceDetach { local_device_id },
                    seq,
                ))
                .await
                .ok();
        }

        SessionCommand::ListDevices { response } => {
            let seq = next_seq.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            pending.lock().await.requests.insert(seq, tx);
            if lane_tx
                .send(Outbound::Frame(Message::DeviceList, seq))
                .await
                .is_err()
            {
                let _ = response.send(Err(ClientError::Io(std::io::Error::other(
                    "send lane closed",
                ))));
                return;
            }
            let result = match rx.await {
                Ok(Message::DeviceListResp { status, devices }) if status.is_success() => {
                    Ok(devices)
                }
                Ok(Message::DeviceListResp { status, .. }) => Err(ClientError::Config(format!(
                    "list rejected: status={status:?}"
                ))),
                _ => Err(ClientError::NoDevice),
            };
            let _ = response.send(result);
        }
    }
}

async fn dispatch_incoming(
    lane_tx: &mpsc::Sender<Outbound>,
    pending: &Arc<AsyncMutex<Pending>>,
    bridge: &UsbBridge,
    next_seq: &Arc<AtomicU32>,
    devices: &DeviceMap,
    header: FrameHeader,
    message: Message,
) {
    match message {
        Message::Ping => {
            lane_tx
                .send(Outbound::Frame(Message::Pong, header.sequence))
                .await
                .ok();
        }
        Message::Pong => {}
        Message::ConnectResp { .. } | Message::DeviceAttachResp { .. } | Message::DeviceListResp { .. } => {
            if let Some(tx) = pending.lock().await.requests.remove(&header.sequence) {
                let _ = tx.send(message);
            } else {
                warn!(command = ?message.command(), "response with no matching request, dropping");
            }
        }
        Message::SubmitUrb { header: submit, data_out } => {
            handle_submit_urb(lane_tx, bridge, next_seq, devices, submit, data_out).await;
        }
        Message::CancelUrb { device, urb_id } => {
            handle_cancel_urb(bridge, devices, device, urb_id).await;
        }
        Message::Error { code, message, .. } => {
            warn!(code, message = %message, "server reported error");
        }
        other => {
            warn!(command = ?other.command(), "unexpected frame from server, ignoring");
        }
    }
}

async fn handle_submit_urb(
    lane_tx: &mpsc::Sender<Outbound>,
    bridge: &UsbBridge,
    next_seq: &Arc<AtomicU32>,
    devices: &DeviceMap,
    submit: UrbSubmitHeader,
    data_out: Option<Vec<u8>>,
) {
    let Some(&index) = devices.remote_to_slot.get(&submit.device_id) else {
        warn!(device = submit.device_id, "submit for unknown remote device id");
        complete_with_status(lane_tx, next_seq, submit.device_id, submit.urb_id, StatusCode::NoDevice).await;
        return;
    };

    let Some(transfer_type) = TransferType::from_wire(submit.transfer_type) else {
        complete_with_status(lane_tx, next_seq, submit.device_id, submit.urb_id, StatusCode::InvalidParam).await;
        return;
    };

    let request = UrbRequest {
        device: submit.device_id,
        urb_id: UrbId(submit.urb_id),
        endpoint: submit.endpoint_address,
        transfer_type,
        direction: Direction::from_wire(submit.direction),
        flags: submit.transfer_flags,
        buf_len: submit.buf_len,
        interval: submit.interval,
        setup: setup_packet_from_bytes(submit.setup_packet),
        data_out,
    };

    let (response, rx) = oneshot::channel();
    if bridge
        .send_command(UsbCommand::SubmitUrb {
            index,
            request,
            response,
        })
        .await
        .is_err()
    {
        complete_with_status(lane_tx, next_seq, submit.device_id, submit.urb_id, StatusCode::NoDevice).await;
        return;
    }

    let lane_tx = lane_tx.clone();
    let next_seq = next_seq.clone();
    tokio::spawn(async move {
        let completion = match rx.await {
            Ok(c) => c,
            Err(_) => protocol::types::UrbCompletion {
                device: submit.device_id,
                urb_id: UrbId(submit.urb_id),
                status: StatusCode::NoDevice,
                actual_length: 0,
                data_in: None,
            },
        };
        let seq = next_seq.fetch_add(1, Ordering::Relaxed);
        let message = Message::UrbComplete {
            header: UrbCompleteHeader {
                device_id: completion.device,
                urb_id: completion.urb_id.0,
                status: completion.status as u32,
                actual_length: completion.actual_length,
                error_count: 0,
            },
            data_in: completion.data_in,
        };
        lane_tx.send(Outbound::Frame(message, seq)).await.ok();
    });
}

async fn complete_with_status(
    lane_tx: &mpsc::Sender<Outbound>,
    next_seq: &Arc<AtomicU32>,
    device_id: u32,
    urb_id: u32,
    status: StatusCode,
) {
    let seq = next_seq.fetch_add(1, Ordering::Relaxed);
    let message = Message::UrbComplete {
        header: UrbCompleteHeader {
            device_id,
            urb_id,
            status: status as u32,
            actual_length: 0,
            error_count: 0,
        },
        data_in: None,
    };
    lane_tx.send(Outbound::Frame(message, seq)).await.ok();
}

async fn handle_cancel_urb(bridge: &UsbBridge, devices: &DeviceMap, device: u32, urb_id: u32) {
    let Some(&index) = devices.remote_to_slot.get(&device) else {
        warn!(device, "cancel for unknown remote device id, ignoring");
        return;
    };
    let (response, rx) = oneshot::channel();
    if bridge
        .send_command(UsbCommand::CancelUrb {
            index,
            urb_id: UrbId(urb_id),
            response,
        })
        .await
        .is_err()
    {
        return;
    }
    tokio::spawn(async move {
        let _ = rx.await;
    });
}
