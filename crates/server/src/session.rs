//! Session manager (C4): accepts client connections, runs one receive
//! task and one send lane per session, and dispatches incoming frames.
//!
//! Grounded on the teacher's per-connection task split (a reader loop and
//! a writer task fed by a bounded channel so writes are never
//! interleaved), generalised from its QUIC bi-stream pairing to one plain
//! TCP stream split into owned halves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protocol::types::{DeviceInfo, LocalDeviceId, SessionId};
use protocol::{FrameHeader, Message, StatusCode};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::pending::{PendingTable, ResolvedUrb};
use crate::registry::Registry;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);

/// A frame queued for a session's send lane. Requests get a fresh
/// sender-assigned sequence number; responses echo the sequence of the
/// request that triggered them (section 4.1).
pub enum Outbound {
    Request(Message),
    Response(Message, u32),
}

/// What the rest of the server needs in order to talk to a live session:
/// a handle into its send lane.
#[derive(Clone)]
pub struct SessionLane {
    pub tx: mpsc::Sender<Outbound>,
}

/// State shared by every session task and the URB router.
pub struct Shared {
    pub registry: AsyncMutex<Registry>,
    pub pending: AsyncMutex<PendingTable>,
    pub sessions: AsyncMutex<HashMap<SessionId, SessionLane>>,
    pub completions: mpsc::UnboundedSender<ResolvedUrb>,
    pub urb_timeout: Duration,
    next_session_id: AtomicU32,
}

impl Shared {
    pub fn new(completions: mpsc::UnboundedSender<ResolvedUrb>, urb_timeout: Duration) -> Self {
        Self {
            registry: AsyncMutex::new(Registry::new()),
            pending: AsyncMutex::new(PendingTable::new()),
            sessions: AsyncMutex::new(HashMap::new()),
            completions,
            urb_timeout,
            next_session_id: AtomicU32::new(1),
        }
    }

    fn allocate_session_id(&self) -> SessionId {
        SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Accept loop: binds `addr` and spawns a task per incoming connection
/// until `shutdown` fires.
pub async fn run_accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let shared = shared.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, shared, shutdown).await {
                                warn!(%peer_addr, "session ended with error: {e}");
                            }
                        });
                    }
                    Err(e) => error!("accept failed: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("accept loop shutting down");
                    return;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) -> protocol::Result<()> {
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = stream.into_split();

    let (header, message) = protocol::read_frame_async(&mut reader, false).await?;
    let (client_version, caps, client_name) = match message {
        Message::Connect {
            client_version,
            caps,
            client_name,
        } => (client_version, caps, client_name),
        other => {
            warn!("expected CONNECT, got {:?}", other.command());
            return Ok(());
        }
    };

    let session_id = shared.allocate_session_id();
    let (tx, mut rx) = mpsc::channel::<Outbound>(protocol::SEND_LANE_CAPACITY);

    shared
        .sessions
        .lock()
        .await
        .insert(session_id, SessionLane { tx: tx.clone() });

    info!(
        session = session_id.0,
        client_name = %client_name,
        client_version,
        caps,
        "session established"
    );

    let writer_handle = tokio::spawn(async move {
        let mut seq_counter: u32 = 1;
        while let Some(item) = rx.recv().await {
            let (msg, seq) = match item {
                Outbound::Request(m) => {
                    let s = seq_counter;
                    seq_counter = seq_counter.wrapping_add(1);
                    (m, s)
                }
                Outbound::Response(m, s) => (m, s),
            };
            if let Err(e) = protocol::write_frame_async(&mut writer, &msg, seq).await {
                warn!(session = session_id.0, "send lane write failed: {e}");
                break;
            }
        }
    });

    tx.send(Outbound::Response(
        Message::ConnectResp {
            status: StatusCode::Success,
            server_version: protocol::CURRENT_VERSION as u32,
            caps,
            session_id: session_id.0,
        },
        header.sequence,
    ))
    .await
    .ok();

    let mut state = SessionState {
        session_id,
        owned_devices: Default::default(),
        next_remote_id: 0,
        local_by_remote: HashMap::new(),
    };

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = tokio::time::Instant::now();

    loop {
        tokio::select! {
            frame = protocol::read_frame_async(&mut reader, false) => {
                match frame {
                    Ok((header, message)) => {
                        last_seen = tokio::time::Instant::now();
                        if matches!(message, Message::Disconnect) {
                            debug!(session = session_id.0, "peer disconnected");
                            break;
                        }
                        if !dispatch(&shared, &mut state, &tx, header, message).await {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(session = session_id.0, "receive loop ending: {e}");
                        send_error(&tx, StatusCode::InvalidParam, 0, 0, &e.to_string()).await;
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > HEARTBEAT_TIMEOUT {
                    warn!(session = session_id.0, "heartbeat timeout, closing session");
                    break;
                }
                if tx.send(Outbound::Request(Message::Ping)).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    drop(tx);
    writer_handle.abort();
    teardown_session(&shared, session_id).await;
    Ok(())
}

struct SessionState {
    session_id: SessionId,
    owned_devices: std::collections::HashSet<LocalDeviceId>,
    next_remote_id: u32,
    local_by_remote: HashMap<u32, LocalDeviceId>,
}

/// Send an `ERROR` frame (§4.1, §7) on the best-effort basis the spec
/// calls for: "send ERROR if possible, then close". `orig_command` and
/// `orig_sequence` are 0 when the triggering frame's header isn't known
/// (e.g. a framing-level decode failure).
async fn send_error(
    tx: &mpsc::Sender<Outbound>,
    code: StatusCode,
    orig_command: u16,
    orig_sequence: u32,
    message: &str,
) {
    tx.send(Outbound::Request(Message::Error {
        code: code as u32,
        orig_command,
        orig_sequence,
        message: message.to_string(),
    }))
    .await
    .ok();
}

/// Dispatch one decoded frame. Returns `false` when the session must be
/// closed after this frame (an `ERROR` reply was already queued).
async fn dispatch(
    shared: &Arc<Shared>,
    state: &mut SessionState,
    tx: &mpsc::Sender<Outbound>,
    header: FrameHeader,
    message: Message,
) -> bool {
    match message {
        Message::Ping => {
            tx.send(Outbound::Response(Message::Pong, header.sequence))
                .await
                .ok();
        }
        Message::Pong => {}
        Message::DeviceAttach { info, descriptors } => {
            handle_attach(shared, state, tx, header.sequence, info, descriptors).await;
        }
        Message::DeviceDetach { local_device_id } => {
            handle_detach(shared, state, LocalDeviceId(local_device_id)).await;
        }
        Message::DeviceList => {
            let snapshot = shared.registry.lock().await.snapshot();
            let devices = snapshot.into_iter().map(|(id, info)| (id.0, info)).collect();
            tx.send(Outbound::Response(
                Message::DeviceListResp {
                    status: StatusCode::Success,
                    devices,
                },
                header.sequence,
            ))
            .await
            .ok();
        }
        Message::UrbComplete { header: complete, data_in } => {
            handle_urb_complete(shared, state, complete, data_in).await;
        }
        Message::Error { code, message, .. } => {
            warn!(
                session = state.session_id.0,
                code, message = %message, "client reported error"
            );
        }
        Message::Unknown { code } => {
            warn!(
                session = state.session_id.0,
                command = %format!("{code:#06x}"),
                "unknown command code from client, closing session"
            );
            send_error(
                tx,
                StatusCode::NotSupported,
                code,
                header.sequence,
                "unknown command",
            )
            .await;
            return false;
        }
        other => {
            warn!(
                session = state.session_id.0,
                command = ?other.command(),
                "unexpected frame from client, closing session"
            );
            let orig_command = other.command().map(|c| c as u16).unwrap_or(0);
            send_error(
                tx,
                StatusCode::InvalidParam,
                orig_command,
                header.sequence,
                "unexpected command for this session role",
            )
            .await;
            return false;
        }
    }
    true
}

async fn handle_attach(
    shared: &Arc<Shared>,
    state: &mut SessionState,
    tx: &mpsc::Sender<Outbound>,
    sequence: u32,
    info: DeviceInfo,
    descriptors: Vec<u8>,
) {
    let remote_id = state.next_remote_id;
    state.next_remote_id += 1;

    let mut registry = shared.registry.lock().await;
    let result = registry.attach(state.session_id, remote_id, info, descriptors);
    drop(registry);

    let (status, local_device_id) = match result {
        Ok(local_id) => {
            state.owned_devices.insert(local_id);
            state.local_by_remote.insert(remote_id, local_id);
            info!(
                session = state.session_id.0,
                local_id = local_id.0,
                remote_id,
                "device attached"
            );
            (StatusCode::Success, local_id.0)
        }
        Err(crate::registry::RegistryError::TooManyDevices(_)) => {
            warn!(session = state.session_id.0, "registry full, rejecting attach");
            (StatusCode::NoMemory, 0)
        }
        Err(crate::registry::RegistryError::InvalidDescriptor(reason)) => {
            warn!(session = state.session_id.0, %reason, "rejecting malformed descriptor");
            (StatusCode::InvalidParam, 0)
        }
    };

    tx.send(Outbound::Response(
        Message::DeviceAttachResp {
            status,
            local_device_id,
        },
        sequence,
    ))
    .await
    .ok();
}

async fn handle_detach(shared: &Arc<Shared>, state: &mut SessionState, local_id: LocalDeviceId) {
    if !state.owned_devices.remove(&local_id) {
        warn!(
            session = state.session_id.0,
            local_id = local_id.0,
            "detach for device not owned by this session, ignoring"
        );
        return;
    }
    state.local_by_remote.retain(|_, v| *v != local_id);

    let resolved = shared
        .pending
        .lock()
        .await
        .purge_device(local_id, StatusCode::Cancelled);
    for r in resolved {
        let _ = shared.completions.send(r);
    }
    shared.registry.lock().await.detach(local_id);
    info!(session = state.session_id.0, local_id = local_id.0, "device detached");
}

async fn handle_urb_complete(
    shared: &Arc<Shared>,
    state: &mut SessionState,
    complete: protocol::messages::UrbCompleteHeader,
    data_in: Option<Vec<u8>>,
) {
    let Some(&local_id) = state.local_by_remote.get(&complete.device_id) else {
        warn!(
            session = state.session_id.0,
            device_id = complete.device_id,
            "completion for unknown remote device id, dropping"
        );
        return;
    };

    let resolved = shared.pending.lock().await.complete(
        local_id,
        protocol::types::UrbId(complete.urb_id),
        StatusCode::from_wire(complete.status),
        complete.actual_length,
        data_in,
    );
    if let Some(r) = resolved {
        let _ = shared.completions.send(r);
    }
}

async fn teardown_session(shared: &Arc<Shared>, session_id: SessionId) {
    shared.sessions.lock().await.remove(&session_id);

    let resolved = shared.pending.lock().await.purge_session(session_id);
    let pending_count = resolved.len();
    for r in resolved {
        let _ = shared.completions.send(r);
    }

    let removed = shared.registry.lock().await.detach_session(session_id);
    info!(
        session = session_id.0,
        devices_removed = removed.len(),
        urbs_cancelled = pending_count,
        "session closed"
    );
}
