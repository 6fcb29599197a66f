use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{LinkError, LinkResult};
use crate::events::{CoreEvent, EventSender, SessionId};
use crate::peer::PeerAddress;
use crate::registry::SessionHandle;
use crate::telemetry::LinkStats;

const READ_BUFFER: usize = 4096;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    pub preferred_port: u16,
    pub fallback_port: u16,
    /// Applied to every accepted session's writer.
    pub write_timeout: Duration,
}

impl ListenerSettings {
    pub fn new(preferred_port: u16, fallback_port: u16) -> Self {
        Self {
            preferred_port,
            fallback_port,
            write_timeout: Duration::from_millis(crate::config::DEFAULT_WRITE_TIMEOUT_MS),
        }
    }
}

/// The running connection listener. At most one exists at a time.
#[derive(Debug)]
pub struct ServerState {
    generation: u64,
    bound: PeerAddress,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub bound: PeerAddress,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn bound_address(&self) -> PeerAddress {
        self.bound
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            bound: self.bound,
            started_at: self.started_at,
        }
    }

    /// Stop accepting and release the port. The accept task owns the socket, so this waits
    /// for it to finish; the port is free once this returns.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for ServerState {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(PeerAddress),
    AlreadyRunning(PeerAddress),
}

impl StartOutcome {
    pub fn address(&self) -> PeerAddress {
        match self {
            StartOutcome::Started(a) | StartOutcome::AlreadyRunning(a) => *a,
        }
    }
}

/// Bind the preferred port; when it is in use, try the fallback port exactly once.
pub async fn bind_with_fallback(
    bind_ip: Ipv4Addr,
    settings: ListenerSettings,
) -> LinkResult<TcpListener> {
    let preferred = SocketAddr::V4(SocketAddrV4::new(bind_ip, settings.preferred_port));
    let err = match TcpListener::bind(preferred).await {
        Ok(listener) => return Ok(listener),
        Err(e) => LinkError::bind(preferred, e),
    };
    if !err.is_addr_in_use() {
        crate::logging::link_error("listener bind failed", &err);
        return Err(into_listen(err));
    }

    let fallback = SocketAddr::V4(SocketAddrV4::new(bind_ip, settings.fallback_port));
    crate::logging::warn_kv(
        "listener port in use, trying fallback",
        &[
            ("addr", &preferred.to_string()),
            ("fallback", &fallback.to_string()),
        ],
    );
    match TcpListener::bind(fallback).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            let err = LinkError::bind(fallback, e);
            crate::logging::link_error("listener fallback bind failed", &err);
            Err(into_listen(err))
        }
    }
}

fn into_listen(err: LinkError) -> LinkError {
    match err {
        LinkError::Bind { addr, source, .. } => LinkError::Listen { addr, source },
        other => other,
    }
}

/// Start listening unless a listener is already live.
pub async fn start(
    server: &mut Option<ServerState>,
    generation: u64,
    bind_ip: Ipv4Addr,
    settings: ListenerSettings,
    events: &EventSender,
    stats: Arc<LinkStats>,
) -> LinkResult<StartOutcome> {
    if let Some(existing) = server.as_ref() {
        crate::logging::info_kv(
            "listener already running",
            &[("addr", &existing.bound.to_string())],
        );
        return Ok(StartOutcome::AlreadyRunning(existing.bound));
    }

    let listener = bind_with_fallback(bind_ip, settings).await?;
    let local = listener.local_addr().map_err(|source| LinkError::Listen {
        addr: SocketAddr::V4(SocketAddrV4::new(bind_ip, settings.preferred_port)),
        source,
    })?;
    let bound = PeerAddress::from_socket(local).unwrap_or(PeerAddress::new(bind_ip, local.port()));

    let cancel = CancellationToken::new();
    let accept_task = tokio::spawn(accept_loop(
        listener,
        generation,
        settings.write_timeout,
        cancel.clone(),
        events.clone(),
        stats,
    ));
    crate::logging::info_kv("listener started", &[("addr", &bound.to_string())]);

    *server = Some(ServerState {
        generation,
        bound,
        started_at: Utc::now(),
        cancel,
        accept_task: Some(accept_task),
    });
    Ok(StartOutcome::Started(bound))
}

async fn accept_loop(
    listener: TcpListener,
    generation: u64,
    write_timeout: Duration,
    cancel: CancellationToken,
    events: EventSender,
    stats: Arc<LinkStats>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, remote)) => {
                let Some(address) = PeerAddress::from_socket(remote) else {
                    crate::logging::warn_kv(
                        "rejecting non-IPv4 connection",
                        &[("remote", &remote.to_string())],
                    );
                    continue;
                };
                let _ = stream.set_nodelay(true);
                let (read, write) = stream.into_split();
                let id = next_session_id();
                let handle = SessionHandle::spawn(id, address, write, write_timeout);
                let reader_token = handle.reader_token();
                crate::logging::info_kv(
                    "connection accepted",
                    &[("addr", &address.to_string()), ("session", &id.to_string())],
                );
                // Accepted is queued before the reader starts so its events follow it.
                if events
                    .send(CoreEvent::Accepted {
                        listener: generation,
                        address,
                        handle,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::spawn(read_loop(
                    read,
                    id,
                    address,
                    reader_token,
                    events.clone(),
                    stats.clone(),
                ));
            }
            Err(e) if is_transient_accept_error(&e) => {
                crate::logging::warn_kv("accept failed, retrying", &[("error", &e.to_string())]);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
            Err(e) => {
                if !cancel.is_cancelled() {
                    let _ = events
                        .send(CoreEvent::ListenerDown {
                            listener: generation,
                            error: e.to_string(),
                        })
                        .await;
                }
                return;
            }
        }
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock
    ) || e.raw_os_error() == Some(24) // EMFILE
}

async fn read_loop(
    mut read: OwnedReadHalf,
    session: SessionId,
    address: PeerAddress,
    cancel: CancellationToken,
    events: EventSender,
    stats: Arc<LinkStats>,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    let reason = loop {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            res = read.read(&mut buf) => res,
        };
        match res {
            Ok(0) => break None,
            Ok(n) => {
                stats.on_recv(n as i64);
                if cancel.is_cancelled() {
                    return;
                }
                let event = CoreEvent::Data {
                    session,
                    address,
                    payload: buf[..n].to_vec(),
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => break Some(e.to_string()),
        }
    };
    if cancel.is_cancelled() {
        return;
    }
    let _ = events
        .send(CoreEvent::Closed {
            session,
            address,
            reason,
        })
        .await;
}
