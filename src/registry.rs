use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{LinkError, LinkResult};
use crate::events::SessionId;
use crate::peer::PeerAddress;

const WRITE_QUEUE_DEPTH: usize = 16;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct WriteRequest {
    payload: Vec<u8>,
    ack: oneshot::Sender<std::io::Result<()>>,
}

fn session_closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "session closed")
}

/// Cloneable write side of a session. Writes are serialized by the session's writer task.
#[derive(Debug, Clone)]
pub struct SessionWriter {
    address: PeerAddress,
    tx: mpsc::Sender<WriteRequest>,
    write_timeout: Duration,
}

impl SessionWriter {
    pub fn address(&self) -> PeerAddress {
        self.address
    }

    /// Queue `payload` and wait for the writer task to flush it. A peer that stops reading
    /// turns into a `Write` error after the write timeout.
    pub async fn write(&self, payload: &[u8]) -> LinkResult<()> {
        let (ack, done) = oneshot::channel();
        let request = WriteRequest {
            payload: payload.to_vec(),
            ack,
        };
        let queued = async {
            if self.tx.send(request).await.is_err() {
                return Err(self.closed());
            }
            done.await.map_err(|_| self.closed())
        };
        match tokio::time::timeout(self.write_timeout, queued).await {
            Ok(res) => res?.map_err(|source| LinkError::Write {
                addr: self.address.socket_addr(),
                source,
            }),
            Err(_) => Err(LinkError::Write {
                addr: self.address.socket_addr(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out"),
            }),
        }
    }

    fn closed(&self) -> LinkError {
        LinkError::Write {
            addr: self.address.socket_addr(),
            source: session_closed(),
        }
    }
}

async fn write_payload<W>(sink: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(payload).await?;
    sink.flush().await
}

/// Owner of a live connection's resources.
///
/// The reader side is driven by whoever holds [`SessionHandle::reader_token`]; closing the
/// handle cancels that token first, so no further events fire, and then tears down the writer.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    writer: SessionWriter,
    cancel: CancellationToken,
    writer_task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn spawn<W>(id: SessionId, address: PeerAddress, mut sink: W, write_timeout: Duration) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<WriteRequest>(WRITE_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                let WriteRequest { payload, ack } = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    req = rx.recv() => match req {
                        Some(req) => req,
                        None => break,
                    },
                };
                // A write stuck on a peer that stopped reading must not outlive the session.
                let res = tokio::select! {
                    biased;
                    _ = stop.cancelled() => None,
                    res = write_payload(&mut sink, &payload) => Some(res),
                };
                match res {
                    Some(res) => {
                        let _ = ack.send(res);
                    }
                    None => {
                        let _ = ack.send(Err(session_closed()));
                        return;
                    }
                }
            }
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, sink.shutdown()).await;
        });
        Self {
            id,
            writer: SessionWriter {
                address,
                tx,
                write_timeout,
            },
            cancel,
            writer_task: Some(writer_task),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn address(&self) -> PeerAddress {
        self.writer.address
    }

    pub fn writer(&self) -> SessionWriter {
        self.writer.clone()
    }

    pub fn reader_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop event delivery without releasing the connection yet.
    fn unregister(&self) {
        self.cancel.cancel();
    }

    /// Cancel the session. The writer task abandons any write in flight and drops the sink.
    pub fn close(&mut self) {
        self.unregister();
        self.writer_task.take();
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// A registered connection to a peer, as seen by readers of the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub address: PeerAddress,
    pub messages: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

/// Connected stream peers in connection order.
///
/// `sessions` and `handles` are parallel: index `i` of one always describes the same peer as
/// index `i` of the other, and both always have the same length.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Vec<Session>,
    handles: Vec<SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an accepted connection. A second connection from an address already present
    /// is refused and its handle closed.
    pub fn add(&mut self, handle: SessionHandle) -> bool {
        let address = handle.address();
        if self.position(&address).is_some() {
            crate::logging::warn_kv(
                "session already registered, dropping duplicate",
                &[("addr", &address.to_string())],
            );
            let mut handle = handle;
            handle.close();
            return false;
        }
        self.sessions.push(Session {
            id: handle.id(),
            address,
            messages: Vec::new(),
            connected_at: Utc::now(),
        });
        self.handles.push(handle);
        true
    }

    /// Append an inbound message to the session with this id. Returns false when the session is
    /// gone (the event outlived it).
    pub fn append_message(&mut self, id: SessionId, message: String) -> bool {
        match self.sessions.iter_mut().find(|s| s.id == id) {
            Some(session) => {
                session.messages.push(message);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, address: &PeerAddress) -> Option<Session> {
        let idx = self.position(address)?;
        Some(self.remove_at(idx))
    }

    pub fn remove_session(&mut self, id: SessionId) -> Option<Session> {
        let idx = self.sessions.iter().position(|s| s.id == id)?;
        Some(self.remove_at(idx))
    }

    fn remove_at(&mut self, idx: usize) -> Session {
        let mut handle = self.handles.remove(idx);
        handle.close();
        self.sessions.remove(idx)
    }

    /// Close every session. Event delivery is stopped for all of them before any connection is
    /// released. Returns how many were closed.
    pub fn close_all(&mut self) -> usize {
        for handle in &self.handles {
            handle.unregister();
        }
        let closed = self.handles.len();
        for mut handle in self.handles.drain(..) {
            handle.close();
        }
        self.sessions.clear();
        closed
    }

    pub fn contains_session(&self, id: SessionId) -> bool {
        self.sessions.iter().any(|s| s.id == id)
    }

    pub fn get(&self, address: &PeerAddress) -> Option<&Session> {
        self.sessions.iter().find(|s| &s.address == address)
    }

    /// Writer of the first session in registry order.
    pub fn first_writer(&self) -> Option<SessionWriter> {
        self.handles.first().map(|h| h.writer())
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    fn position(&self, address: &PeerAddress) -> Option<usize> {
        self.sessions.iter().position(|s| &s.address == address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn addr(last: u8, port: u16) -> PeerAddress {
        PeerAddress::new(Ipv4Addr::new(192, 168, 1, last), port)
    }

    fn handle(id: SessionId, address: PeerAddress) -> (SessionHandle, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(256);
        (SessionHandle::spawn(id, address, ours, Duration::from_secs(2)), theirs)
    }

    #[tokio::test]
    async fn add_remove_keeps_handles_in_lockstep() {
        let mut reg = SessionRegistry::new();
        let (h1, _p1) = handle(1, addr(50, 40001));
        let (h2, _p2) = handle(2, addr(51, 40002));
        assert!(reg.add(h1));
        assert!(reg.add(h2));
        assert_eq!(reg.len(), reg.handle_count());

        let (dup, _p3) = handle(3, addr(50, 40001));
        assert!(!reg.add(dup));
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.len(), reg.handle_count());

        let removed = reg.remove(&addr(50, 40001)).unwrap();
        assert_eq!(removed.id, 1);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.len(), reg.handle_count());

        assert!(reg.remove_session(2).is_some());
        assert!(reg.is_empty());
        assert_eq!(reg.handle_count(), 0);
        assert!(reg.remove_session(2).is_none());
    }

    #[tokio::test]
    async fn messages_append_to_matching_session_only() {
        let mut reg = SessionRegistry::new();
        let (h1, _p1) = handle(7, addr(50, 40001));
        reg.add(h1);
        assert!(reg.append_message(7, "speed=3".into()));
        assert!(reg.append_message(7, "speed=4".into()));
        assert!(!reg.append_message(8, "stray".into()));
        assert_eq!(
            reg.get(&addr(50, 40001)).unwrap().messages,
            vec!["speed=3".to_string(), "speed=4".to_string()]
        );
    }

    #[tokio::test]
    async fn first_writer_reaches_the_oldest_session() {
        let mut reg = SessionRegistry::new();
        let (h1, mut p1) = handle(1, addr(50, 40001));
        let (h2, _p2) = handle(2, addr(51, 40002));
        reg.add(h1);
        reg.add(h2);

        let writer = reg.first_writer().unwrap();
        assert_eq!(writer.address(), addr(50, 40001));
        writer.write(b"forward").await.unwrap();

        let mut buf = [0u8; 7];
        p1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"forward");
    }

    #[tokio::test]
    async fn close_all_empties_and_cancels_readers() {
        let mut reg = SessionRegistry::new();
        let (h1, _p1) = handle(1, addr(50, 40001));
        let token = h1.reader_token();
        let writer = h1.writer();
        reg.add(h1);

        assert_eq!(reg.close_all(), 1);
        assert!(reg.is_empty());
        assert_eq!(reg.handle_count(), 0);
        assert!(token.is_cancelled());
        assert!(writer.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn close_abandons_a_stalled_write_and_releases_the_connection() {
        let mut reg = SessionRegistry::new();
        let (ours, mut device) = tokio::io::duplex(8);
        reg.add(SessionHandle::spawn(
            1,
            addr(50, 40001),
            ours,
            Duration::from_secs(30),
        ));
        let writer = reg.first_writer().unwrap();

        // The device never reads, so this write blocks once the pipe buffer is full.
        let pending = tokio::spawn(async move { writer.write(&[b'x'; 64]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        reg.close_all();
        let res = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("write still pending after close")
            .unwrap();
        assert!(matches!(res, Err(LinkError::Write { .. })));

        // Our end is gone, so the device's writes fail.
        let released = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if device.write_all(b"ping").await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(released.is_ok(), "connection still open after close");
    }

    #[tokio::test]
    async fn stalled_peer_times_out_as_write_error() {
        let (ours, _device) = tokio::io::duplex(8);
        let handle = SessionHandle::spawn(1, addr(50, 40001), ours, Duration::from_millis(100));
        let writer = handle.writer();

        let err = writer.write(&[b'x'; 64]).await.unwrap_err();
        match err {
            LinkError::Write { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::TimedOut)
            }
            other => panic!("expected Write, got {other:?}"),
        }
        assert!(!handle.is_closed());
    }
}
