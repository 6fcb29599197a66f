use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{LinkError, LinkResult};

/// Largest datagram we read; device replies are short plaintext.
const MAX_DATAGRAM: usize = 1500;

/// Connectionless, broadcast-capable UDP socket.
pub struct DatagramChannel {
    socket: Option<Arc<UdpSocket>>,
    local_addr: SocketAddr,
    reader: Option<(CancellationToken, JoinHandle<()>)>,
}

impl DatagramChannel {
    pub async fn bind(addr: SocketAddr) -> LinkResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| LinkError::bind(addr, e))?;
        let local_addr = socket.local_addr().map_err(|e| LinkError::bind(addr, e))?;
        Ok(Self {
            socket: Some(Arc::new(socket)),
            local_addr,
            reader: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn enable_broadcast(&self) -> LinkResult<()> {
        let socket = self.socket()?;
        socket
            .set_broadcast(true)
            .map_err(|e| LinkError::bind(self.local_addr, e))
    }

    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> LinkResult<()> {
        let socket = self.socket()?;
        socket
            .send_to(payload, target)
            .await
            .map_err(|e| LinkError::Send {
                addr: target,
                source: e,
            })?;
        Ok(())
    }

    /// Deliver every inbound datagram, in arrival order, as `map(payload, sender)` on `tx`.
    /// Replaces any previously registered handler.
    pub fn on_message<T, F>(&mut self, tx: mpsc::Sender<T>, map: F) -> LinkResult<()>
    where
        T: Send + 'static,
        F: Fn(Vec<u8>, SocketAddr) -> T + Send + 'static,
    {
        let socket = self.socket()?.clone();
        self.abort_reader();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let local = self.local_addr;
        let join = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    res = socket.recv_from(&mut buf) => match res {
                        Ok((len, from)) => {
                            if cancelled.is_cancelled() {
                                break;
                            }
                            if tx.send(map(buf[..len].to_vec(), from)).await.is_err() {
                                break;
                            }
                        }
                        // ICMP port-unreachable from an earlier send surfaces here on some
                        // platforms; it does not mean the socket is dead.
                        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                        Err(e) => {
                            crate::logging::warn_kv(
                                "datagram receive failed",
                                &[("addr", &local.to_string()), ("error", &e.to_string())],
                            );
                            break;
                        }
                    },
                }
            }
        });
        self.reader = Some((token, join));
        Ok(())
    }

    /// Unregister the handler, then release the socket. The reader holds its own reference to
    /// the socket, so this waits for it to exit; the port is free once this returns. Safe to
    /// call repeatedly.
    pub async fn close(&mut self) {
        if let Some((token, join)) = self.reader.take() {
            token.cancel();
            join.abort();
            let _ = join.await;
        }
        self.socket.take();
    }

    fn abort_reader(&mut self) {
        if let Some((token, join)) = self.reader.take() {
            token.cancel();
            join.abort();
        }
    }

    fn socket(&self) -> LinkResult<&Arc<UdpSocket>> {
        self.socket.as_ref().ok_or_else(|| LinkError::Send {
            addr: self.local_addr,
            source: std::io::Error::new(std::io::ErrorKind::NotConnected, "channel closed"),
        })
    }
}

impl Drop for DatagramChannel {
    fn drop(&mut self) {
        self.abort_reader();
        self.socket.take();
    }
}
