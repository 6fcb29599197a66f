use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::peer::PeerAddress;
use crate::registry::SessionHandle;

/// Capacity of the socket event queue feeding the coordinating task.
pub const EVENT_QUEUE_DEPTH: usize = 256;

pub type SessionId = u64;

/// Socket activity, produced by reader/accept tasks and consumed by the core task only.
///
/// Every variant is tagged with the generation of the resource that produced it, so events
/// still queued when that resource is torn down can be recognised and dropped.
#[derive(Debug)]
pub enum CoreEvent {
    Datagram {
        search: u64,
        from: SocketAddr,
        payload: Vec<u8>,
    },
    Accepted {
        listener: u64,
        address: PeerAddress,
        handle: SessionHandle,
    },
    Data {
        session: SessionId,
        address: PeerAddress,
        payload: Vec<u8>,
    },
    Closed {
        session: SessionId,
        address: PeerAddress,
        reason: Option<String>,
    },
    ListenerDown {
        listener: u64,
        error: String,
    },
}

pub type EventSender = mpsc::Sender<CoreEvent>;
pub type EventReceiver = mpsc::Receiver<CoreEvent>;

pub fn event_queue() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_QUEUE_DEPTH)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Screen {
    Setup,
    Waiting,
    Control,
}

impl Screen {
    pub fn as_str(&self) -> &'static str {
        match self {
            Screen::Setup => "setup",
            Screen::Waiting => "waiting",
            Screen::Control => "control",
        }
    }
}

/// Directive for the UI to show a screen.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Navigation {
    pub screen: Screen,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Fan-out of navigation directives to UI subscribers.
#[derive(Clone)]
pub struct Events {
    sender: broadcast::Sender<Navigation>,
}

impl Events {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(32);
        Self { sender }
    }

    pub fn publish(&self, screen: Screen, reason: &str) {
        crate::logging::info_kv(
            "navigate",
            &[("screen", screen.as_str()), ("reason", reason)],
        );
        // No subscribers is fine; the UI may not be attached yet.
        let _ = self.sender.send(Navigation {
            screen,
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Navigation> {
        self.sender.subscribe()
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_navigation() {
        let events = Events::new();
        let mut rx = events.subscribe();
        events.publish(Screen::Control, "peer connected");
        let nav = rx.recv().await.unwrap();
        assert_eq!(nav.screen, Screen::Control);
        assert_eq!(nav.reason, "peer connected");
    }

    #[test]
    fn screen_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Screen::Waiting).unwrap(), "\"waiting\"");
    }
}
