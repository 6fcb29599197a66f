use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::datagram::DatagramChannel;
use crate::error::LinkResult;
use crate::events::{CoreEvent, EventSender};
use crate::peer::{DiscoveredPeer, PeerAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryPhase {
    Idle,
    Searching,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub bind_ip: Ipv4Addr,
    /// Port the discovery socket binds to.
    pub port: u16,
    /// Port devices listen on for the probe. Same as `port` outside of tests.
    pub probe_port: u16,
    pub probe_token: String,
    pub noise_tokens: Vec<String>,
}

impl DiscoverySettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            bind_ip: Ipv4Addr::UNSPECIFIED,
            port: cfg.discovery_port,
            probe_port: cfg.discovery_port,
            probe_token: cfg.probe_token.clone(),
            noise_tokens: cfg.noise_tokens.clone(),
        }
    }

    /// Probe echoes, empty datagrams and known filler are not device replies.
    pub fn is_noise(&self, payload: &str) -> bool {
        payload.is_empty()
            || payload == self.probe_token
            || self.noise_tokens.iter().any(|t| t == payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Added,
    Updated,
}

/// Found peers in first-seen order, one entry per sender address.
#[derive(Debug, Default, Clone)]
pub struct FoundPeers {
    peers: Vec<DiscoveredPeer>,
}

impl FoundPeers {
    pub fn record(&mut self, address: PeerAddress, payload: &str, now: DateTime<Utc>) -> ReplyOutcome {
        if let Some(existing) = self.peers.iter_mut().find(|p| p.address == address) {
            // Label stays as first assigned so visible entries never renumber.
            existing.last_reply_payload = payload.to_string();
            existing.last_seen = now;
            return ReplyOutcome::Updated;
        }
        let label = format!("ESP {}", self.peers.len() + 1);
        self.peers.push(DiscoveredPeer {
            address,
            label,
            last_reply_payload: payload.to_string(),
            first_seen: now,
            last_seen: now,
        });
        ReplyOutcome::Added
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn as_slice(&self) -> &[DiscoveredPeer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryStatus {
    pub phase: DiscoveryPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<SocketAddr>,
    pub peers: Vec<DiscoveredPeer>,
}

/// Broadcast-and-collect discovery.
///
/// Replies arrive as [`CoreEvent::Datagram`] on the core's event queue and are applied with
/// [`DiscoveryEngine::handle_datagram`]. Each search gets a fresh generation number so
/// datagrams still queued from a cancelled search are dropped.
pub struct DiscoveryEngine {
    settings: DiscoverySettings,
    phase: DiscoveryPhase,
    search: u64,
    channel: Option<DatagramChannel>,
    target: Option<SocketAddr>,
    found: FoundPeers,
}

impl DiscoveryEngine {
    pub fn new(settings: DiscoverySettings) -> Self {
        Self {
            settings,
            phase: DiscoveryPhase::Idle,
            search: 0,
            channel: None,
            target: None,
            found: FoundPeers::default(),
        }
    }

    pub fn phase(&self) -> DiscoveryPhase {
        self.phase
    }

    pub fn peers(&self) -> &[DiscoveredPeer] {
        self.found.as_slice()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.channel.as_ref().map(|c| c.local_addr())
    }

    pub fn status(&self) -> DiscoveryStatus {
        DiscoveryStatus {
            phase: self.phase,
            target: self.target,
            peers: self.found.as_slice().to_vec(),
        }
    }

    /// Open the discovery socket and broadcast the probe. A running search is restarted.
    pub async fn begin_search(&mut self, broadcast: Ipv4Addr, events: &EventSender) -> LinkResult<()> {
        self.close_channel().await;
        self.found.clear();
        self.search += 1;
        self.phase = DiscoveryPhase::Idle;

        let bind_addr = SocketAddr::V4(SocketAddrV4::new(self.settings.bind_ip, self.settings.port));
        let target = SocketAddr::V4(SocketAddrV4::new(broadcast, self.settings.probe_port));

        let mut channel = match DatagramChannel::bind(bind_addr).await {
            Ok(c) => c,
            Err(err) => {
                crate::logging::link_error("discovery bind failed", &err);
                return Err(err);
            }
        };
        if let Err(err) = channel.enable_broadcast() {
            crate::logging::link_error("discovery enable broadcast failed", &err);
            return Err(err);
        }

        // Handler goes in before the probe so no early reply is missed.
        let search = self.search;
        channel.on_message(events.clone(), move |payload, from| CoreEvent::Datagram {
            search,
            from,
            payload,
        })?;

        if let Err(err) = channel
            .send_to(self.settings.probe_token.as_bytes(), target)
            .await
        {
            crate::logging::link_error("discovery probe send failed", &err);
            channel.close().await;
            return Err(err);
        }

        crate::logging::info_kv(
            "discovery started",
            &[
                ("target", &target.to_string()),
                ("local", &channel.local_addr().to_string()),
            ],
        );
        self.channel = Some(channel);
        self.target = Some(target);
        self.phase = DiscoveryPhase::Searching;
        Ok(())
    }

    /// Apply one inbound datagram. Returns `None` when it was ignored.
    pub fn handle_datagram(
        &mut self,
        search: u64,
        from: SocketAddr,
        payload: &[u8],
    ) -> Option<ReplyOutcome> {
        if search != self.search || self.phase != DiscoveryPhase::Searching {
            return None;
        }
        let text = String::from_utf8_lossy(payload);
        if self.settings.is_noise(&text) {
            return None;
        }
        let Some(address) = PeerAddress::from_socket(from) else {
            crate::logging::warn_kv("discovery reply from non-IPv4 sender", &[("from", &from.to_string())]);
            return None;
        };
        let outcome = self.found.record(address, &text, Utc::now());
        if outcome == ReplyOutcome::Added {
            crate::logging::info_kv(
                "discovered device",
                &[("addr", &address.to_string()), ("payload", &text)],
            );
        }
        Some(outcome)
    }

    pub async fn cancel_search(&mut self) {
        self.close_channel().await;
        self.found.clear();
        self.target = None;
        if self.phase == DiscoveryPhase::Searching {
            crate::logging::info("discovery cancelled");
        }
        self.phase = DiscoveryPhase::Cancelled;
    }

    async fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
    }
}
