use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::datagram::DatagramChannel;
use crate::error::{LinkError, LinkResult};
use crate::peer::PeerAddress;
use crate::registry::{SessionRegistry, SessionWriter};
use crate::telemetry::LinkStats;

/// A control command. The wire form is the bare string, no terminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Command {
    Forward,
    Backward,
    Left,
    Right,
    On,
    Off,
    FanOn,
    Custom(String),
}

impl Command {
    pub fn parse(raw: &str) -> LinkResult<Self> {
        if raw.trim().is_empty() {
            return Err(LinkError::InvalidCommand(raw.to_string()));
        }
        Ok(match raw {
            "forward" => Command::Forward,
            "backward" => Command::Backward,
            "left" => Command::Left,
            "right" => Command::Right,
            "on" => Command::On,
            "off" => Command::Off,
            "fan_on" => Command::FanOn,
            other => Command::Custom(other.to_string()),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Command::Forward => "forward",
            Command::Backward => "backward",
            Command::Left => "left",
            Command::Right => "right",
            Command::On => "on",
            Command::Off => "off",
            Command::FanOn => "fan_on",
            Command::Custom(s) => s,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Command> for String {
    fn from(c: Command) -> Self {
        c.as_str().to_string()
    }
}

impl TryFrom<String> for Command {
    type Error = LinkError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Command::parse(&s)
    }
}

/// Pick the session commands go to: the first one in registry order. Fails without touching
/// any socket when nothing is connected.
pub fn select_target(registry: &SessionRegistry) -> LinkResult<SessionWriter> {
    registry.first_writer().ok_or(LinkError::NoPeer)
}

/// Sends commands over registered stream sessions.
#[derive(Clone)]
pub struct CommandDispatcher {
    stats: Arc<LinkStats>,
}

impl CommandDispatcher {
    pub fn new(stats: Arc<LinkStats>) -> Self {
        Self { stats }
    }

    /// Write one command. Failures are logged and returned; the session stays registered and
    /// nothing is retried.
    pub async fn send(&self, target: &SessionWriter, command: &Command) -> LinkResult<PeerAddress> {
        let address = target.address();
        let payload = command.as_str().as_bytes();
        match target.write(payload).await {
            Ok(()) => {
                self.stats.on_send(payload.len() as i64);
                crate::logging::info_kv(
                    "command sent",
                    &[("addr", &address.to_string()), ("command", command.as_str())],
                );
                Ok(address)
            }
            Err(err) => {
                crate::logging::link_error("command write failed", &err);
                self.stats.set_last_error(&err);
                Err(err)
            }
        }
    }
}

/// Fire-and-forget datagram commands, for devices that take commands on the discovery port.
pub struct UdpCommandDispatcher {
    channel: DatagramChannel,
    port: u16,
    stats: Arc<LinkStats>,
}

impl UdpCommandDispatcher {
    pub async fn open(port: u16, stats: Arc<LinkStats>) -> LinkResult<Self> {
        let channel =
            DatagramChannel::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
                .await?;
        // Commands may target the broadcast address.
        channel.enable_broadcast()?;
        Ok(Self {
            channel,
            port,
            stats,
        })
    }

    pub async fn send(&self, host: Ipv4Addr, command: &Command) -> LinkResult<()> {
        let target = SocketAddr::V4(SocketAddrV4::new(host, self.port));
        let payload = command.as_str().as_bytes();
        if let Err(err) = self.channel.send_to(payload, target).await {
            crate::logging::link_error("udp command send failed", &err);
            self.stats.set_last_error(&err);
            return Err(err);
        }
        self.stats.on_send(payload.len() as i64);
        crate::logging::info_kv(
            "udp command sent",
            &[("addr", &target.to_string()), ("command", command.as_str())],
        );
        Ok(())
    }

    pub async fn close(&mut self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionHandle;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[test]
    fn parses_known_and_custom_commands() {
        assert_eq!(Command::parse("forward").unwrap(), Command::Forward);
        assert_eq!(Command::parse("fan_on").unwrap(), Command::FanOn);
        assert_eq!(
            Command::parse("speed:3").unwrap(),
            Command::Custom("speed:3".into())
        );
        assert_eq!(Command::FanOn.to_string(), "fan_on");
        assert!(Command::parse("  ").is_err());
    }

    #[test]
    fn empty_registry_is_no_peer() {
        let registry = SessionRegistry::new();
        assert!(matches!(select_target(&registry), Err(LinkError::NoPeer)));
    }

    #[tokio::test]
    async fn sends_bare_command_to_first_session() {
        let (ours, mut device) = tokio::io::duplex(64);
        let address = PeerAddress::new(Ipv4Addr::new(192, 168, 1, 50), 40001);
        let mut registry = SessionRegistry::new();
        registry.add(SessionHandle::spawn(1, address, ours, Duration::from_secs(2)));

        let stats = Arc::new(LinkStats::default());
        let dispatcher = CommandDispatcher::new(stats.clone());
        let target = select_target(&registry).unwrap();
        let sent_to = dispatcher.send(&target, &Command::Left).await.unwrap();
        assert_eq!(sent_to, address);

        let mut buf = [0u8; 4];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"left");
        assert_eq!(stats.snapshot().commands_sent_total, 1);
    }

    #[tokio::test]
    async fn write_failure_keeps_session_registered() {
        let (ours, device) = tokio::io::duplex(64);
        drop(device);
        let address = PeerAddress::new(Ipv4Addr::new(192, 168, 1, 50), 40001);
        let mut registry = SessionRegistry::new();
        registry.add(SessionHandle::spawn(1, address, ours, Duration::from_secs(2)));

        let stats = Arc::new(LinkStats::default());
        let dispatcher = CommandDispatcher::new(stats.clone());
        let target = select_target(&registry).unwrap();
        let err = dispatcher.send(&target, &Command::On).await.unwrap_err();
        assert!(matches!(err, LinkError::Write { .. }));
        assert_eq!(registry.len(), 1);
        assert!(!stats.snapshot().last_error.is_empty());
    }

    #[tokio::test]
    async fn udp_variant_sends_one_datagram() {
        let device = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = device.local_addr().unwrap().port();
        let stats = Arc::new(LinkStats::default());
        let mut dispatcher = UdpCommandDispatcher::open(port, stats).await.unwrap();
        dispatcher
            .send(Ipv4Addr::LOCALHOST, &Command::Forward)
            .await
            .unwrap();

        let mut buf = [0u8; 32];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            device.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buf[..len], b"forward");

        dispatcher.close().await;
        assert!(dispatcher
            .send(Ipv4Addr::LOCALHOST, &Command::Forward)
            .await
            .is_err());
    }
}
