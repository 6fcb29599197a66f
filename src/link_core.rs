//! The coordinating task.
//!
//! All link state (found peers, the listener, the session registry, the lifecycle coordinator)
//! is owned by one task. Socket tasks feed it [`CoreEvent`]s, callers talk to it through a
//! [`CoreHandle`], and it publishes navigation directives on [`Events`]. Nothing else mutates
//! link state, so every event sees a consistent registry and listener.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, Notify};
use tokio::time::Instant;

use crate::config::Config;
use crate::discovery::{DiscoveryEngine, DiscoveryPhase, DiscoverySettings, DiscoveryStatus};
use crate::dispatch::{select_target, Command, CommandDispatcher, UdpCommandDispatcher};
use crate::error::{LinkError, LinkResult};
use crate::events::{event_queue, CoreEvent, EventReceiver, EventSender, Events, Navigation, Screen};
use crate::lifecycle::{AppDirective, AppEvent, LifecycleCoordinator};
use crate::listener::{self, ListenerSettings, ServerInfo, ServerState, StartOutcome};
use crate::peer::{parse_ipv4, DiscoveredPeer, PeerAddress};
use crate::registry::{Session, SessionRegistry, SessionWriter};
use crate::store::StateStore;
use crate::telemetry::{LinkStats, LinkStatsSnapshot};

const REQUEST_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct CoreSettings {
    pub discovery: DiscoverySettings,
    pub listener: ListenerSettings,
    pub broadcast_ip: Option<Ipv4Addr>,
    pub bind_ip: Option<Ipv4Addr>,
    pub debounce: Duration,
    pub stop_on_background: bool,
    pub state_path: PathBuf,
}

impl CoreSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            discovery: DiscoverySettings::from_config(cfg),
            listener: ListenerSettings {
                preferred_port: cfg.listen_port,
                fallback_port: cfg.fallback_port,
                write_timeout: cfg.write_timeout(),
            },
            broadcast_ip: cfg.broadcast_ipv4(),
            bind_ip: cfg.bind_ipv4(),
            debounce: cfg.debounce(),
            stop_on_background: cfg.stop_on_background,
            state_path: cfg.state_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStatus {
    pub screen: Screen,
    pub server: Option<ServerInfo>,
    pub sessions: usize,
    pub discovery: DiscoveryPhase,
    pub peers: usize,
    pub stats: LinkStatsSnapshot,
}

enum Request {
    BeginSearch {
        broadcast: Option<Ipv4Addr>,
        reply: oneshot::Sender<LinkResult<SocketAddr>>,
    },
    CancelSearch {
        reply: oneshot::Sender<()>,
    },
    Discovery {
        reply: oneshot::Sender<DiscoveryStatus>,
    },
    StartServer {
        bind_ip: Option<Ipv4Addr>,
        reply: oneshot::Sender<LinkResult<StartOutcome>>,
    },
    StopServer {
        reply: oneshot::Sender<bool>,
    },
    Target {
        reply: oneshot::Sender<LinkResult<SessionWriter>>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<Session>>,
    },
    Status {
        reply: oneshot::Sender<CoreStatus>,
    },
    App {
        event: AppEvent,
        reply: oneshot::Sender<AppDirective>,
    },
}

/// Cloneable client of the core task.
#[derive(Clone)]
pub struct CoreHandle {
    tx: mpsc::Sender<Request>,
    events: Events,
    stats: Arc<LinkStats>,
    dispatcher: CommandDispatcher,
    udp: Arc<Mutex<Option<UdpCommandDispatcher>>>,
    discovery_port: u16,
}

impl CoreHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> LinkResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| LinkError::CoreUnavailable)?;
        rx.await.map_err(|_| LinkError::CoreUnavailable)
    }

    /// Broadcast the probe. `None` uses the configured broadcast address, then the limited
    /// broadcast address.
    pub async fn begin_search(&self, broadcast: Option<Ipv4Addr>) -> LinkResult<SocketAddr> {
        self.call(|reply| Request::BeginSearch { broadcast, reply })
            .await?
    }

    pub async fn cancel_search(&self) -> LinkResult<()> {
        self.call(|reply| Request::CancelSearch { reply }).await
    }

    pub async fn discovery_status(&self) -> LinkResult<DiscoveryStatus> {
        self.call(|reply| Request::Discovery { reply }).await
    }

    pub async fn peers(&self) -> LinkResult<Vec<DiscoveredPeer>> {
        Ok(self.discovery_status().await?.peers)
    }

    pub async fn start_server(&self, bind_ip: Option<Ipv4Addr>) -> LinkResult<StartOutcome> {
        self.call(|reply| Request::StartServer { bind_ip, reply })
            .await?
    }

    /// Explicit stop. Returns whether a listener was running.
    pub async fn stop_server(&self) -> LinkResult<bool> {
        self.call(|reply| Request::StopServer { reply }).await
    }

    /// Send a command to the first connected session. The write happens on the caller's task so
    /// a slow peer never stalls the core.
    pub async fn send_command(&self, command: &Command) -> LinkResult<PeerAddress> {
        let target = self.call(|reply| Request::Target { reply }).await?;
        let target = match target {
            Ok(t) => t,
            Err(err) => {
                crate::logging::warn_kv(
                    "command not sent",
                    &[("command", command.as_str()), ("error", &err.to_string())],
                );
                return Err(err);
            }
        };
        self.dispatcher.send(&target, command).await
    }

    /// Send a command as one datagram to `host` on the discovery port.
    pub async fn send_udp_command(&self, host: &str, command: &Command) -> LinkResult<()> {
        let host = parse_ipv4(host)?;
        let mut udp = self.udp.lock().await;
        if udp.is_none() {
            *udp = Some(UdpCommandDispatcher::open(self.discovery_port, self.stats.clone()).await?);
        }
        match udp.as_ref() {
            Some(dispatcher) => dispatcher.send(host, command).await,
            None => Err(LinkError::CoreUnavailable),
        }
    }

    pub async fn sessions(&self) -> LinkResult<Vec<Session>> {
        self.call(|reply| Request::Sessions { reply }).await
    }

    pub async fn status(&self) -> LinkResult<CoreStatus> {
        self.call(|reply| Request::Status { reply }).await
    }

    pub async fn app_event(&self, event: AppEvent) -> LinkResult<AppDirective> {
        self.call(|reply| Request::App { event, reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Navigation> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.stats.snapshot()
    }
}

pub struct Core {
    settings: CoreSettings,
    registry: SessionRegistry,
    server: Option<ServerState>,
    listener_generation: u64,
    discovery: DiscoveryEngine,
    lifecycle: LifecycleCoordinator,
    events: Events,
    store: StateStore,
    stats: Arc<LinkStats>,
    event_tx: EventSender,
    event_rx: EventReceiver,
    requests: mpsc::Receiver<Request>,
}

impl Core {
    pub fn new(settings: CoreSettings) -> (Self, CoreHandle) {
        let (event_tx, event_rx) = event_queue();
        let (tx, requests) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let events = Events::new();
        let stats = Arc::new(LinkStats::default());
        let handle = CoreHandle {
            tx,
            events: events.clone(),
            stats: stats.clone(),
            dispatcher: CommandDispatcher::new(stats.clone()),
            udp: Arc::new(Mutex::new(None)),
            discovery_port: settings.discovery.probe_port,
        };
        let core = Self {
            discovery: DiscoveryEngine::new(settings.discovery.clone()),
            lifecycle: LifecycleCoordinator::new(settings.debounce),
            store: StateStore::new(settings.state_path.clone()),
            settings,
            registry: SessionRegistry::new(),
            server: None,
            listener_generation: 0,
            events,
            stats,
            event_tx,
            event_rx,
            requests,
        };
        (core, handle)
    }

    /// Spawn the core on the current runtime.
    pub fn spawn(
        settings: CoreSettings,
        shutdown: Arc<Notify>,
    ) -> (CoreHandle, tokio::task::JoinHandle<()>) {
        let (core, handle) = Core::new(settings);
        let join = tokio::spawn(core.run(shutdown));
        (handle, join)
    }

    /// Process events and requests until `shutdown` fires or every handle is dropped.
    pub async fn run(mut self, shutdown: Arc<Notify>) {
        let notified = shutdown.notified();
        tokio::pin!(notified);
        // Register interest now so a notify_waiters before the first poll is not lost.
        notified.as_mut().enable();

        loop {
            let deadline = self.lifecycle.deadline();
            tokio::select! {
                _ = &mut notified => break,
                Some(event) = self.event_rx.recv() => self.handle_event(event).await,
                req = self.requests.recv() => match req {
                    Some(req) => self.handle_request(req).await,
                    None => break,
                },
                _ = sleep_until(deadline) => self.poll_navigation(),
            }
        }

        if self.server.is_some() || !self.registry.is_empty() {
            self.stop_server().await;
        }
        self.discovery.cancel_search().await;
        crate::logging::info("core stopped");
    }

    async fn handle_request(&mut self, req: Request) {
        match req {
            Request::BeginSearch { broadcast, reply } => {
                let _ = reply.send(self.begin_search(broadcast).await);
            }
            Request::CancelSearch { reply } => {
                self.discovery.cancel_search().await;
                let _ = reply.send(());
            }
            Request::Discovery { reply } => {
                let _ = reply.send(self.discovery.status());
            }
            Request::StartServer { bind_ip, reply } => {
                let _ = reply.send(self.start_server(bind_ip).await);
            }
            Request::StopServer { reply } => {
                let _ = reply.send(self.stop_server().await);
            }
            Request::Target { reply } => {
                let _ = reply.send(select_target(&self.registry));
            }
            Request::Sessions { reply } => {
                let _ = reply.send(self.registry.sessions().to_vec());
            }
            Request::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Request::App { event, reply } => {
                let _ = reply.send(self.app_event(event).await);
            }
        }
    }

    async fn begin_search(&mut self, broadcast: Option<Ipv4Addr>) -> LinkResult<SocketAddr> {
        let broadcast = broadcast
            .or(self.settings.broadcast_ip)
            .unwrap_or(Ipv4Addr::BROADCAST);
        self.discovery.begin_search(broadcast, &self.event_tx).await?;
        Ok(SocketAddr::from((broadcast, self.settings.discovery.probe_port)))
    }

    async fn start_server(&mut self, explicit: Option<Ipv4Addr>) -> LinkResult<StartOutcome> {
        let chosen = match explicit.or(self.settings.bind_ip) {
            Some(ip) => Some(ip),
            None => self.store.load().await.bind_ip,
        };
        let bind_ip = chosen.unwrap_or(Ipv4Addr::UNSPECIFIED);

        let generation = self.listener_generation + 1;
        let outcome = listener::start(
            &mut self.server,
            generation,
            bind_ip,
            self.settings.listener,
            &self.event_tx,
            self.stats.clone(),
        )
        .await;
        match &outcome {
            Ok(StartOutcome::Started(_)) => {
                self.listener_generation = generation;
                self.store.record_running(true, chosen).await;
                self.reevaluate();
            }
            Ok(StartOutcome::AlreadyRunning(_)) => {}
            Err(err) => self.stats.set_last_error(err),
        }
        outcome
    }

    /// Explicit stop: sessions first, then the listener, then an immediate return to setup.
    /// The listener port is free again when this returns.
    async fn stop_server(&mut self) -> bool {
        let closed = self.registry.close_all();
        let was_running = match self.server.take() {
            Some(mut server) => {
                server.close().await;
                true
            }
            None => false,
        };
        self.store.record_running(false, None).await;
        crate::logging::info_kv(
            "server stopped",
            &[
                ("sessions_closed", &closed.to_string()),
                ("was_running", &was_running.to_string()),
            ],
        );
        let screen = self.lifecycle.stopped();
        self.events.publish(screen, "server stopped");
        was_running
    }

    async fn app_event(&mut self, event: AppEvent) -> AppDirective {
        let directive = self.lifecycle.on_app_event(
            event,
            self.server.is_some(),
            self.settings.stop_on_background,
        );
        crate::logging::info_kv(
            "app event",
            &[
                ("event", &format!("{event:?}")),
                ("action", &format!("{directive:?}")),
            ],
        );
        match directive {
            AppDirective::Stop => {
                self.stop_server().await;
            }
            AppDirective::Reevaluate => self.reevaluate(),
            AppDirective::Ignore => {}
        }
        directive
    }

    fn status(&self) -> CoreStatus {
        CoreStatus {
            screen: self.lifecycle.screen(),
            server: self.server.as_ref().map(|s| s.info()),
            sessions: self.registry.len(),
            discovery: self.discovery.phase(),
            peers: self.discovery.peers().len(),
            stats: self.stats.snapshot(),
        }
    }

    async fn handle_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Datagram {
                search,
                from,
                payload,
            } => {
                self.discovery.handle_datagram(search, from, &payload);
            }
            CoreEvent::Accepted {
                listener,
                address,
                handle,
            } => {
                let live = self.server.as_ref().map(|s| s.generation()) == Some(listener);
                if !live {
                    crate::logging::warn_kv(
                        "dropping connection from stopped listener",
                        &[("addr", &address.to_string())],
                    );
                    drop(handle);
                    return;
                }
                if self.registry.add(handle) {
                    crate::logging::info_kv(
                        "session registered",
                        &[
                            ("addr", &address.to_string()),
                            ("sessions", &self.registry.len().to_string()),
                        ],
                    );
                    self.reevaluate();
                }
            }
            CoreEvent::Data {
                session,
                address,
                payload,
            } => {
                let message = String::from_utf8_lossy(&payload).into_owned();
                if self.registry.append_message(session, message.clone()) {
                    crate::logging::info_kv(
                        "message received",
                        &[("addr", &address.to_string()), ("message", &message)],
                    );
                }
            }
            CoreEvent::Closed {
                session,
                address,
                reason,
            } => {
                if self.registry.remove_session(session).is_some() {
                    let reason = reason.unwrap_or_else(|| "peer closed".to_string());
                    crate::logging::info_kv(
                        "session closed",
                        &[("addr", &address.to_string()), ("reason", &reason)],
                    );
                    self.reevaluate();
                }
            }
            CoreEvent::ListenerDown { listener, error } => {
                let live = self.server.as_ref().map(|s| s.generation()) == Some(listener);
                if !live {
                    return;
                }
                crate::logging::error_kv("listener failed", &[("error", &error)]);
                self.stats.set_last_error(&error);
                if let Some(mut server) = self.server.take() {
                    server.close().await;
                }
                self.store.record_running(false, None).await;
                self.reevaluate();
            }
        }
    }

    fn reevaluate(&mut self) {
        let now = Instant::now();
        let directive = self
            .lifecycle
            .observe(self.server.is_some(), self.registry.len(), now);
        if directive.teardown_sessions {
            let closed = self.registry.close_all();
            crate::logging::warn_kv(
                "listener lost, sessions closed",
                &[("count", &closed.to_string())],
            );
            self.lifecycle.observe(self.server.is_some(), 0, now);
        }
    }

    fn poll_navigation(&mut self) {
        if let Some((screen, reason)) = self.lifecycle.poll(Instant::now()) {
            self.events.publish(screen, reason);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn settings(name: &str) -> CoreSettings {
        let dir = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&dir);
        CoreSettings {
            discovery: DiscoverySettings {
                bind_ip: Ipv4Addr::LOCALHOST,
                port: 0,
                probe_port: 12345,
                probe_token: "ESP-ACK".into(),
                noise_tokens: vec!["FAKE-DEVICE".into()],
            },
            listener: ListenerSettings::new(0, 0),
            broadcast_ip: None,
            bind_ip: Some(Ipv4Addr::LOCALHOST),
            debounce: Duration::from_millis(50),
            stop_on_background: true,
            state_path: dir.join(".data").join("state.json"),
        }
    }

    async fn next_nav(rx: &mut broadcast::Receiver<Navigation>) -> Navigation {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn wait_sessions(core: &CoreHandle, n: usize) {
        for _ in 0..100 {
            if core.sessions().await.unwrap().len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {n} sessions");
    }

    #[tokio::test]
    async fn command_without_session_is_no_peer() {
        let shutdown = Arc::new(Notify::new());
        let (core, _join) = Core::spawn(settings("espwizard-rs-core-nopeer"), shutdown.clone());
        let err = core.send_command(&Command::Forward).await.unwrap_err();
        assert!(matches!(err, LinkError::NoPeer));
        shutdown.notify_waiters();
    }

    #[tokio::test]
    async fn connect_message_command_and_explicit_stop() {
        let shutdown = Arc::new(Notify::new());
        let s = settings("espwizard-rs-core-flow");
        let state_path = s.state_path.clone();
        let (core, join) = Core::spawn(s, shutdown.clone());
        let mut nav = core.subscribe();

        let outcome = core.start_server(None).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started(_)));
        assert_eq!(next_nav(&mut nav).await.screen, Screen::Waiting);
        let again = core.start_server(None).await.unwrap();
        assert_eq!(again, StartOutcome::AlreadyRunning(outcome.address()));

        let mut device = tokio::net::TcpStream::connect(outcome.address().socket_addr())
            .await
            .unwrap();
        assert_eq!(next_nav(&mut nav).await.screen, Screen::Control);

        device.write_all(b"speed=3").await.unwrap();
        for _ in 0..100 {
            let sessions = core.sessions().await.unwrap();
            if sessions.first().map(|s| s.messages.len()) == Some(1) {
                assert_eq!(sessions[0].messages[0], "speed=3");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        core.send_command(&Command::FanOn).await.unwrap();
        let mut buf = [0u8; 6];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"fan_on");

        assert!(core.stop_server().await.unwrap());
        let stopped = next_nav(&mut nav).await;
        assert_eq!(stopped.screen, Screen::Setup);
        assert_eq!(stopped.reason, "server stopped");
        let status = core.status().await.unwrap();
        assert!(status.server.is_none());
        assert_eq!(status.sessions, 0);

        let state = StateStore::new(state_path).load().await;
        assert!(!state.server_state.is_running);
        assert_eq!(state.bind_ip, Some(Ipv4Addr::LOCALHOST));

        shutdown.notify_waiters();
        tokio::time::timeout(Duration::from_secs(2), join)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn peer_disconnect_returns_to_waiting() {
        let shutdown = Arc::new(Notify::new());
        let (core, _join) = Core::spawn(settings("espwizard-rs-core-disconnect"), shutdown.clone());
        let mut nav = core.subscribe();
        let addr = core.start_server(None).await.unwrap().address();
        assert_eq!(next_nav(&mut nav).await.screen, Screen::Waiting);

        let device = tokio::net::TcpStream::connect(addr.socket_addr()).await.unwrap();
        wait_sessions(&core, 1).await;
        assert_eq!(next_nav(&mut nav).await.screen, Screen::Control);

        drop(device);
        wait_sessions(&core, 0).await;
        assert_eq!(next_nav(&mut nav).await.screen, Screen::Waiting);
        shutdown.notify_waiters();
    }

    #[tokio::test]
    async fn unmount_stops_a_running_server() {
        let shutdown = Arc::new(Notify::new());
        let (core, _join) = Core::spawn(settings("espwizard-rs-core-unmount"), shutdown.clone());
        core.start_server(None).await.unwrap();
        let directive = core.app_event(AppEvent::ScreenUnmounted).await.unwrap();
        assert_eq!(directive, AppDirective::Stop);
        assert!(core.status().await.unwrap().server.is_none());
        let directive = core.app_event(AppEvent::ScreenUnmounted).await.unwrap();
        assert_eq!(directive, AppDirective::Ignore);
        shutdown.notify_waiters();
    }

    #[tokio::test]
    async fn discovery_collects_replies_over_loopback() {
        let shutdown = Arc::new(Notify::new());
        let device = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut s = settings("espwizard-rs-core-discovery");
        s.discovery.probe_port = device.local_addr().unwrap().port();
        let (core, _join) = Core::spawn(s, shutdown.clone());

        core.begin_search(Some(Ipv4Addr::LOCALHOST)).await.unwrap();
        let mut buf = [0u8; 32];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), device.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"ESP-ACK");
        device.send_to(b"hello", from).await.unwrap();
        device.send_to(b"hello", from).await.unwrap();

        for _ in 0..100 {
            if !core.peers().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Give the duplicate reply time to land.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let peers = core.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].label, "ESP 1");
        assert_eq!(peers[0].last_reply_payload, "hello");

        core.cancel_search().await.unwrap();
        let status = core.discovery_status().await.unwrap();
        assert_eq!(status.phase, DiscoveryPhase::Cancelled);
        assert!(status.peers.is_empty());
        shutdown.notify_waiters();
    }

    #[tokio::test]
    async fn listener_failure_tears_down_and_returns_to_setup() {
        let shutdown = Arc::new(Notify::new());
        let s = settings("espwizard-rs-core-listener-down");
        let state_path = s.state_path.clone();
        let (core, handle) = Core::new(s);
        let inject = core.event_tx.clone();
        let join = tokio::spawn(core.run(shutdown.clone()));
        let mut nav = handle.subscribe();

        let addr = handle.start_server(None).await.unwrap().address();
        assert_eq!(next_nav(&mut nav).await.screen, Screen::Waiting);
        let mut device = tokio::net::TcpStream::connect(addr.socket_addr()).await.unwrap();
        wait_sessions(&handle, 1).await;
        assert_eq!(next_nav(&mut nav).await.screen, Screen::Control);

        // A failure reported by a listener that is no longer live changes nothing.
        inject
            .send(CoreEvent::ListenerDown {
                listener: 99,
                error: "stale".into(),
            })
            .await
            .unwrap();
        assert!(handle.status().await.unwrap().server.is_some());

        inject
            .send(CoreEvent::ListenerDown {
                listener: 1,
                error: "accept failed".into(),
            })
            .await
            .unwrap();
        let mut status = handle.status().await.unwrap();
        for _ in 0..100 {
            if status.server.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = handle.status().await.unwrap();
        }
        assert!(status.server.is_none());
        assert_eq!(status.sessions, 0);

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), device.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        let down = next_nav(&mut nav).await;
        assert_eq!(down.screen, Screen::Setup);
        assert_eq!(down.reason, "server stopped unexpectedly");

        let state = StateStore::new(state_path).load().await;
        assert!(!state.server_state.is_running);
        assert_eq!(state.bind_ip, Some(Ipv4Addr::LOCALHOST));
        assert!(!handle.stats().last_error.is_empty());

        shutdown.notify_waiters();
        tokio::time::timeout(Duration::from_secs(2), join)
            .await
            .unwrap()
            .unwrap();
    }
}
