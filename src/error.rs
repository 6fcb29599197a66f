use std::net::SocketAddr;

/// Failures of the link core. None of these are fatal to the process; callers surface them
/// as rejected operations or state transitions.
#[derive(Debug)]
pub enum LinkError {
    /// A socket could not be bound. `in_use` is set when the OS reported address-in-use,
    /// which is the only case the listener retries on its fallback port.
    Bind {
        addr: SocketAddr,
        in_use: bool,
        source: std::io::Error,
    },
    Send {
        addr: SocketAddr,
        source: std::io::Error,
    },
    Write {
        addr: SocketAddr,
        source: std::io::Error,
    },
    /// The session registry is empty; nothing was written.
    NoPeer,
    Listen {
        addr: SocketAddr,
        source: std::io::Error,
    },
    InvalidAddress(String),
    InvalidCommand(String),
    /// A command asked for a delivery path other than `tcp` or `udp`.
    InvalidTarget(String),
    /// The coordinating task is gone (daemon shutting down).
    CoreUnavailable,
}

impl LinkError {
    pub fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        let in_use = source.kind() == std::io::ErrorKind::AddrInUse;
        LinkError::Bind {
            addr,
            in_use,
            source,
        }
    }

    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, LinkError::Bind { in_use: true, .. })
    }

    /// Address the failure relates to, for log lines.
    pub fn addr(&self) -> Option<SocketAddr> {
        match self {
            LinkError::Bind { addr, .. }
            | LinkError::Send { addr, .. }
            | LinkError::Write { addr, .. }
            | LinkError::Listen { addr, .. } => Some(*addr),
            _ => None,
        }
    }
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Bind {
                addr,
                in_use: true,
                ..
            } => write!(f, "bind {addr}: address already in use"),
            LinkError::Bind { addr, source, .. } => write!(f, "bind {addr}: {source}"),
            LinkError::Send { addr, source } => write!(f, "send to {addr}: {source}"),
            LinkError::Write { addr, source } => write!(f, "write to {addr}: {source}"),
            LinkError::NoPeer => write!(f, "no connected peer"),
            LinkError::Listen { addr, source } => write!(f, "listen on {addr}: {source}"),
            LinkError::InvalidAddress(raw) => write!(f, "invalid IPv4 address: {raw:?}"),
            LinkError::InvalidCommand(raw) => write!(f, "invalid command: {raw:?}"),
            LinkError::InvalidTarget(raw) => write!(f, "unknown command target: {raw:?}"),
            LinkError::CoreUnavailable => write!(f, "link core is not running"),
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkError::Bind { source, .. }
            | LinkError::Send { source, .. }
            | LinkError::Write { source, .. }
            | LinkError::Listen { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type LinkResult<T> = std::result::Result<T, LinkError>;
