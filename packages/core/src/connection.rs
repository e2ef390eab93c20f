use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use viewloop_protocol::ServerMessage;

/// Identity of a user, opaque to the core. `anonymous()` is the identity
/// assigned to connections a transport hasn't authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(std::sync::Arc<str>);

impl UserId {
    pub fn new(id: impl Into<std::sync::Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn anonymous() -> Self {
        Self(std::sync::Arc::from("anonymous"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A process-unique identifier handed out to every [`Connection`] so windows
/// can be keyed by `(ConnectionId, WindowId)` without requiring `Connection`
/// itself to be hashable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A single client transport (in practice, a WebSocket). A user may own
/// several connections; one connection may host several windows (spec §3).
pub trait Connection: Send + Sync + fmt::Debug {
    /// Stable identity for this connection, used as a windows-map key.
    fn id(&self) -> ConnectionId;

    /// The user this connection authenticated as, or [`UserId::anonymous`].
    fn user(&self) -> UserId;

    /// Best-effort, non-blocking send. A closed connection silently drops
    /// the message (spec §7, `TransportClosed`).
    fn send(&self, message: ServerMessage);

    /// Whether the transport believes the socket is still open.
    fn is_open(&self) -> bool;
}

pub type ConnectionHandle = std::sync::Arc<dyn Connection>;
