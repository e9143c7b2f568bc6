use conduit_protocol::{CodecError, FrameError, PacketKind};
use thiserror::Error;

use crate::auth::AuthError;

/// Session-layer error. The variants map onto the handling policy: protocol
/// violations close silently, auth failures kick with a reason, unreachable
/// backends route to a fallback, overload kicks immediately, and anything
/// else is logged and closed without taking the proxy down.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("protocol violation: {0}")]
    Violation(&'static str),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("packet {0:?} is not mapped for this version and state")]
    Unmapped(PacketKind),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend refused the login: {0}")]
    BackendKicked(String),
    #[error("backend requested encryption; backends must run in offline mode")]
    OnlineModeBackend,
    #[error("modern forwarding requires a 1.13+ client")]
    ForwardingUnsupported,
    #[error("a server switch is already in flight")]
    SwitchInFlight,
    #[error("timed out")]
    Timeout,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Errors that end the session without any message to the client.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            ProxyError::Violation(_)
                | ProxyError::Frame(_)
                | ProxyError::Codec(_)
                | ProxyError::Io(_)
        )
    }
}
