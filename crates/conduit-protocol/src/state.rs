/// The staged state of a proxied connection.
///
/// Transitions are directed and monotonic, with one exception: CONFIG and
/// PLAY may alternate on modern protocols during a backend switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Handshake,
    Status,
    Login,
    Config,
    Play,
    Closed,
}

impl ConnectionState {
    /// Map the Handshake packet's next-state field. 3 is the transfer intent
    /// (1.20.5+), which enters LOGIN like 2 does.
    pub fn from_handshake_next(next: i32) -> Option<Self> {
        match next {
            1 => Some(ConnectionState::Status),
            2 | 3 => Some(ConnectionState::Login),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_next_state_mapping() {
        assert_eq!(
            ConnectionState::from_handshake_next(1),
            Some(ConnectionState::Status)
        );
        assert_eq!(
            ConnectionState::from_handshake_next(2),
            Some(ConnectionState::Login)
        );
        assert_eq!(
            ConnectionState::from_handshake_next(3),
            Some(ConnectionState::Login)
        );
        assert_eq!(ConnectionState::from_handshake_next(0), None);
        assert_eq!(ConnectionState::from_handshake_next(4), None);
    }
}
