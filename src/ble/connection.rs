//! Connection state machine.
//!
//! A session moves `Disconnected -> Connecting -> Connected ->
//! DiscoveringServices -> DiscoveringCharacteristics -> Ready`. Any live state
//! may fall through `Disconnecting` back to `Disconnected`.

/// Connection state for a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the device.
    #[default]
    Disconnected,
    /// Connect request issued, waiting for the radio.
    Connecting,
    /// Link is up, discovery not started yet.
    Connected,
    /// Waiting for the service list.
    DiscoveringServices,
    /// Waiting for per-service characteristic lists.
    DiscoveringCharacteristics,
    /// Fully discovered; reads and writes are allowed.
    Ready,
    /// Teardown in progress.
    Disconnecting,
}

impl ConnectionState {
    /// Check if the link is up (any state between `Connected` and `Ready`).
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connected
                | Self::DiscoveringServices
                | Self::DiscoveringCharacteristics
                | Self::Ready
        )
    }

    /// Check if steady-state protocol operations are permitted.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::DiscoveringServices
                | Self::DiscoveringCharacteristics
                | Self::Disconnecting
        )
    }

    /// Check if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected) | (Connecting, Disconnected) => true,
            (Connected, DiscoveringServices) => true,
            (DiscoveringServices, DiscoveringCharacteristics) => true,
            (DiscoveringCharacteristics, Ready) => true,
            (Disconnecting, Disconnected) => true,
            (Disconnected, Disconnecting) | (Disconnecting, Disconnecting) => false,
            (_, Disconnecting) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::DiscoveringCharacteristics => write!(f, "DiscoveringCharacteristics"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Ready.is_connected());
        assert!(!ConnectionState::Disconnecting.is_connected());

        assert!(ConnectionState::Ready.is_ready());
        assert!(!ConnectionState::DiscoveringCharacteristics.is_ready());

        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(ConnectionState::Disconnecting.is_transitioning());
        assert!(!ConnectionState::Ready.is_transitioning());
    }

    #[test]
    fn test_forward_transitions() {
        use ConnectionState::*;

        let path = [
            Disconnected,
            Connecting,
            Connected,
            DiscoveringServices,
            DiscoveringCharacteristics,
            Ready,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }

        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Connected.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Connecting));
    }

    #[test]
    fn test_teardown_transitions() {
        use ConnectionState::*;

        for state in [Connecting, Connected, DiscoveringServices, DiscoveringCharacteristics, Ready] {
            assert!(state.can_transition_to(Disconnecting));
        }
        assert!(Disconnecting.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Disconnecting));
        assert!(Connecting.can_transition_to(Disconnected));
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::DiscoveringServices.to_string(), "DiscoveringServices");
    }
}
