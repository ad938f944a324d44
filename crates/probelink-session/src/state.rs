use std::fmt;

/// Lifecycle of the session's connection to the device service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Unbound,
    Binding,
    Bound,
    Registering,
    Registered,
    Unregistering,
}

impl ConnectionState {
    /// Whether `self -> next` is an edge of the lifecycle.
    ///
    /// Every state except `Unbound` may fall back to `Unbound` when the
    /// channel drops.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Unbound, Binding)
            | (Binding, Bound)
            | (Bound, Registering)
            | (Registering, Registered)
            | (Registered, Unregistering) => true,
            (Unbound, Unbound) => false,
            (_, Unbound) => true,
            _ => false,
        }
    }

    /// True only once registration succeeded and frames may flow.
    pub fn is_registered(self) -> bool {
        self == ConnectionState::Registered
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Unbound => "unbound",
            ConnectionState::Binding => "binding",
            ConnectionState::Bound => "bound",
            ConnectionState::Registering => "registering",
            ConnectionState::Registered => "registered",
            ConnectionState::Unregistering => "unregistering",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
