/// Lifecycle of a language worker channel.
///
/// `Created → Connecting → Initializing → Initialized`, with `Errored`
/// reachable from every other state. Transitions never go backwards and
/// nothing leaves `Errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Process not started yet.
    Created,
    /// Process launched, waiting for `StartStream`.
    Connecting,
    /// `WorkerInitRequest` sent, waiting for the response.
    Initializing,
    /// Worker accepted; loads and invocations may flow.
    Initialized,
    Errored,
}

impl ChannelState {
    const fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Connecting => 1,
            Self::Initializing => 2,
            Self::Initialized => 3,
            Self::Errored => 4,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Errored)
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}
