use std::fmt;

/// Health of a conversation's persistent channel.
///
/// `Idle` is the rest state before the first attempt. `Closed` and `Error`
/// may be followed by a scheduled `Connecting`; nothing leads back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
    Error,
}

impl ConnectionStatus {
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Open)
                | (Connecting, Closed)
                | (Connecting, Error)
                | (Open, Closed)
                | (Open, Error)
                | (Closed, Connecting)
                | (Closed, Error)
                | (Error, Connecting)
        )
    }

    pub fn is_open(self) -> bool {
        self == ConnectionStatus::Open
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Open => "open",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an incoming batch goes relative to what the store already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePosition {
    /// Older history placed before current content.
    Prepend,
    /// Live messages placed after current content.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The channel was not open; nothing is queued for later.
    Dropped,
}
