//! Who the engine acts as when talking to the backend.

use std::fmt;

use uuid::Uuid;

/// Either an authenticated user credential or an anonymous guest id, never both.
#[derive(Clone, PartialEq, Eq)]
pub enum Identity {
    User { credential: String },
    Guest { guest_id: String },
}

impl Identity {
    pub fn user(credential: impl Into<String>) -> Self {
        Self::User {
            credential: credential.into(),
        }
    }

    pub fn guest(guest_id: impl Into<String>) -> Self {
        Self::Guest {
            guest_id: guest_id.into(),
        }
    }

    pub fn new_guest() -> Self {
        Self::guest(Uuid::new_v4().to_string())
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Self::Guest { .. })
    }

    /// Query parameter embedded in the channel URL.
    pub(crate) fn channel_query(&self) -> (&'static str, &str) {
        match self {
            Self::User { credential } => ("token", credential),
            Self::Guest { guest_id } => ("guestId", guest_id),
        }
    }
}

// Credentials stay out of logs.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User { .. } => f.write_str("Identity::User { credential: <redacted> }"),
            Self::Guest { guest_id } => write!(f, "Identity::Guest {{ guest_id: {guest_id} }}"),
        }
    }
}

/// Read-only source of the current identity. Raising or clearing a session is
/// somebody else's job.
pub trait IdentityProvider: Send + Sync {
    fn identity(&self) -> Identity;
}

pub struct StaticIdentity(pub Identity);

impl IdentityProvider for StaticIdentity {
    fn identity(&self) -> Identity {
        self.0.clone()
    }
}
