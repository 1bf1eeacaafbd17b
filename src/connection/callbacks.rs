//! User callbacks fired by a connection.
//!
//! Handlers run synchronously on the task that raised the event and must not
//! block. A handler that needs to await should spawn.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Error;
use crate::identifiers::ConnectionId;

// ============================================================================
// Types
// ============================================================================

/// Called after a successful connect.
pub type ConnectHandler = Arc<dyn Fn(&ConnectionId) + Send + Sync>;

/// Called after a disconnect with a human-readable reason.
pub type DisconnectHandler = Arc<dyn Fn(&ConnectionId, &str) + Send + Sync>;

/// Called for every new inbound application message.
pub type MessageHandler = Arc<dyn Fn(&ConnectionId, &Value) + Send + Sync>;

/// Called for every recorded error.
pub type ErrorHandler = Arc<dyn Fn(&ConnectionId, &Error) + Send + Sync>;

// ============================================================================
// Callbacks
// ============================================================================

/// Optional event handlers of a connection.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub(crate) on_connect: Option<ConnectHandler>,
    pub(crate) on_disconnect: Option<DisconnectHandler>,
    pub(crate) on_message: Option<MessageHandler>,
    pub(crate) on_error: Option<ErrorHandler>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl Callbacks {
    pub(crate) fn connected(&self, id: &ConnectionId) {
        if let Some(handler) = &self.on_connect {
            handler(id);
        }
    }

    pub(crate) fn disconnected(&self, id: &ConnectionId, reason: &str) {
        if let Some(handler) = &self.on_disconnect {
            handler(id, reason);
        }
    }

    pub(crate) fn message(&self, id: &ConnectionId, message: &Value) {
        if let Some(handler) = &self.on_message {
            handler(id, message);
        }
    }

    pub(crate) fn error(&self, id: &ConnectionId, error: &Error) {
        if let Some(handler) = &self.on_error {
            handler(id, error);
        }
    }
}
