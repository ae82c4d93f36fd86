use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use crate::app::error::AppError;
use crate::app::models::ViewerMessage;

/// Text-message primitive of the remote viewer connection.
pub trait ViewerChannel: Send + Sync {
    fn send_text(&self, text: &str) -> Result<(), AppError>;
}

/// Serialises and delivers `message`. Delivery is best-effort: failures are logged and reported
/// as `false`.
pub fn send_message(channel: &dyn ViewerChannel, message: &ViewerMessage) -> bool {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "failed to serialize viewer message");
            return false;
        }
    };
    match channel.send_text(&text) {
        Ok(()) => true,
        Err(err) => {
            warn!(trace_id = %err.trace_id, error = %err, "failed to deliver viewer message");
            false
        }
    }
}

/// Viewer sessions currently attached to a streaming session, keyed by viewer session id.
#[derive(Default)]
pub struct ViewerSessionTable {
    sessions: Mutex<HashMap<String, String>>,
}

impl ViewerSessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str, serial: &str) {
        if let Ok(mut guard) = self.sessions.lock() {
            guard.insert(session_id.to_string(), serial.to_string());
        }
    }

    pub fn deregister(&self, session_id: &str) -> Option<String> {
        self.sessions.lock().ok()?.remove(session_id)
    }

    pub fn serial_for(&self, session_id: &str) -> Option<String> {
        self.sessions.lock().ok()?.get(session_id).cloned()
    }
}
