//! Session event system.
//!
//! Events complement the [`ConnectionState`](lifeband_types::ConnectionState)
//! watch channel: the watch carries the current state, while events carry
//! edge-triggered occurrences an observer must not miss (a device-initiated
//! link loss, a terminal reconnect notice). All events are serializable for
//! logging and IPC.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use lifeband_types::DeviceIdentity;

/// Events emitted by a session.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEvent {
    /// A device was observed during scanning.
    Discovered { device: DeviceIdentity },
    /// The link was established and streaming started.
    Connected { device: DeviceIdentity },
    /// The band closed the link (device-initiated). This is the sole
    /// trigger for the reconnection policy.
    ConnectionLost { error: Option<String> },
    /// A reconnect attempt is starting.
    ReconnectStarted { attempt: u32, max_attempts: u32 },
    /// The bounded retry budget is exhausted. The one condition promoted
    /// to a user-visible, dismissible notice: manual intervention is
    /// required.
    ReconnectExhausted { attempts: u32 },
}

/// Sender for session events.
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Receiver for session events.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}
