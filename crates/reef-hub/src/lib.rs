//! Typed channel hub: group fan-out and the tool-status side channel.
//!
//! Replaces ad-hoc global WebSocket maps with a component owning membership
//! and delivery. Fan-out is best-effort: a dead subscriber is logged and
//! dropped, never propagated to the sender.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SUBSCRIBER_BUFFER: usize = 256;

/// Events delivered to group subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupEvent {
    Message {
        group_id: String,
        message: serde_json::Value,
    },
    MemberStatus {
        group_id: String,
        member_id: String,
        presence: String,
    },
    Typing {
        group_id: String,
        member_id: String,
    },
}

/// Per-session tool progress notifications.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatusEvent {
    pub session_id: String,
    pub tool_name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Subscriber<T> {
    member_id: String,
    tx: mpsc::Sender<T>,
}

/// Membership plus fan-out for one event type, keyed by channel id.
pub struct ChannelHub<T: Clone + Send + 'static> {
    channels: Mutex<HashMap<String, Vec<Subscriber<T>>>>,
}

impl<T: Clone + Send + 'static> Default for ChannelHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> ChannelHub<T> {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Join a channel; the returned receiver delivers every event published
    /// after this call. Re-joining with the same member id replaces the old
    /// subscription.
    pub fn join(&self, channel_id: &str, member_id: &str) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut channels = self.channels.lock().unwrap();
        let subs = channels.entry(channel_id.to_string()).or_default();
        subs.retain(|s| s.member_id != member_id);
        subs.push(Subscriber {
            member_id: member_id.to_string(),
            tx,
        });
        debug!(channel_id, member_id, "hub join");
        rx
    }

    pub fn leave(&self, channel_id: &str, member_id: &str) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(subs) = channels.get_mut(channel_id) {
            subs.retain(|s| s.member_id != member_id);
            if subs.is_empty() {
                channels.remove(channel_id);
            }
        }
        debug!(channel_id, member_id, "hub leave");
    }

    pub fn member_count(&self, channel_id: &str) -> usize {
        self.channels
            .lock()
            .unwrap()
            .get(channel_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Deliver to every member of the channel, optionally excluding one
    /// (typically the sender). Dead subscribers are pruned.
    pub fn publish(&self, channel_id: &str, event: T, exclude: Option<&str>) -> usize {
        let targets: Vec<(String, mpsc::Sender<T>)> = {
            let channels = self.channels.lock().unwrap();
            let Some(subs) = channels.get(channel_id) else {
                return 0;
            };
            subs.iter()
                .filter(|s| exclude.map_or(true, |ex| s.member_id != ex))
                .map(|s| (s.member_id.clone(), s.tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (member_id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(channel_id, member_id = %member_id, "subscriber buffer full; event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(member_id);
                }
            }
        }
        if !dead.is_empty() {
            let mut channels = self.channels.lock().unwrap();
            if let Some(subs) = channels.get_mut(channel_id) {
                subs.retain(|s| !dead.contains(&s.member_id));
            }
        }
        delivered
    }
}

/// The two hubs the core shares: group events and tool status.
pub struct Hubs {
    pub groups: ChannelHub<GroupEvent>,
    pub tool_status: ChannelHub<ToolStatusEvent>,
}

impl Default for Hubs {
    fn default() -> Self {
        Self {
            groups: ChannelHub::new(),
            tool_status: ChannelHub::new(),
        }
    }
}
