use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::info;

use crate::protocol::{Dispatch, PresenceEntry, ServerMessage};
use crate::ConnId;

#[derive(Debug, Clone)]
pub struct ConnectionPresence {
    pub label: String,
    pub user_id: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl ConnectionPresence {
    fn entry(&self) -> PresenceEntry {
        PresenceEntry {
            label: self.label.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

/// Presence state (who is online, keyed by connection)
#[derive(Debug, Default)]
pub struct PresenceState {
    pub presence_conns: HashMap<ConnId, ConnectionPresence>,
}

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.presence_conns.len()
    }

    /// Roster ordered by join time.
    pub fn roster(&self) -> Vec<PresenceEntry> {
        let mut conns: Vec<&ConnectionPresence> = self.presence_conns.values().collect();
        conns.sort_by_key(|p| p.joined_at);
        conns.into_iter().map(ConnectionPresence::entry).collect()
    }

    pub fn register_presence(
        &mut self,
        conn_id: &ConnId,
        label: String,
        user_id: Option<String>,
    ) -> Vec<Dispatch> {
        self.register_presence_at(conn_id, label, user_id, Utc::now())
    }

    pub(crate) fn register_presence_at(
        &mut self,
        conn_id: &ConnId,
        label: String,
        user_id: Option<String>,
        joined_at: DateTime<Utc>,
    ) -> Vec<Dispatch> {
        self.presence_conns.insert(
            conn_id.clone(),
            ConnectionPresence {
                label: label.clone(),
                user_id: user_id.clone(),
                joined_at,
            },
        );
        info!("{} is online ({} connected)", label, self.count());

        vec![
            Dispatch::all(ServerMessage::UserOnline {
                label,
                user_id,
                online_count: self.count(),
            }),
            Dispatch::only(conn_id, ServerMessage::PresenceSync { users: self.roster() }),
        ]
    }

    /// Returns `None` when the connection never joined presence.
    pub fn remove_presence(&mut self, conn_id: &ConnId) -> Option<Dispatch> {
        let gone = self.presence_conns.remove(conn_id)?;
        info!("{} went offline ({} connected)", gone.label, self.count());

        Some(Dispatch::all(ServerMessage::UserOffline {
            label: gone.label,
            user_id: gone.user_id,
            online_count: self.count(),
        }))
    }
}
