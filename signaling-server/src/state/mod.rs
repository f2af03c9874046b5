pub mod presence;
pub mod sync_lock;

pub use presence::{ConnectionPresence, PresenceState};
pub use sync_lock::{ResetToken, SyncLockState, Transition};

use crate::protocol::{ClientMessage, Dispatch, Position, ServerMessage, SyncLockStatus};
use crate::ConnId;

/// Everything the server tracks about live connections. Owned by a single
/// hub task, so no locking is needed here.
#[derive(Debug, Default)]
pub struct ServerState {
    pub presence: PresenceState,
    pub sync_lock: SyncLockState,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> SyncLockStatus {
        self.sync_lock.status(self.presence.count())
    }

    pub fn handle_message(&mut self, conn_id: &ConnId, msg: ClientMessage) -> Transition {
        match msg {
            ClientMessage::JoinPresence { label, user_id } => Transition {
                dispatches: self.presence.register_presence(conn_id, label, user_id),
                schedule_reset: None,
            },
            ClientMessage::TouchStart { x, y } => self.sync_lock.touch_start(conn_id, Position::new(x, y)),
            ClientMessage::TouchMove { x, y } => self.sync_lock.touch_move(conn_id, Position::new(x, y)),
            ClientMessage::TouchEnd => self.sync_lock.touch_end(conn_id),
            ClientMessage::StatusQuery => reply(Dispatch::only(conn_id, self.status().into())),
            ClientMessage::TypingStart { label } => reply(Dispatch::all_except(
                conn_id,
                ServerMessage::UserTyping { label },
            )),
            ClientMessage::TypingEnd => reply(Dispatch::all_except(conn_id, ServerMessage::UserStoppedTyping)),
        }
    }

    /// Clean up when a connection closes: presence first, then any sync lock role.
    pub fn handle_disconnect(&mut self, conn_id: &ConnId) -> Transition {
        let mut dispatches: Vec<Dispatch> = self.presence.remove_presence(conn_id).into_iter().collect();
        let released = self.sync_lock.disconnect(conn_id);
        dispatches.extend(released.dispatches);
        Transition {
            dispatches,
            schedule_reset: released.schedule_reset,
        }
    }
}

fn reply(dispatch: Dispatch) -> Transition {
    Transition {
        dispatches: vec![dispatch],
        schedule_reset: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Recipient, ResetReason};

    fn conn(id: &str) -> ConnId {
        id.to_string()
    }

    #[test]
    fn status_query_reports_presence_and_lock() {
        let mut state = ServerState::new();
        state.handle_message(&conn("a"), ClientMessage::JoinPresence { label: "A".into(), user_id: None });
        state.handle_message(&conn("b"), ClientMessage::JoinPresence { label: "B".into(), user_id: None });
        state.handle_message(&conn("a"), ClientMessage::TouchStart { x: 0.2, y: 0.2 });

        let t = state.handle_message(&conn("b"), ClientMessage::StatusQuery);
        assert_eq!(
            t.dispatches,
            vec![Dispatch::only(
                &conn("b"),
                ServerMessage::SyncStatus {
                    is_active: true,
                    is_unlocked: false,
                    has_partner: false,
                    online_count: 2,
                }
            )]
        );
    }

    #[test]
    fn disconnect_announces_offline_then_resets_lock() {
        let mut state = ServerState::new();
        state.handle_message(&conn("a"), ClientMessage::JoinPresence { label: "A".into(), user_id: None });
        state.handle_message(&conn("a"), ClientMessage::TouchStart { x: 0.2, y: 0.2 });

        let t = state.handle_disconnect(&conn("a"));
        assert_eq!(t.dispatches.len(), 2);
        assert!(matches!(t.dispatches[0].message, ServerMessage::UserOffline { online_count: 0, .. }));
        assert_eq!(
            t.dispatches[1].message,
            ServerMessage::Reset {
                reason: ResetReason::InitiatorDisconnected
            }
        );
        assert!(!state.status().is_active);
    }

    #[test]
    fn disconnect_of_unknown_connection_sends_nothing() {
        let mut state = ServerState::new();
        assert!(state.handle_disconnect(&conn("ghost")).dispatches.is_empty());
    }

    #[test]
    fn typing_is_relayed_to_others() {
        let mut state = ServerState::new();
        let t = state.handle_message(&conn("a"), ClientMessage::TypingStart { label: "A".into() });
        assert_eq!(t.dispatches[0].to, Recipient::AllExcept(conn("a")));
        let t = state.handle_message(&conn("a"), ClientMessage::TypingEnd);
        assert_eq!(t.dispatches[0].message, ServerMessage::UserStoppedTyping);
    }
}
