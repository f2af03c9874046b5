use serde::{Deserialize, Serialize};

use crate::ConnId;

// ============================================
// WebSocket Messages
// ============================================

/// Normalized pointer position inside the touch surface, both axes in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Pulls both axes back into the unit square. Clients on odd layouts can
    /// report slightly negative or >1 offsets when the finger slides off the
    /// touch region.
    pub fn clamped(self) -> Self {
        Self {
            x: self.x.clamp(0.0, 1.0),
            y: self.y.clamp(0.0, 1.0),
        }
    }
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Announce this connection as an online participant
    JoinPresence {
        #[serde(alias = "username", alias = "connectionLabel")]
        label: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    TouchStart { x: f64, y: f64 },
    TouchMove { x: f64, y: f64 },
    TouchEnd,
    StatusQuery,
    TypingStart { label: String },
    TypingEnd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    InitiatorReleased,
    InitiatorDisconnected,
}

/// Snapshot returned for `status_query` and the REST status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLockStatus {
    pub is_active: bool,
    pub is_unlocked: bool,
    pub has_partner: bool,
    pub online_count: usize,
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    // ============================
    // Presence
    // ============================
    UserOnline {
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        online_count: usize,
    },
    UserOffline {
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        online_count: usize,
    },
    /// Full roster, sent only to the connection that just joined. Wrapped in
    /// `users` because the `type` tag needs an object to live in.
    PresenceSync { users: Vec<PresenceEntry> },

    // ============================
    // Sync lock
    // ============================
    PartnerTouching { position: Position, waiting: bool },
    PartnerPosition { partner_position: Position },
    AlignmentFeedback {
        your_position: Position,
        target_position: Position,
        is_aligned: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distance: Option<f64>,
    },
    Unlocked { success: bool, message: String },
    PartnerReleased,
    Reset { reason: ResetReason },
    SyncStatus {
        is_active: bool,
        is_unlocked: bool,
        has_partner: bool,
        online_count: usize,
    },

    // ============================
    // Typing indicators
    // ============================
    UserTyping { label: String },
    UserStoppedTyping,

    /// Error message from server
    Error { message: String },
}

impl From<SyncLockStatus> for ServerMessage {
    fn from(status: SyncLockStatus) -> Self {
        ServerMessage::SyncStatus {
            is_active: status.is_active,
            is_unlocked: status.is_unlocked,
            has_partner: status.has_partner,
            online_count: status.online_count,
        }
    }
}

/// Who should receive a [`ServerMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    All,
    AllExcept(ConnId),
    Only(ConnId),
}

impl Recipient {
    pub fn includes(&self, conn_id: &ConnId) -> bool {
        match self {
            Recipient::All => true,
            Recipient::AllExcept(skip) => skip != conn_id,
            Recipient::Only(target) => target == conn_id,
        }
    }
}

/// A message paired with its addressing, produced by state handlers and
/// delivered by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub to: Recipient,
    pub message: ServerMessage,
}

impl Dispatch {
    pub fn all(message: ServerMessage) -> Self {
        Self { to: Recipient::All, message }
    }

    pub fn all_except(conn_id: &ConnId, message: ServerMessage) -> Self {
        Self {
            to: Recipient::AllExcept(conn_id.clone()),
            message,
        }
    }

    pub fn only(conn_id: &ConnId, message: ServerMessage) -> Self {
        Self {
            to: Recipient::Only(conn_id.clone()),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_presence_accepts_username_alias() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join_presence","username":"Hna","userId":"u1"}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinPresence {
                label: "Hna".to_string(),
                user_id: Some("u1".to_string()),
            }
        );
    }

    #[test]
    fn touch_end_has_no_payload() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"touch_end"}"#).unwrap();
        assert_eq!(msg, ClientMessage::TouchEnd);
    }

    #[test]
    fn non_numeric_coordinates_are_rejected() {
        let res = serde_json::from_str::<ClientMessage>(r#"{"type":"touch_start","x":"left","y":0.2}"#);
        assert!(res.is_err());
    }

    #[test]
    fn server_fields_are_camel_case() {
        let json = serde_json::to_value(ServerMessage::AlignmentFeedback {
            your_position: Position::new(0.1, 0.2),
            target_position: Position::new(0.5, 0.5),
            is_aligned: false,
            distance: None,
        })
        .unwrap();
        assert_eq!(json["type"], "alignment_feedback");
        assert_eq!(json["yourPosition"]["x"], 0.1);
        assert_eq!(json["isAligned"], false);
        assert!(json.get("distance").is_none());
    }

    #[test]
    fn sync_status_matches_rest_shape() {
        let status = SyncLockStatus {
            is_active: true,
            is_unlocked: false,
            has_partner: false,
            online_count: 2,
        };
        let json = serde_json::to_value(ServerMessage::from(status)).unwrap();
        let rest = serde_json::to_value(status).unwrap();
        for key in ["isActive", "isUnlocked", "hasPartner", "onlineCount"] {
            assert_eq!(json[key], rest[key]);
        }
        assert_eq!(json["type"], "sync_status");
        assert_eq!(json["isActive"], true);
        assert_eq!(json["onlineCount"], 2);
    }

    #[test]
    fn reset_reason_wire_names() {
        let json = serde_json::to_string(&ServerMessage::Reset {
            reason: ResetReason::InitiatorDisconnected,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"reset","reason":"initiator_disconnected"}"#);
    }

    #[test]
    fn clamped_pulls_into_unit_square() {
        assert_eq!(Position::new(-0.2, 1.4).clamped(), Position::new(0.0, 1.0));
        assert_eq!(Position::new(0.3, 0.7).clamped(), Position::new(0.3, 0.7));
    }

    #[test]
    fn recipient_addressing() {
        let a: ConnId = "a".to_string();
        let b: ConnId = "b".to_string();
        assert!(Recipient::All.includes(&a));
        assert!(!Recipient::AllExcept(a.clone()).includes(&a));
        assert!(Recipient::AllExcept(a.clone()).includes(&b));
        assert!(Recipient::Only(b.clone()).includes(&b));
        assert!(!Recipient::Only(b).includes(&a));
    }
}
