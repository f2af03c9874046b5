use std::collections::HashMap;
use std::time::Duration;

use hyper_tungstenite::tungstenite::Message;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::MessageError;
use crate::protocol::{ClientMessage, Dispatch, SyncLockStatus};
use crate::state::{ResetToken, ServerState, Transition};
use crate::ConnId;

pub type WebSocketSender = mpsc::UnboundedSender<Message>;

/// Mailbox of the hub task. Commands from one connection arrive in the order
/// that connection produced them.
#[derive(Debug)]
pub enum HubCommand {
    Connect {
        conn_id: ConnId,
        sender: WebSocketSender,
    },
    Inbound {
        conn_id: ConnId,
        msg: ClientMessage,
    },
    Disconnect {
        conn_id: ConnId,
    },
    ResetDue(ResetToken),
    Status {
        reply: oneshot::Sender<SyncLockStatus>,
    },
}

/// Cheap, cloneable handle used by connection tasks and HTTP handlers.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn connect(&self, conn_id: &ConnId, sender: WebSocketSender) -> Result<(), MessageError> {
        self.send(HubCommand::Connect {
            conn_id: conn_id.clone(),
            sender,
        })
    }

    pub fn inbound(&self, conn_id: &ConnId, msg: ClientMessage) -> Result<(), MessageError> {
        self.send(HubCommand::Inbound {
            conn_id: conn_id.clone(),
            msg,
        })
    }

    pub fn disconnect(&self, conn_id: &ConnId) -> Result<(), MessageError> {
        self.send(HubCommand::Disconnect {
            conn_id: conn_id.clone(),
        })
    }

    pub async fn status(&self) -> Result<SyncLockStatus, MessageError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Status { reply })?;
        rx.await.map_err(|_| MessageError::HubClosed)
    }

    fn send(&self, cmd: HubCommand) -> Result<(), MessageError> {
        self.commands.send(cmd).map_err(|_| MessageError::HubClosed)
    }
}

pub struct Hub {
    state: ServerState,
    senders: HashMap<ConnId, WebSocketSender>,
    timers: mpsc::WeakUnboundedSender<HubCommand>,
    reset_after: Duration,
}

/// Starts the hub on the current runtime. The task ends once every handle is dropped.
pub fn spawn_hub(reset_after: Duration) -> HubHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let hub = Hub {
        state: ServerState::new(),
        senders: HashMap::new(),
        timers: tx.downgrade(),
        reset_after,
    };
    tokio::spawn(hub.run(rx));
    HubHandle { commands: tx }
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd);
        }
        debug!("Hub stopped");
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Connect { conn_id, sender } => {
                self.senders.insert(conn_id, sender);
            }
            HubCommand::Inbound { conn_id, msg } => {
                if !self.senders.contains_key(&conn_id) {
                    debug!("Dropping message from unknown connection {}", conn_id);
                    return;
                }
                let transition = self.state.handle_message(&conn_id, msg);
                self.apply(transition);
            }
            HubCommand::Disconnect { conn_id } => {
                self.senders.remove(&conn_id);
                let transition = self.state.handle_disconnect(&conn_id);
                self.apply(transition);
            }
            HubCommand::ResetDue(token) => {
                self.state.sync_lock.expire(token);
            }
            HubCommand::Status { reply } => {
                let _ = reply.send(self.state.status());
            }
        }
    }

    fn apply(&mut self, transition: Transition) {
        for dispatch in &transition.dispatches {
            self.deliver(dispatch);
        }
        if let Some(token) = transition.schedule_reset {
            self.schedule_reset(token);
        }
    }

    fn deliver(&self, dispatch: &Dispatch) {
        let Ok(json) = serde_json::to_string(&dispatch.message) else {
            warn!("Failed to serialize {:?}", dispatch.message);
            return;
        };

        for (conn_id, sender) in &self.senders {
            if dispatch.to.includes(conn_id) {
                let _ = sender.send(Message::Text(json.clone()));
            }
        }
    }

    fn schedule_reset(&self, token: ResetToken) {
        let Some(tx) = self.timers.upgrade() else {
            return;
        };
        let delay = self.reset_after;
        info!("Sync lock reset scheduled in {:?}", delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(HubCommand::ResetDue(token));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Position, ServerMessage};

    struct TestConn {
        id: ConnId,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl TestConn {
        fn open(hub: &HubHandle, id: &str) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = id.to_string();
            hub.connect(&id, tx).unwrap();
            Self { id, rx }
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(Message::Text(text)) = self.rx.try_recv() {
                out.push(serde_json::from_str(&text).unwrap());
            }
            out
        }
    }

    async fn settle(hub: &HubHandle) -> SyncLockStatus {
        // A status round-trip guarantees every earlier command was handled.
        hub.status().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_resets_after_delay() {
        let hub = spawn_hub(Duration::from_secs(5));
        let mut a = TestConn::open(&hub, "a");
        let mut b = TestConn::open(&hub, "b");

        hub.inbound(&a.id, ClientMessage::TouchStart { x: 0.3, y: 0.3 }).unwrap();
        hub.inbound(&b.id, ClientMessage::TouchStart { x: 0.35, y: 0.32 }).unwrap();
        let status = settle(&hub).await;
        assert!(status.is_unlocked);

        let unlocked = |msgs: &[ServerMessage]| {
            msgs.iter()
                .any(|m| matches!(m, ServerMessage::Unlocked { success: true, .. }))
        };
        assert!(unlocked(&a.drain()));
        assert!(unlocked(&b.drain()));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(settle(&hub).await.is_unlocked);

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        let status = settle(&hub).await;
        assert!(!status.is_active);
        assert!(!status.is_unlocked);
        assert!(!status.has_partner);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_does_not_reset_next_cycle() {
        let hub = spawn_hub(Duration::from_secs(5));
        let a = TestConn::open(&hub, "a");
        let b = TestConn::open(&hub, "b");

        hub.inbound(&a.id, ClientMessage::TouchStart { x: 0.5, y: 0.5 }).unwrap();
        hub.inbound(&b.id, ClientMessage::TouchStart { x: 0.5, y: 0.5 }).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        // Early release, then a second unlock two seconds before the first timer fires.
        hub.inbound(&a.id, ClientMessage::TouchEnd).unwrap();
        hub.inbound(&a.id, ClientMessage::TouchStart { x: 0.1, y: 0.1 }).unwrap();
        hub.inbound(&b.id, ClientMessage::TouchStart { x: 0.1, y: 0.1 }).unwrap();
        assert!(settle(&hub).await.is_unlocked);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(settle(&hub).await.is_unlocked);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!settle(&hub).await.is_unlocked);
    }

    #[tokio::test]
    async fn partner_touching_skips_sender() {
        let hub = spawn_hub(Duration::from_secs(5));
        let mut a = TestConn::open(&hub, "a");
        let mut b = TestConn::open(&hub, "b");

        hub.inbound(&a.id, ClientMessage::TouchStart { x: 0.3, y: 0.3 }).unwrap();
        settle(&hub).await;

        assert!(a.drain().is_empty());
        assert_eq!(
            b.drain(),
            vec![ServerMessage::PartnerTouching {
                position: Position::new(0.3, 0.3),
                waiting: true
            }]
        );
    }

    #[tokio::test]
    async fn disconnected_connection_stops_receiving() {
        let hub = spawn_hub(Duration::from_secs(5));
        let mut a = TestConn::open(&hub, "a");
        let b = TestConn::open(&hub, "b");

        for conn in [&a, &b] {
            hub.inbound(&conn.id, ClientMessage::JoinPresence { label: conn.id.clone(), user_id: None })
                .unwrap();
        }
        hub.disconnect(&b.id).unwrap();
        hub.inbound(&b.id, ClientMessage::TouchStart { x: 0.5, y: 0.5 }).unwrap();
        let status = settle(&hub).await;

        assert_eq!(status.online_count, 1);
        assert!(!status.is_active);
        let last = a.drain().pop().unwrap();
        assert_eq!(
            last,
            ServerMessage::UserOffline {
                label: "b".into(),
                user_id: None,
                online_count: 1
            }
        );
    }
}
