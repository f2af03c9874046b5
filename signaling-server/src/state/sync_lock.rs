use log::{debug, info};

use crate::protocol::{Dispatch, Position, ResetReason, ServerMessage, SyncLockStatus};
use crate::ConnId;

/// Maximum per-axis difference, in normalized units, for two touches to count
/// as the same spot.
pub const ALIGNMENT_TOLERANCE: f64 = 0.15;

pub const UNLOCK_MESSAGE: &str = "Your hearts are connected across the distance!";

/// Handle for the post-unlock reset. Only the token issued for the current
/// cycle can reset the session; anything older is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetToken {
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingPartner,
    Aligning,
    Unlocked,
}

/// Result of feeding one event to the coordinator.
#[derive(Debug, Default)]
pub struct Transition {
    pub dispatches: Vec<Dispatch>,
    /// Set when this event unlocked the session; the caller must hand the
    /// token back through [`SyncLockState::expire`] once the reset delay passes.
    pub schedule_reset: Option<ResetToken>,
}

impl Transition {
    fn none() -> Self {
        Self::default()
    }

    fn send(dispatches: Vec<Dispatch>) -> Self {
        Self {
            dispatches,
            schedule_reset: None,
        }
    }
}

/// Two-party touch handshake ("biometric sync lock")
#[derive(Debug, Default)]
pub struct SyncLockState {
    initiator: Option<(ConnId, Position)>,
    partner: Option<(ConnId, Position)>,
    unlocked: bool,
    generation: u64,
}

pub fn is_aligned(a: Position, b: Position) -> bool {
    (a.x - b.x).abs() <= ALIGNMENT_TOLERANCE && (a.y - b.y).abs() <= ALIGNMENT_TOLERANCE
}

impl SyncLockState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        match (&self.initiator, &self.partner, self.unlocked) {
            (_, _, true) => Phase::Unlocked,
            (None, _, false) => Phase::Idle,
            (Some(_), None, false) => Phase::AwaitingPartner,
            (Some(_), Some(_), false) => Phase::Aligning,
        }
    }

    pub fn initiator(&self) -> Option<&ConnId> {
        self.initiator.as_ref().map(|(id, _)| id)
    }

    pub fn partner(&self) -> Option<&ConnId> {
        self.partner.as_ref().map(|(id, _)| id)
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub fn status(&self, online_count: usize) -> SyncLockStatus {
        SyncLockStatus {
            is_active: self.initiator.is_some(),
            is_unlocked: self.unlocked,
            has_partner: self.partner.is_some(),
            online_count,
        }
    }

    pub fn touch_start(&mut self, conn_id: &ConnId, position: Position) -> Transition {
        let position = position.clamped();
        if self.unlocked {
            debug!("Ignoring touch start from {} while unlocked", conn_id);
            return Transition::none();
        }

        if self.initiator.is_none() {
            info!("Sync lock initiated by {} at ({:.2}, {:.2})", conn_id, position.x, position.y);
            self.initiator = Some((conn_id.clone(), position));
            return Transition::send(vec![Dispatch::all_except(
                conn_id,
                ServerMessage::PartnerTouching {
                    position,
                    waiting: true,
                },
            )]);
        }

        if self.initiator() == Some(conn_id) {
            debug!("Duplicate touch start from initiator {}", conn_id);
            return Transition::none();
        }

        debug!("{} joined as partner at ({:.2}, {:.2})", conn_id, position.x, position.y);
        self.partner = Some((conn_id.clone(), position));
        self.evaluate(Vec::new())
    }

    pub fn touch_move(&mut self, conn_id: &ConnId, position: Position) -> Transition {
        let position = position.clamped();
        if self.unlocked {
            return Transition::none();
        }

        if let Some((initiator, pos)) = self.initiator.as_mut().filter(|(id, _)| id == conn_id) {
            *pos = position;
            let announce = Dispatch::all_except(
                initiator,
                ServerMessage::PartnerTouching {
                    position,
                    waiting: true,
                },
            );
            if self.partner.is_some() {
                return self.evaluate(vec![announce]);
            }
            return Transition::send(vec![announce]);
        }

        if let Some((_, pos)) = self.partner.as_mut().filter(|(id, _)| id == conn_id) {
            *pos = position;
            return self.evaluate(Vec::new());
        }

        debug!("Ignoring touch move from {} without a role", conn_id);
        Transition::none()
    }

    pub fn touch_end(&mut self, conn_id: &ConnId) -> Transition {
        self.release(conn_id, ResetReason::InitiatorReleased)
    }

    pub fn disconnect(&mut self, conn_id: &ConnId) -> Transition {
        self.release(conn_id, ResetReason::InitiatorDisconnected)
    }

    /// Applies a reset scheduled by an earlier unlock. Returns whether the
    /// session was actually reset.
    pub fn expire(&mut self, token: ResetToken) -> bool {
        if token.generation != self.generation || !self.unlocked {
            debug!("Dropping stale reset token {:?}", token);
            return false;
        }
        info!("Sync lock reset after unlock");
        self.reset();
        true
    }

    fn release(&mut self, conn_id: &ConnId, reason: ResetReason) -> Transition {
        if self.initiator() == Some(conn_id) {
            info!("Sync lock reset: {:?} ({})", reason, conn_id);
            self.reset();
            return Transition::send(vec![Dispatch::all(ServerMessage::Reset { reason })]);
        }

        if self.partner() == Some(conn_id) {
            self.partner = None;
            if let Some(initiator) = self.initiator() {
                return Transition::send(vec![Dispatch::only(initiator, ServerMessage::PartnerReleased)]);
            }
        }

        Transition::none()
    }

    fn evaluate(&mut self, mut dispatches: Vec<Dispatch>) -> Transition {
        let (Some((initiator, target)), Some((partner, yours))) = (&self.initiator, &self.partner) else {
            return Transition::send(dispatches);
        };
        let (target, yours) = (*target, *yours);

        if is_aligned(yours, target) {
            info!("Sync lock unlocked ({} + {})", initiator, partner);
            self.unlocked = true;
            self.generation += 1;
            dispatches.push(Dispatch::all(ServerMessage::Unlocked {
                success: true,
                message: UNLOCK_MESSAGE.to_string(),
            }));
            return Transition {
                dispatches,
                schedule_reset: Some(ResetToken {
                    generation: self.generation,
                }),
            };
        }

        let (dx, dy) = (yours.x - target.x, yours.y - target.y);
        dispatches.push(Dispatch::only(
            partner,
            ServerMessage::AlignmentFeedback {
                your_position: yours,
                target_position: target,
                is_aligned: false,
                distance: Some((dx * dx + dy * dy).sqrt()),
            },
        ));
        dispatches.push(Dispatch::only(
            initiator,
            ServerMessage::PartnerPosition {
                partner_position: yours,
            },
        ));
        Transition::send(dispatches)
    }

    fn reset(&mut self) {
        self.initiator = None;
        self.partner = None;
        self.unlocked = false;
        // Invalidates any reset still pending for the previous cycle.
        self.generation += 1;
    }
}
