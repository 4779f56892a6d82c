//! State reconciliation between the two peers.
//!
//! Local mutations are shipped as patches computed between a snapshot taken
//! before the mutation and the state after it. After a reconnection each side
//! announces its full state; the side with more accepted moves wins.

pub mod patch;

use log::{debug, info};
use serde_json::Value;

use crate::error::SyncError;
use crate::game::GameState;

pub use patch::{apply, diff, OpKind, Operation, Patch};

/// JSON form of a [`GameState`], the document patches address.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot(Value);

impl Snapshot {
    pub fn of(state: &GameState) -> Result<Self, SyncError> {
        Ok(Snapshot(serde_json::to_value(state)?))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Patch from this snapshot to `later`.
    pub fn diff(&self, later: &Snapshot) -> Patch {
        diff(&self.0, &later.0)
    }
}

/// Patch taking `before` to `after`.
pub fn diff_states(before: &GameState, after: &GameState) -> Result<Patch, SyncError> {
    Ok(Snapshot::of(before)?.diff(&Snapshot::of(after)?))
}

/// Apply `patch` to `state`, producing the patched state. Either every
/// operation applies and the result is a valid [`GameState`] with a
/// well-formed board, or an error is returned and nothing changes.
pub fn apply_to_state(state: &GameState, patch: &Patch) -> Result<GameState, SyncError> {
    let doc = Snapshot::of(state)?;
    let patched: GameState = serde_json::from_value(apply(doc.as_value(), patch)?)?;
    if !patched.board.is_well_formed() {
        return Err(SyncError::MalformedBoard);
    }
    Ok(patched)
}

/// What to do with a full-state announcement from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ResyncAction {
    /// The peer is ahead; apply this patch locally.
    Adopt(Patch),
    /// The peer is behind; answer with our own full state.
    Respond,
    /// Both sides agree on the move count.
    InSync,
}

/// Compare move counters and decide how to converge.
pub fn resolve_resync(local: &GameState, remote: &GameState) -> Result<ResyncAction, SyncError> {
    let (mine, theirs) = (local.move_count(), remote.move_count());
    let action = if theirs > mine {
        ResyncAction::Adopt(diff_states(local, remote)?)
    } else if theirs < mine {
        ResyncAction::Respond
    } else {
        ResyncAction::InSync
    };
    match &action {
        ResyncAction::Adopt(patch) => info!(
            "Peer is ahead ({} > {} moves), adopting {} operations",
            theirs,
            mine,
            patch.len()
        ),
        ResyncAction::Respond => info!("Peer is behind ({} < {} moves), pushing state", theirs, mine),
        ResyncAction::InSync => debug!("Resync: both at {} moves", mine),
    }
    Ok(action)
}
