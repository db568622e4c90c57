use serde::{Deserialize, Serialize};

/// Checkpoint ("lock") identity as reported by the hardware gateway.
pub type CheckpointId = i64;

/// Carrier ("palette") identity, allocated by the store and never reused.
pub type CarrierId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Carrier {
    pub id: CarrierId,
    /// `None` while the carrier is in transit between checkpoints.
    pub checkpoint: Option<CheckpointId>,
    pub available: bool,
    pub in_transit: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Sensor reading for a single checkpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointStatus {
    pub id: CheckpointId,
    pub is_busy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointQueue {
    pub checkpoint: CheckpointId,
    /// Head first: index 0 leaves toward the next checkpoint first.
    pub carriers: Vec<CarrierId>,
}

/// Read-only view of the whole conveyor for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConveyorSnapshot {
    pub ring: Vec<CheckpointId>,
    pub queues: Vec<CheckpointQueue>,
    pub carriers: Vec<Carrier>,
}

impl ConveyorSnapshot {
    pub fn queue(&self, checkpoint: CheckpointId) -> Option<&[CarrierId]> {
        self.queues
            .iter()
            .find(|q| q.checkpoint == checkpoint)
            .map(|q| q.carriers.as_slice())
    }
}
