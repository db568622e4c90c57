use super::gateway::HardwareGateway;
use super::models::CheckpointId;
use crate::errors::{ConveyorError, Result};

/// Cyclic order of checkpoints on the ring.
///
/// Carriers travel one way only: from a checkpoint to the one after it,
/// with the last checkpoint feeding the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingTopology {
    order: Vec<CheckpointId>,
}

impl RingTopology {
    pub fn new(order: Vec<CheckpointId>) -> Result<Self> {
        if order.is_empty() {
            return Err(ConveyorError::InvalidState(
                "conveyor ring has no checkpoints".to_string(),
            ));
        }
        for (i, id) in order.iter().enumerate() {
            if order[..i].contains(id) {
                return Err(ConveyorError::InvalidState(format!(
                    "checkpoint {} appears twice in the ring {:?}",
                    id, order
                )));
            }
        }
        Ok(Self { order })
    }

    /// Read the ring order from the gateway.
    pub async fn discover(gateway: &dyn HardwareGateway) -> Result<Self> {
        Self::new(gateway.list_checkpoint_ids().await?)
    }

    pub fn checkpoints(&self) -> &[CheckpointId] {
        &self.order
    }

    pub fn contains(&self, id: CheckpointId) -> bool {
        self.order.contains(&id)
    }

    fn position(&self, id: CheckpointId) -> Result<usize> {
        self.order
            .iter()
            .position(|c| *c == id)
            .ok_or(ConveyorError::UnknownCheckpoint { id })
    }

    /// The checkpoint a carrier released from `id` arrives at.
    pub fn next_after(&self, id: CheckpointId) -> Result<CheckpointId> {
        let pos = self.position(id)?;
        Ok(self.order[(pos + 1) % self.order.len()])
    }

    /// Checkpoints visited travelling from `from` to `to`, excluding `from`
    /// and including `to`. Empty when `from == to`.
    pub fn route(&self, from: CheckpointId, to: CheckpointId) -> Result<Vec<CheckpointId>> {
        let start = self.position(from)?;
        self.position(to)?;
        let mut route = Vec::new();
        let mut pos = start;
        while self.order[pos] != to {
            pos = (pos + 1) % self.order.len();
            route.push(self.order[pos]);
        }
        Ok(route)
    }

    /// Like [`next_after`](Self::next_after), but confirms the checkpoint
    /// with the gateway first.
    pub async fn next_checkpoint(
        &self,
        gateway: &dyn HardwareGateway,
        id: CheckpointId,
    ) -> Result<CheckpointId> {
        gateway.status(id).await?;
        self.next_after(id)
    }

    /// Like [`route`](Self::route), but confirms both ends with the gateway first.
    pub async fn route_between(
        &self,
        gateway: &dyn HardwareGateway,
        from: CheckpointId,
        to: CheckpointId,
    ) -> Result<Vec<CheckpointId>> {
        gateway.status(from).await?;
        gateway.status(to).await?;
        self.route(from, to)
    }
}
