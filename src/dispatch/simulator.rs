use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::gateway::HardwareGateway;
use super::models::{CheckpointId, CheckpointStatus};
use crate::errors::{ConveyorError, Result};

/// One call received by the simulated conveyor, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GatewayCall {
    ListCheckpoints,
    Status(CheckpointId),
    AdvanceOne(Vec<CheckpointId>),
    Open(Vec<CheckpointId>),
    Close(Vec<CheckpointId>),
}

impl GatewayCall {
    /// Whether the call moves gates (as opposed to reading sensors).
    pub fn is_actuation(&self) -> bool {
        matches!(self, Self::AdvanceOne(_) | Self::Open(_) | Self::Close(_))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Gate {
    present: usize,
    open: bool,
}

struct SimState {
    gates: HashMap<CheckpointId, Gate>,
    journal: Vec<GatewayCall>,
}

/// In-process model of the ring conveyor.
///
/// Carriers are counted per checkpoint, not tracked individually. A released
/// carrier rolls forward through open gates and stops at the first closed
/// one. Nothing arrives on its own: upstream and downstream actors are
/// modelled by [`place_carriers`](Self::place_carriers) and
/// [`lift_from`](Self::lift_from).
pub struct SimulatedConveyor {
    ring: Vec<CheckpointId>,
    state: Mutex<SimState>,
}

impl SimulatedConveyor {
    pub fn new(ring: Vec<CheckpointId>) -> Self {
        let gates = ring.iter().map(|id| (*id, Gate::default())).collect();
        Self {
            ring,
            state: Mutex::new(SimState {
                gates,
                journal: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|e| ConveyorError::InvalidState(format!("simulator lock poisoned: {}", e)))
    }

    pub fn ring(&self) -> &[CheckpointId] {
        &self.ring
    }

    fn next_after(&self, id: CheckpointId) -> Option<CheckpointId> {
        let pos = self.ring.iter().position(|c| *c == id)?;
        Some(self.ring[(pos + 1) % self.ring.len()])
    }

    /// Put `count` carriers on a checkpoint, as an upstream actor would.
    pub fn place_carriers(&self, checkpoint: CheckpointId, count: usize) -> Result<()> {
        let mut state = self.lock()?;
        if !state.gates.contains_key(&checkpoint) {
            return Err(ConveyorError::UnknownCheckpoint { id: checkpoint });
        }
        for _ in 0..count {
            self.deliver(&mut state, checkpoint);
        }
        Ok(())
    }

    /// Take one carrier off a checkpoint. Returns `false` when it is empty.
    pub fn lift_from(&self, checkpoint: CheckpointId) -> Result<bool> {
        let mut state = self.lock()?;
        let gate = state
            .gates
            .get_mut(&checkpoint)
            .ok_or(ConveyorError::UnknownCheckpoint { id: checkpoint })?;
        if gate.present == 0 {
            return Ok(false);
        }
        gate.present -= 1;
        Ok(true)
    }

    pub fn present_at(&self, checkpoint: CheckpointId) -> usize {
        self.lock()
            .ok()
            .and_then(|state| state.gates.get(&checkpoint).map(|g| g.present))
            .unwrap_or(0)
    }

    pub fn is_open(&self, checkpoint: CheckpointId) -> bool {
        self.lock()
            .ok()
            .and_then(|state| state.gates.get(&checkpoint).map(|g| g.open))
            .unwrap_or(false)
    }

    pub fn journal(&self) -> Vec<GatewayCall> {
        self.lock().map(|s| s.journal.clone()).unwrap_or_default()
    }

    pub fn actuations(&self) -> Vec<GatewayCall> {
        self.journal()
            .into_iter()
            .filter(GatewayCall::is_actuation)
            .collect()
    }

    pub fn clear_journal(&self) {
        if let Ok(mut state) = self.lock() {
            state.journal.clear();
        }
    }

    /// Drop a carrier on `checkpoint`, letting it roll on through open gates.
    fn deliver(&self, state: &mut SimState, checkpoint: CheckpointId) {
        let mut target = checkpoint;
        // Bounded by the ring length so an all-open ring cannot spin forever.
        for _ in 0..self.ring.len() {
            let open = state.gates.get(&target).map(|g| g.open).unwrap_or(false);
            if !open {
                break;
            }
            match self.next_after(target) {
                Some(next) => target = next,
                None => break,
            }
        }
        if let Some(gate) = state.gates.get_mut(&target) {
            gate.present += 1;
        }
    }

    fn check_known(&self, state: &SimState, checkpoints: &[CheckpointId]) -> Result<()> {
        match checkpoints.iter().find(|id| !state.gates.contains_key(id)) {
            Some(unknown) => Err(ConveyorError::gateway(
                checkpoints,
                format!("checkpoint {} is not attached to the conveyor", unknown),
            )),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HardwareGateway for SimulatedConveyor {
    async fn list_checkpoint_ids(&self) -> Result<Vec<CheckpointId>> {
        self.lock()?.journal.push(GatewayCall::ListCheckpoints);
        Ok(self.ring.clone())
    }

    async fn status(&self, checkpoint: CheckpointId) -> Result<CheckpointStatus> {
        let mut state = self.lock()?;
        state.journal.push(GatewayCall::Status(checkpoint));
        let gate = state
            .gates
            .get(&checkpoint)
            .ok_or(ConveyorError::UnknownCheckpoint { id: checkpoint })?;
        Ok(CheckpointStatus {
            id: checkpoint,
            is_busy: gate.present > 0,
        })
    }

    async fn advance_one(&self, checkpoints: &[CheckpointId]) -> Result<()> {
        if checkpoints.is_empty() {
            return Ok(());
        }
        let mut state = self.lock()?;
        state
            .journal
            .push(GatewayCall::AdvanceOne(checkpoints.to_vec()));
        self.check_known(&state, checkpoints)?;
        for id in checkpoints {
            let Some(next) = self.next_after(*id) else {
                continue;
            };
            let released = match state.gates.get_mut(id) {
                Some(gate) if !gate.open && gate.present > 0 => {
                    gate.present -= 1;
                    true
                }
                _ => false,
            };
            if released {
                debug!(checkpoint = id, next, "simulator released one carrier");
                self.deliver(&mut state, next);
            }
        }
        Ok(())
    }

    async fn open(&self, checkpoints: &[CheckpointId]) -> Result<()> {
        if checkpoints.is_empty() {
            return Ok(());
        }
        let mut state = self.lock()?;
        state.journal.push(GatewayCall::Open(checkpoints.to_vec()));
        self.check_known(&state, checkpoints)?;
        for id in checkpoints {
            if let Some(gate) = state.gates.get_mut(id) {
                gate.open = true;
            }
        }
        // Flush residents of every open gate forward.
        for id in checkpoints {
            let Some(next) = self.next_after(*id) else {
                continue;
            };
            let waiting = state
                .gates
                .get_mut(id)
                .map(|gate| std::mem::take(&mut gate.present))
                .unwrap_or(0);
            for _ in 0..waiting {
                self.deliver(&mut state, next);
            }
        }
        Ok(())
    }

    async fn close(&self, checkpoints: &[CheckpointId]) -> Result<()> {
        if checkpoints.is_empty() {
            return Ok(());
        }
        let mut state = self.lock()?;
        state.journal.push(GatewayCall::Close(checkpoints.to_vec()));
        self.check_known(&state, checkpoints)?;
        for id in checkpoints {
            if let Some(gate) = state.gates.get_mut(id) {
                gate.open = false;
            }
        }
        Ok(())
    }
}
