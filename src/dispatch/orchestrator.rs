use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::gateway::HardwareGateway;
use super::models::{Carrier, CarrierId, CheckpointId, ConveyorSnapshot};
use super::store::StoreHandle;
use super::topology::RingTopology;
use crate::errors::{ConveyorError, Result};

/// Tunables for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Checkpoint where carriers arrive from storage.
    pub intake_checkpoint: CheckpointId,
    /// Checkpoint that hands carriers back to storage.
    pub unload_checkpoint: CheckpointId,
    pub poll_interval: Duration,
    pub sensor_timeout: Duration,
    /// Upper bound on waiting for storage to deliver a carrier on intake.
    pub intake_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            intake_checkpoint: 1,
            unload_checkpoint: 4,
            poll_interval: Duration::from_millis(100),
            sensor_timeout: Duration::from_secs(60),
            intake_timeout: Duration::from_secs(600),
        }
    }
}

/// Bookkeeping for one operation's actuations.
#[derive(Debug, Default)]
struct Wave {
    /// Set once any gate command has been sent.
    actuated: bool,
    /// Carriers physically released whose arrival is not yet recorded.
    unsettled: Vec<CarrierId>,
}

impl Wave {
    fn unsettle(&mut self, carrier: CarrierId) {
        if !self.unsettled.contains(&carrier) {
            self.unsettled.push(carrier);
        }
    }

    fn settle(&mut self, carrier: CarrierId) {
        self.unsettled.retain(|c| *c != carrier);
    }
}

/// Turns move requests into gate actuations synchronized against sensors.
///
/// One operation runs at a time: every public operation holds `op_lock`
/// from validation until its last actuation. Introspection reads the store
/// directly and is never blocked by a running operation.
pub struct Dispatcher {
    gateway: Arc<dyn HardwareGateway>,
    store: StoreHandle,
    topology: RingTopology,
    config: DispatcherConfig,
    op_lock: Mutex<()>,
}

impl Dispatcher {
    /// Discover the ring from the gateway and register it with the store.
    pub async fn new(
        gateway: Arc<dyn HardwareGateway>,
        store: StoreHandle,
        config: DispatcherConfig,
    ) -> Result<Self> {
        let topology = RingTopology::discover(gateway.as_ref()).await?;
        for id in [config.intake_checkpoint, config.unload_checkpoint] {
            if !topology.contains(id) {
                return Err(ConveyorError::UnknownCheckpoint { id });
            }
        }
        let ring = topology.checkpoints().to_vec();
        store
            .call(move |s| s.register_checkpoints(&ring))
            .await?;
        info!(ring = ?topology.checkpoints(), "conveyor topology discovered");
        Ok(Self {
            gateway,
            store,
            topology,
            config,
            op_lock: Mutex::new(()),
        })
    }

    pub fn topology(&self) -> &RingTopology {
        &self.topology
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    // ── Public operations ─────────────────────────────────────────────

    /// Wait for storage to deliver a carrier on intake and register it.
    pub async fn pick_from_storage(&self) -> Result<Carrier> {
        let _guard = self.op_lock.lock().await;
        let span = info_span!("pick_from_storage", intake = self.config.intake_checkpoint);
        let result = self.pick_inner().instrument(span).await;
        self.conclude("pick_from_storage", Wave::default(), result).await
    }

    /// Drain the intake checkpoint onto the next one.
    pub async fn clear_intake_lock(&self) -> Result<Vec<CarrierId>> {
        self.clear_lock(self.config.intake_checkpoint, true).await
    }

    /// Release every carrier queued on `checkpoint` onto the next checkpoint.
    /// Returns the moved carriers in release order.
    pub async fn clear_lock(
        &self,
        checkpoint: CheckpointId,
        wait_for_next: bool,
    ) -> Result<Vec<CarrierId>> {
        let _guard = self.op_lock.lock().await;
        let mut wave = Wave::default();
        let span = info_span!("clear_lock", checkpoint, wait_for_next);
        let result = self
            .clear_inner(checkpoint, wait_for_next, &mut wave)
            .instrument(span)
            .await;
        self.conclude("clear_lock", wave, result).await
    }

    /// Bring `carrier_id` to `destination`, leaving it alone there.
    ///
    /// Everything between the carrier and the destination, and whatever
    /// already sat on the destination, ends up one checkpoint past the
    /// destination. Moving to the carrier's own checkpoint makes it the head
    /// of that queue instead.
    pub async fn move_to_lock(
        &self,
        carrier_id: CarrierId,
        destination: CheckpointId,
    ) -> Result<Carrier> {
        let _guard = self.op_lock.lock().await;
        let mut wave = Wave::default();
        let span = info_span!("move_to_lock", carrier = carrier_id, destination);
        let result = self
            .move_inner(carrier_id, destination, &mut wave)
            .instrument(span)
            .await;
        self.conclude("move_to_lock", wave, result).await
    }

    /// Hand a carrier to storage and forget it once storage has had time to
    /// lift it.
    pub async fn load_to_storage(&self, carrier_id: CarrierId) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let mut wave = Wave::default();
        let span = info_span!(
            "load_to_storage",
            carrier = carrier_id,
            unload = self.config.unload_checkpoint
        );
        let result = self
            .load_inner(carrier_id, &mut wave)
            .instrument(span)
            .await;
        self.conclude("load_to_storage", wave, result).await
    }

    pub async fn carrier(&self, carrier_id: CarrierId) -> Result<Carrier> {
        self.store.call(move |s| s.carrier(carrier_id)).await
    }

    pub async fn snapshot(&self) -> Result<ConveyorSnapshot> {
        let ring = self.topology.checkpoints().to_vec();
        self.store
            .call(move |s| {
                Ok(ConveyorSnapshot {
                    ring,
                    queues: s.list_queues()?,
                    carriers: s.list_carriers()?,
                })
            })
            .await
    }

    /// Turn a failure after actuation into `Stranded`.
    async fn conclude<T>(&self, op: &'static str, wave: Wave, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(source) if wave.actuated => {
                self.freeze(&wave.unsettled).await;
                error!(
                    op,
                    carriers = ?wave.unsettled,
                    error = %source,
                    "operation interrupted after actuation, operator reconciliation required"
                );
                Err(ConveyorError::Stranded {
                    carriers: wave.unsettled,
                    source: Box::new(source),
                })
            }
            Err(e) => {
                match &e {
                    ConveyorError::InvalidState(_) | ConveyorError::Store(_) => {
                        error!(op, error = %e, "operation refused on inconsistent state")
                    }
                    e if e.is_dispatch_rejection() => {
                        info!(op, error = %e, "operation rejected, nothing actuated")
                    }
                    _ => warn!(op, error = %e, kind = e.kind(), "operation failed"),
                }
                Err(e)
            }
        }
    }

    /// Record stranded carriers that are still queued as in transit, so no
    /// later operation finds them available.
    async fn freeze(&self, carriers: &[CarrierId]) {
        let carriers = carriers.to_vec();
        let result = self
            .store
            .call(move |s| {
                for id in carriers {
                    if s.get_carrier(id)?.is_some_and(|c| c.checkpoint.is_some()) {
                        s.mark_in_transit(id)?;
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "failed to record stranded carriers as in transit");
        }
    }

    // ── Operation bodies ──────────────────────────────────────────────

    async fn pick_inner(&self) -> Result<Carrier> {
        let intake = self.config.intake_checkpoint;
        let waiting = self.queue_at(intake).await?;
        if !waiting.is_empty() {
            return Err(ConveyorError::InvalidState(format!(
                "intake checkpoint {} still holds carriers {:?}, clear it first",
                intake, waiting
            )));
        }
        self.wait_for_carrier(intake, self.config.intake_timeout)
            .await?;
        let carrier = self.store.call(move |s| s.create_carrier(intake)).await?;
        info!(carrier = carrier.id, "carrier picked from storage");
        Ok(carrier)
    }

    async fn clear_inner(
        &self,
        checkpoint: CheckpointId,
        wait_for_next: bool,
        wave: &mut Wave,
    ) -> Result<Vec<CarrierId>> {
        let queue = self.queue_at(checkpoint).await?;
        if queue.is_empty() {
            debug!(checkpoint, "nothing to clear");
            return Ok(queue);
        }
        self.ensure_all_available(&queue).await?;
        let next = self
            .topology
            .next_checkpoint(self.gateway.as_ref(), checkpoint)
            .await?;

        for (i, carrier) in queue.iter().enumerate() {
            self.release(checkpoint, *carrier, wave).await?;
            self.mark_in_transit(*carrier, wave).await?;
            if i + 1 < queue.len() {
                self.wait_for_carrier(checkpoint, self.config.sensor_timeout)
                    .await?;
            }
        }
        if wait_for_next {
            self.wait_for_carrier_if_necessary(next).await?;
        }
        for carrier in &queue {
            self.mark_arrived(*carrier, next, wave).await?;
        }
        info!(checkpoint, next, carriers = ?queue, "checkpoint cleared");
        Ok(queue)
    }

    async fn move_inner(
        &self,
        carrier_id: CarrierId,
        destination: CheckpointId,
        wave: &mut Wave,
    ) -> Result<Carrier> {
        let carrier = self.ensure_available(carrier_id).await?;
        let home = resident_checkpoint(&carrier)?;
        let route = self
            .topology
            .route_between(self.gateway.as_ref(), home, destination)
            .await?;

        if route.is_empty() {
            self.make_first(&carrier, wave).await?;
            return self.carrier(carrier_id).await;
        }

        // Everything below is validated before the first gate moves.
        let home_queue = self.queue_at(home).await?;
        let ahead = carriers_ahead(&home_queue, carrier_id)?;
        self.ensure_all_available(&home_queue).await?;
        for checkpoint in &route {
            let queue = self.queue_at(*checkpoint).await?;
            self.ensure_all_available(&queue).await?;
        }
        let beyond = self
            .topology
            .next_checkpoint(self.gateway.as_ref(), destination)
            .await?;
        let pass_through = &route[..route.len() - 1];

        self.clear_inner(destination, false, wave).await?;

        let mut movable = Vec::new();
        for checkpoint in route.iter().rev() {
            movable.extend(self.queue_at(*checkpoint).await?);
        }
        movable.extend(ahead.iter().copied());
        movable.push(carrier_id);
        debug!(?movable, ?route, "movable set computed");

        let leaving_home: Vec<CarrierId> = ahead
            .iter()
            .copied()
            .chain(std::iter::once(carrier_id))
            .collect();
        for (i, carrier) in leaving_home.iter().enumerate() {
            self.release(home, *carrier, wave).await?;
            self.mark_in_transit(*carrier, wave).await?;
            if i + 1 < leaving_home.len() {
                self.wait_for_carrier(home, self.config.sensor_timeout)
                    .await?;
            }
        }

        self.open(pass_through, wave).await?;
        for carrier in movable.iter().filter(|c| !leaving_home.contains(*c)) {
            self.mark_in_transit(*carrier, wave).await?;
        }

        for carrier in &movable {
            self.wait_for_carrier(destination, self.config.sensor_timeout)
                .await?;
            if *carrier == carrier_id {
                self.mark_arrived(carrier_id, destination, wave).await?;
            } else {
                self.release(destination, *carrier, wave).await?;
            }
        }

        let sent_on: Vec<CarrierId> = movable
            .iter()
            .copied()
            .filter(|c| *c != carrier_id)
            .collect();
        if !sent_on.is_empty() {
            self.wait_for_carrier_if_necessary(beyond).await?;
        }
        for carrier in &sent_on {
            self.mark_arrived(*carrier, beyond, wave).await?;
        }

        self.close(pass_through, wave).await?;
        info!(
            carrier = carrier_id,
            from = home,
            to = destination,
            relocated = ?sent_on,
            "carrier moved"
        );
        self.carrier(carrier_id).await
    }

    /// Release the carriers ahead of `carrier` on its own checkpoint onto the
    /// next checkpoint, one sensor-confirmed step at a time.
    async fn make_first(&self, carrier: &Carrier, wave: &mut Wave) -> Result<()> {
        let checkpoint = resident_checkpoint(carrier)?;
        let queue = self.queue_at(checkpoint).await?;
        let ahead = carriers_ahead(&queue, carrier.id)?;
        if ahead.is_empty() {
            debug!(carrier = carrier.id, checkpoint, "carrier already at head");
            return Ok(());
        }
        self.ensure_all_available(&ahead).await?;
        let next = self
            .topology
            .next_checkpoint(self.gateway.as_ref(), checkpoint)
            .await?;

        for ahead_id in &ahead {
            self.release(checkpoint, *ahead_id, wave).await?;
            self.mark_in_transit(*ahead_id, wave).await?;
            self.wait_for_carrier(checkpoint, self.config.sensor_timeout)
                .await?;
        }
        self.wait_for_carrier_if_necessary(next).await?;
        for ahead_id in &ahead {
            self.mark_arrived(*ahead_id, next, wave).await?;
        }
        info!(carrier = carrier.id, checkpoint, relocated = ?ahead, "carrier made head of queue");
        Ok(())
    }

    async fn load_inner(&self, carrier_id: CarrierId, wave: &mut Wave) -> Result<()> {
        let unload = self.config.unload_checkpoint;
        let carrier = self.ensure_available(carrier_id).await?;
        let dwell = self.store.call(|s| s.dwell_time()).await?;
        let unload_queue = self.queue_at(unload).await?;
        if carrier.checkpoint != Some(unload) || unload_queue.first() != Some(&carrier_id) {
            return Err(ConveyorError::InvalidState(format!(
                "carrier {} is not at the head of unload checkpoint {} (queue {:?})",
                carrier_id, unload, unload_queue
            )));
        }

        self.release(unload, carrier_id, wave).await?;
        self.mark_in_transit(carrier_id, wave).await?;
        debug!(?dwell, "waiting for storage to lift the carrier");
        tokio::time::sleep(dwell).await;
        self.store
            .call(move |s| s.delete_carrier(carrier_id))
            .await?;
        wave.settle(carrier_id);
        info!(carrier = carrier_id, "carrier loaded to storage");
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────

    async fn queue_at(&self, checkpoint: CheckpointId) -> Result<Vec<CarrierId>> {
        self.store.call(move |s| s.queue_at(checkpoint)).await
    }

    async fn ensure_available(&self, carrier_id: CarrierId) -> Result<Carrier> {
        let carrier = self.carrier(carrier_id).await?;
        if !carrier.available {
            return Err(ConveyorError::NotAvailable {
                carrier: carrier_id,
            });
        }
        Ok(carrier)
    }

    /// Fails on the first unavailable carrier, in queue order.
    async fn ensure_all_available(&self, carriers: &[CarrierId]) -> Result<()> {
        let carriers = carriers.to_vec();
        self.store
            .call(move |s| {
                for id in carriers {
                    if !s.carrier(id)?.available {
                        return Err(ConveyorError::NotAvailable { carrier: id });
                    }
                }
                Ok(())
            })
            .await
    }

    /// Advance one carrier off `checkpoint`; `carrier` is the one expected
    /// to leave.
    async fn release(
        &self,
        checkpoint: CheckpointId,
        carrier: CarrierId,
        wave: &mut Wave,
    ) -> Result<()> {
        wave.actuated = true;
        wave.unsettle(carrier);
        debug!(checkpoint, carrier, "advance one");
        self.gateway.advance_one(&[checkpoint]).await
    }

    async fn open(&self, checkpoints: &[CheckpointId], wave: &mut Wave) -> Result<()> {
        if checkpoints.is_empty() {
            return Ok(());
        }
        wave.actuated = true;
        debug!(?checkpoints, "open gates");
        self.gateway.open(checkpoints).await
    }

    async fn close(&self, checkpoints: &[CheckpointId], wave: &mut Wave) -> Result<()> {
        if checkpoints.is_empty() {
            return Ok(());
        }
        wave.actuated = true;
        debug!(?checkpoints, "close gates");
        self.gateway.close(checkpoints).await
    }

    async fn mark_in_transit(&self, carrier: CarrierId, wave: &mut Wave) -> Result<()> {
        wave.unsettle(carrier);
        self.store.call(move |s| s.mark_in_transit(carrier)).await
    }

    async fn mark_arrived(
        &self,
        carrier: CarrierId,
        checkpoint: CheckpointId,
        wave: &mut Wave,
    ) -> Result<()> {
        self.store
            .call(move |s| s.mark_arrived(carrier, checkpoint))
            .await?;
        wave.settle(carrier);
        Ok(())
    }

    /// Poll the checkpoint sensor until it reports busy.
    async fn wait_for_carrier(&self, checkpoint: CheckpointId, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.gateway.status(checkpoint).await?.is_busy {
                debug!(checkpoint, waited = ?started.elapsed(), "sensor confirmed carrier");
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(ConveyorError::Timeout { checkpoint, waited });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Arrivals only need confirming on a checkpoint whose sensor is not
    /// already held busy by recorded residents.
    async fn wait_for_carrier_if_necessary(&self, checkpoint: CheckpointId) -> Result<()> {
        if self.queue_at(checkpoint).await?.is_empty() {
            self.wait_for_carrier(checkpoint, self.config.sensor_timeout)
                .await?;
        }
        Ok(())
    }
}

fn resident_checkpoint(carrier: &Carrier) -> Result<CheckpointId> {
    carrier.checkpoint.ok_or_else(|| {
        ConveyorError::InvalidState(format!(
            "carrier {} is marked available but has no checkpoint",
            carrier.id
        ))
    })
}

/// Carriers strictly ahead of `carrier` in `queue`, head first.
fn carriers_ahead(queue: &[CarrierId], carrier: CarrierId) -> Result<Vec<CarrierId>> {
    let pos = queue.iter().position(|c| *c == carrier).ok_or_else(|| {
        ConveyorError::InvalidState(format!(
            "carrier {} is missing from its checkpoint queue {:?}",
            carrier, queue
        ))
    })?;
    Ok(queue[..pos].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carriers_ahead() {
        assert_eq!(carriers_ahead(&[4, 5, 6], 6).unwrap(), vec![4, 5]);
        assert!(carriers_ahead(&[4, 5, 6], 4).unwrap().is_empty());
    }

    #[test]
    fn test_carriers_ahead_missing_is_invalid_state() {
        let err = carriers_ahead(&[1, 2], 3).unwrap_err();
        assert!(matches!(err, ConveyorError::InvalidState(_)));
    }

    #[test]
    fn test_wave_tracks_unsettled_once() {
        let mut wave = Wave::default();
        wave.unsettle(3);
        wave.unsettle(3);
        wave.unsettle(4);
        assert_eq!(wave.unsettled, vec![3, 4]);
        wave.settle(3);
        assert_eq!(wave.unsettled, vec![4]);
    }

    #[tokio::test]
    async fn test_conclude_wraps_post_actuation_failures() {
        let wave = Wave {
            actuated: true,
            unsettled: vec![9],
        };
        let failure: Result<()> = Err(ConveyorError::gateway(&[2], "boom"));
        match conclude_for_test(wave, failure).await {
            Err(ConveyorError::Stranded { carriers, source }) => {
                assert_eq!(carriers, vec![9]);
                assert_eq!(source.kind(), "gateway");
            }
            other => panic!("Expected Stranded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_conclude_passes_through_precondition_failures() {
        let failure: Result<()> = Err(ConveyorError::NotAvailable { carrier: 6 });
        let result = conclude_for_test(Wave::default(), failure).await;
        assert!(matches!(result, Err(ConveyorError::NotAvailable { carrier: 6 })));
    }

    async fn conclude_for_test(wave: Wave, result: Result<()>) -> Result<()> {
        use crate::dispatch::simulator::SimulatedConveyor;
        use crate::dispatch::store::CarrierStore;

        let dispatcher = Dispatcher {
            gateway: Arc::new(SimulatedConveyor::new(vec![1, 2])),
            store: StoreHandle::new(CarrierStore::open_in_memory().unwrap()),
            topology: RingTopology::new(vec![1, 2]).unwrap(),
            config: DispatcherConfig::default(),
            op_lock: Mutex::new(()),
        };
        dispatcher.conclude("test", wave, result).await
    }
}
