use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::events::{DispatchEvent, broadcast_event};
use super::models::{Carrier, CarrierId, CheckpointId, CheckpointQueue};
use super::orchestrator::Dispatcher;
use super::simulator::SimulatedConveyor;
use crate::errors::ConveyorError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub events_tx: broadcast::Sender<String>,
    /// Present only when the server drives the simulated conveyor.
    pub simulator: Option<Arc<SimulatedConveyor>>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Deserialize)]
pub struct MoveCarrierRequest {
    pub checkpoint: CheckpointId,
}

#[derive(Deserialize)]
pub struct ClearParams {
    pub wait_for_next: Option<bool>,
}

#[derive(Serialize, Deserialize)]
pub struct ClearResponse {
    pub checkpoint: CheckpointId,
    pub carriers: Vec<CarrierId>,
}

#[derive(Serialize, Deserialize)]
pub struct CheckpointsResponse {
    pub ring: Vec<CheckpointId>,
    pub queues: Vec<CheckpointQueue>,
}

#[derive(Serialize, Deserialize)]
pub struct StoredResponse {
    pub carrier_id: CarrierId,
}

#[derive(Serialize, Deserialize)]
pub struct SimulatorCheckpoint {
    pub checkpoint: CheckpointId,
    pub present: usize,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Dispatch(ConveyorError),
    NotFound(String),
    Conflict(String),
}

impl From<ConveyorError> for ApiError {
    fn from(err: ConveyorError) -> Self {
        ApiError::Dispatch(err)
    }
}

fn status_for(err: &ConveyorError) -> StatusCode {
    match err {
        ConveyorError::NotAvailable { .. } => StatusCode::CONFLICT,
        ConveyorError::UnknownCheckpoint { .. } | ConveyorError::UnknownCarrier { .. } => {
            StatusCode::NOT_FOUND
        }
        ConveyorError::Gateway { .. } => StatusCode::BAD_GATEWAY,
        ConveyorError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ConveyorError::InvalidState(_)
        | ConveyorError::Stranded { .. }
        | ConveyorError::Store(_)
        | ConveyorError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Dispatch(err) => {
                let status = status_for(&err);
                let mut body = serde_json::json!({
                    "error": err.to_string(),
                    "kind": err.kind(),
                });
                if let ConveyorError::Stranded { carriers, .. } = &err {
                    body["carriers"] = serde_json::json!(carriers);
                }
                (status, Json(body)).into_response()
            }
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": msg, "kind": "not_found"})),
            )
                .into_response(),
            ApiError::Conflict(msg) => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({"error": msg, "kind": "conflict"})),
            )
                .into_response(),
        }
    }
}

/// Announce stranded carriers before handing the error back to the caller.
fn dispatch_failure(state: &AppState, err: ConveyorError) -> ApiError {
    if let ConveyorError::Stranded { carriers, source } = &err {
        broadcast_event(
            &state.events_tx,
            &DispatchEvent::CarriersStranded {
                carriers: carriers.clone(),
                error: source.to_string(),
                at: Utc::now(),
            },
        );
    }
    ApiError::Dispatch(err)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/dispatcher/pick", post(pick_from_storage))
        .route("/api/v1/dispatcher/intake/clear", post(clear_intake))
        .route("/api/v1/checkpoints", get(list_checkpoints))
        .route("/api/v1/checkpoints/{id}/clear", post(clear_checkpoint))
        .route("/api/v1/carriers", get(list_carriers))
        .route("/api/v1/carriers/{id}", get(get_carrier))
        .route("/api/v1/carriers/{id}/move", post(move_carrier))
        .route("/api/v1/carriers/{id}/store", post(store_carrier))
        .route(
            "/api/v1/simulator/checkpoints/{id}/deliver",
            post(simulator_deliver),
        )
        .route(
            "/api/v1/simulator/checkpoints/{id}/lift",
            post(simulator_lift),
        )
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn pick_from_storage(
    State(state): State<SharedState>,
) -> Result<(StatusCode, Json<Carrier>), ApiError> {
    let carrier = state
        .dispatcher
        .pick_from_storage()
        .await
        .map_err(|e| dispatch_failure(&state, e))?;
    broadcast_event(
        &state.events_tx,
        &DispatchEvent::CarrierPicked {
            carrier: carrier.clone(),
            at: Utc::now(),
        },
    );
    Ok((StatusCode::CREATED, Json(carrier)))
}

async fn clear_intake(State(state): State<SharedState>) -> Result<Json<ClearResponse>, ApiError> {
    let checkpoint = state.dispatcher.config().intake_checkpoint;
    let carriers = state
        .dispatcher
        .clear_intake_lock()
        .await
        .map_err(|e| dispatch_failure(&state, e))?;
    Ok(Json(cleared(&state, checkpoint, carriers)))
}

async fn clear_checkpoint(
    State(state): State<SharedState>,
    Path(checkpoint): Path<CheckpointId>,
    Query(params): Query<ClearParams>,
) -> Result<Json<ClearResponse>, ApiError> {
    let wait_for_next = params.wait_for_next.unwrap_or(true);
    let carriers = state
        .dispatcher
        .clear_lock(checkpoint, wait_for_next)
        .await
        .map_err(|e| dispatch_failure(&state, e))?;
    Ok(Json(cleared(&state, checkpoint, carriers)))
}

fn cleared(state: &AppState, checkpoint: CheckpointId, carriers: Vec<CarrierId>) -> ClearResponse {
    if !carriers.is_empty() {
        broadcast_event(
            &state.events_tx,
            &DispatchEvent::CheckpointCleared {
                checkpoint,
                carriers: carriers.clone(),
                at: Utc::now(),
            },
        );
    }
    ClearResponse {
        checkpoint,
        carriers,
    }
}

async fn list_checkpoints(
    State(state): State<SharedState>,
) -> Result<Json<CheckpointsResponse>, ApiError> {
    let snapshot = state.dispatcher.snapshot().await?;
    Ok(Json(CheckpointsResponse {
        ring: snapshot.ring,
        queues: snapshot.queues,
    }))
}

async fn list_carriers(State(state): State<SharedState>) -> Result<Json<Vec<Carrier>>, ApiError> {
    let carriers = state
        .dispatcher
        .store()
        .call(|s| s.list_carriers())
        .await?;
    Ok(Json(carriers))
}

async fn get_carrier(
    State(state): State<SharedState>,
    Path(id): Path<CarrierId>,
) -> Result<Json<Carrier>, ApiError> {
    Ok(Json(state.dispatcher.carrier(id).await?))
}

async fn move_carrier(
    State(state): State<SharedState>,
    Path(id): Path<CarrierId>,
    Json(req): Json<MoveCarrierRequest>,
) -> Result<Json<Carrier>, ApiError> {
    let carrier = state
        .dispatcher
        .move_to_lock(id, req.checkpoint)
        .await
        .map_err(|e| dispatch_failure(&state, e))?;
    broadcast_event(
        &state.events_tx,
        &DispatchEvent::CarrierMoved {
            carrier: carrier.clone(),
            destination: req.checkpoint,
            at: Utc::now(),
        },
    );
    Ok(Json(carrier))
}

async fn store_carrier(
    State(state): State<SharedState>,
    Path(id): Path<CarrierId>,
) -> Result<Json<StoredResponse>, ApiError> {
    state
        .dispatcher
        .load_to_storage(id)
        .await
        .map_err(|e| dispatch_failure(&state, e))?;
    broadcast_event(
        &state.events_tx,
        &DispatchEvent::CarrierStored {
            carrier_id: id,
            at: Utc::now(),
        },
    );
    Ok(Json(StoredResponse { carrier_id: id }))
}

fn simulator(state: &AppState) -> Result<&SimulatedConveyor, ApiError> {
    state
        .simulator
        .as_deref()
        .ok_or_else(|| ApiError::NotFound("server is not running a simulated conveyor".into()))
}

async fn simulator_deliver(
    State(state): State<SharedState>,
    Path(checkpoint): Path<CheckpointId>,
) -> Result<Json<SimulatorCheckpoint>, ApiError> {
    let sim = simulator(&state)?;
    sim.place_carriers(checkpoint, 1)?;
    Ok(Json(SimulatorCheckpoint {
        checkpoint,
        present: sim.present_at(checkpoint),
    }))
}

async fn simulator_lift(
    State(state): State<SharedState>,
    Path(checkpoint): Path<CheckpointId>,
) -> Result<Json<SimulatorCheckpoint>, ApiError> {
    let sim = simulator(&state)?;
    if !sim.lift_from(checkpoint)? {
        return Err(ApiError::Conflict(format!(
            "no carrier present on checkpoint {}",
            checkpoint
        )));
    }
    Ok(Json(SimulatorCheckpoint {
        checkpoint,
        present: sim.present_at(checkpoint),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::orchestrator::DispatcherConfig;
    use crate::dispatch::store::{CarrierStore, StoreHandle};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        sim: Arc<SimulatedConveyor>,
        store: StoreHandle,
        events: broadcast::Receiver<String>,
    }

    async fn test_app() -> TestApp {
        let sim = Arc::new(SimulatedConveyor::new(vec![1, 2, 3, 4]));
        let store = StoreHandle::new(CarrierStore::open_in_memory().unwrap());
        store
            .call(|s| s.set_dwell_time(Duration::ZERO))
            .await
            .unwrap();
        let config = DispatcherConfig {
            poll_interval: Duration::from_millis(1),
            sensor_timeout: Duration::from_millis(500),
            intake_timeout: Duration::from_millis(500),
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(sim.clone(), store.clone(), config)
            .await
            .unwrap();
        let (events_tx, events) = broadcast::channel(16);
        let state = Arc::new(AppState {
            dispatcher: Arc::new(dispatcher),
            events_tx,
            simulator: Some(sim.clone()),
        });
        TestApp {
            router: api_router().with_state(state),
            sim,
            store,
            events,
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app().await;
        let response = app.router.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_pick_creates_carrier_and_broadcasts() {
        let mut app = test_app().await;
        app.sim.place_carriers(1, 1).unwrap();

        let response = app
            .router
            .oneshot(post_empty("/api/v1/dispatcher/pick"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let carrier: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(carrier["checkpoint"], 1);
        assert_eq!(carrier["available"], true);

        let event = app.events.recv().await.unwrap();
        assert!(event.contains("carrier_picked"));
    }

    #[tokio::test]
    async fn test_pick_times_out_without_delivery() {
        let app = test_app().await;
        let response = app
            .router
            .oneshot(post_empty("/api/v1/dispatcher/pick"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["kind"], "timeout");
    }

    #[tokio::test]
    async fn test_list_checkpoints_in_ring_order() {
        let app = test_app().await;
        let response = app.router.oneshot(get("/api/v1/checkpoints")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: CheckpointsResponse = body_json(response.into_body()).await;
        assert_eq!(body.ring, vec![1, 2, 3, 4]);
        assert_eq!(body.queues.len(), 4);
        assert!(body.queues.iter().all(|q| q.carriers.is_empty()));
    }

    #[tokio::test]
    async fn test_get_carrier_not_found() {
        let app = test_app().await;
        let response = app.router.oneshot(get("/api/v1/carriers/77")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["kind"], "unknown_carrier");
    }

    #[tokio::test]
    async fn test_move_carrier_to_next_checkpoint() {
        let app = test_app().await;
        let carrier = app.store.call(|s| s.create_carrier(1)).await.unwrap();
        app.sim.place_carriers(1, 1).unwrap();

        let response = app
            .router
            .clone()
            .oneshot(post_json(
                &format!("/api/v1/carriers/{}/move", carrier.id),
                serde_json::json!({"checkpoint": 3}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let moved: Carrier = body_json(response.into_body()).await;
        assert_eq!(moved.checkpoint, Some(3));
        assert_eq!(app.sim.present_at(3), 1);

        let response = app.router.oneshot(get("/api/v1/carriers")).await.unwrap();
        let carriers: Vec<Carrier> = body_json(response.into_body()).await;
        assert_eq!(carriers.len(), 1);
        assert_eq!(carriers[0].checkpoint, Some(3));
    }

    #[tokio::test]
    async fn test_move_unavailable_carrier_conflicts() {
        let app = test_app().await;
        let carrier = app.store.call(|s| s.create_carrier(2)).await.unwrap();
        let id = carrier.id;
        app.store.call(move |s| s.set_available(id, false)).await.unwrap();

        let response = app
            .router
            .oneshot(post_json(
                &format!("/api/v1/carriers/{}/move", id),
                serde_json::json!({"checkpoint": 4}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["kind"], "not_available");
        assert!(app.sim.actuations().is_empty());
    }

    #[tokio::test]
    async fn test_move_to_unknown_checkpoint_is_not_found() {
        let app = test_app().await;
        let carrier = app.store.call(|s| s.create_carrier(1)).await.unwrap();
        app.sim.place_carriers(1, 1).unwrap();
        let response = app
            .router
            .oneshot(post_json(
                &format!("/api/v1/carriers/{}/move", carrier.id),
                serde_json::json!({"checkpoint": 12}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_clear_checkpoint_respects_wait_param() {
        let mut app = test_app().await;
        let carrier = app.store.call(|s| s.create_carrier(2)).await.unwrap();
        app.sim.place_carriers(2, 1).unwrap();

        let response = app
            .router
            .oneshot(post_empty("/api/v1/checkpoints/2/clear?wait_for_next=false"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: ClearResponse = body_json(response.into_body()).await;
        assert_eq!(body.checkpoint, 2);
        assert_eq!(body.carriers, vec![carrier.id]);

        let event = app.events.recv().await.unwrap();
        assert!(event.contains("checkpoint_cleared"));
        let queue = app.store.call(|s| s.queue_at(3)).await.unwrap();
        assert_eq!(queue, vec![carrier.id]);
    }

    #[tokio::test]
    async fn test_store_carrier_removes_it() {
        let app = test_app().await;
        let carrier = app.store.call(|s| s.create_carrier(4)).await.unwrap();
        app.sim.place_carriers(4, 1).unwrap();

        let response = app
            .router
            .clone()
            .oneshot(post_empty(&format!("/api/v1/carriers/{}/store", carrier.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .router
            .oneshot(get(&format!("/api/v1/carriers/{}", carrier.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_simulator_deliver_and_lift() {
        let app = test_app().await;
        let response = app
            .router
            .clone()
            .oneshot(post_empty("/api/v1/simulator/checkpoints/1/deliver"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: SimulatorCheckpoint = body_json(response.into_body()).await;
        assert_eq!(body.present, 1);

        let response = app
            .router
            .clone()
            .oneshot(post_empty("/api/v1/simulator/checkpoints/1/lift"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .router
            .oneshot(post_empty("/api/v1/simulator/checkpoints/1/lift"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&ConveyorError::NotAvailable { carrier: 1 }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ConveyorError::UnknownCheckpoint { id: 9 }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&ConveyorError::gateway(&[1], "down")),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&ConveyorError::Stranded {
                carriers: vec![1],
                source: Box::new(ConveyorError::gateway(&[1], "down")),
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
