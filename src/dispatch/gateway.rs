use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::{CheckpointId, CheckpointStatus};
use crate::errors::{ConveyorError, Result};

/// Physical conveyor as seen by the dispatcher.
///
/// Real implementation: `HttpGateway`. In-process double: `SimulatedConveyor`.
/// Actuation calls accept several checkpoints at once; an empty slice is a
/// no-op that never reaches the hardware.
#[async_trait]
pub trait HardwareGateway: Send + Sync {
    /// Checkpoint ids in ring order.
    async fn list_checkpoint_ids(&self) -> Result<Vec<CheckpointId>>;

    async fn status(&self, checkpoint: CheckpointId) -> Result<CheckpointStatus>;

    /// Release exactly one carrier from each checkpoint.
    async fn advance_one(&self, checkpoints: &[CheckpointId]) -> Result<()>;

    /// Hold gates open so carriers flow through.
    async fn open(&self, checkpoints: &[CheckpointId]) -> Result<()>;

    async fn close(&self, checkpoints: &[CheckpointId]) -> Result<()>;
}

// ── HTTP gateway ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct IdsRequest<'a> {
    ids: &'a [CheckpointId],
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    body: T,
}

#[derive(Debug, Deserialize)]
struct ConveyorState {
    locks_state: Vec<LockState>,
}

#[derive(Debug, Deserialize)]
struct LockState {
    id: CheckpointId,
}

#[derive(Debug, Deserialize)]
struct LockStatus {
    is_busy: BusyFlag,
}

/// Sensor flag as the controller reports it: a JSON bool or "YES"/"NO".
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BusyFlag {
    Bool(bool),
    Text(String),
}

impl BusyFlag {
    fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Text(s) => match s.to_ascii_uppercase().as_str() {
                "YES" | "TRUE" | "1" => Some(true),
                "NO" | "FALSE" | "0" => Some(false),
                _ => None,
            },
        }
    }
}

/// Gateway talking to the conveyor controller's JSON API.
///
/// Every call is a `POST {base_url}/<endpoint>`. Non-2xx replies and
/// transport failures become `ConveyorError::Gateway` carrying the
/// controller's message.
#[derive(Clone)]
pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConveyorError::gateway(&[], format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint)
    }

    async fn post(
        &self,
        endpoint: &str,
        checkpoints: &[CheckpointId],
        body: Option<IdsRequest<'_>>,
    ) -> Result<reqwest::Response> {
        let url = self.endpoint_url(endpoint);
        debug!(%url, ?checkpoints, "gateway request");
        let mut request = self.client.post(&url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        request.send().await.map_err(|e| {
            ConveyorError::gateway(checkpoints, format!("{endpoint} request failed: {e}"))
        })
    }

    async fn actuate(&self, endpoint: &str, checkpoints: &[CheckpointId]) -> Result<()> {
        if checkpoints.is_empty() {
            return Ok(());
        }
        let response = self
            .post(endpoint, checkpoints, Some(IdsRequest { ids: checkpoints }))
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(error_from_response(endpoint, checkpoints, response).await)
    }
}

/// Build a gateway error from a failed reply, preferring the controller's
/// own `body`/`data` text over the raw payload.
async fn error_from_response(
    endpoint: &str,
    checkpoints: &[CheckpointId],
    response: reqwest::Response,
) -> ConveyorError {
    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    let detail = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| {
            ["body", "data", "error"].iter().find_map(|key| match value.get(*key) {
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(serde_json::Value::Null) | None => None,
                Some(other) => Some(other.to_string()),
            })
        })
        .unwrap_or_else(|| String::from_utf8_lossy(&body).to_string());
    ConveyorError::gateway(
        checkpoints,
        format!("{endpoint} returned {status}: {detail}"),
    )
}

#[async_trait]
impl HardwareGateway for HttpGateway {
    async fn list_checkpoint_ids(&self) -> Result<Vec<CheckpointId>> {
        let response = self.post("status", &[], None).await?;
        if !response.status().is_success() {
            return Err(error_from_response("status", &[], response).await);
        }
        let envelope: Envelope<ConveyorState> = response.json().await.map_err(|e| {
            ConveyorError::gateway(&[], format!("invalid conveyor status payload: {e}"))
        })?;
        Ok(envelope.body.locks_state.into_iter().map(|l| l.id).collect())
    }

    async fn status(&self, checkpoint: CheckpointId) -> Result<CheckpointStatus> {
        let ids = [checkpoint];
        let response = self
            .post("locks/status", &ids, Some(IdsRequest { ids: &ids }))
            .await?;
        match response.status() {
            s if s.is_success() => {}
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
                return Err(ConveyorError::UnknownCheckpoint { id: checkpoint });
            }
            _ => return Err(error_from_response("locks/status", &ids, response).await),
        }
        let envelope: Envelope<Vec<LockStatus>> = response.json().await.map_err(|e| {
            ConveyorError::gateway(&ids, format!("invalid lock status payload: {e}"))
        })?;
        let lock = envelope
            .body
            .first()
            .ok_or_else(|| ConveyorError::gateway(&ids, "lock status payload is empty"))?;
        let is_busy = lock.is_busy.as_bool().ok_or_else(|| {
            ConveyorError::gateway(&ids, format!("unrecognised busy flag {:?}", lock.is_busy))
        })?;
        Ok(CheckpointStatus {
            id: checkpoint,
            is_busy,
        })
    }

    async fn advance_one(&self, checkpoints: &[CheckpointId]) -> Result<()> {
        self.actuate("locks/pass_one", checkpoints).await
    }

    async fn open(&self, checkpoints: &[CheckpointId]) -> Result<()> {
        self.actuate("locks/open", checkpoints).await
    }

    async fn close(&self, checkpoints: &[CheckpointId]) -> Result<()> {
        self.actuate("locks/close", checkpoints).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode as AxumStatus, routing::post};
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<(String, Value)>>>;

    /// Spawn a fake controller on an ephemeral port and return its base URL.
    async fn spawn_controller(calls: Calls) -> String {
        let record = |name: &'static str, calls: Calls| {
            move |Json(body): Json<Value>| {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push((name.to_string(), body));
                    Json(json!({"status": 200, "body": "ok"}))
                }
            }
        };

        let app = Router::new()
            .route(
                "/api/v1/conveyor/status",
                post(|| async {
                    Json(json!({"status": 200, "body": {"locks_state": [
                        {"id": 1}, {"id": 2}, {"id": 3}, {"id": 4}
                    ]}}))
                }),
            )
            .route(
                "/api/v1/conveyor/locks/status",
                post(|Json(body): Json<Value>| async move {
                    match body["ids"][0].as_i64() {
                        Some(1) => (AxumStatus::OK, Json(json!({"body": [{"is_busy": "YES"}]}))),
                        Some(2) => (AxumStatus::OK, Json(json!({"body": [{"is_busy": false}]}))),
                        Some(3) => (
                            AxumStatus::INTERNAL_SERVER_ERROR,
                            Json(json!({"data": "sensor offline"})),
                        ),
                        _ => (
                            AxumStatus::BAD_REQUEST,
                            Json(json!({"body": "Lock is not attached to conveyor"})),
                        ),
                    }
                }),
            )
            .route(
                "/api/v1/conveyor/locks/pass_one",
                post(record("pass_one", calls.clone())),
            )
            .route("/api/v1/conveyor/locks/open", post(record("open", calls.clone())))
            .route(
                "/api/v1/conveyor/locks/close",
                post(|| async {
                    (
                        AxumStatus::SERVICE_UNAVAILABLE,
                        Json(json!({"body": "Can't close locks"})),
                    )
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api/v1/conveyor/", addr)
    }

    fn gateway(base_url: String) -> HttpGateway {
        HttpGateway::new(base_url, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_endpoint_url_joins_with_single_slash() {
        let gw = gateway("http://conveyor:5000/api/v1/conveyor/".into());
        assert_eq!(
            gw.endpoint_url("locks/open"),
            "http://conveyor:5000/api/v1/conveyor/locks/open"
        );
        let gw = gateway("http://conveyor:5000/api/v1/conveyor".into());
        assert_eq!(gw.base_url(), "http://conveyor:5000/api/v1/conveyor");
        assert_eq!(
            gw.endpoint_url("status"),
            "http://conveyor:5000/api/v1/conveyor/status"
        );
    }

    #[test]
    fn test_busy_flag_accepts_bool_and_text() {
        assert_eq!(BusyFlag::Bool(true).as_bool(), Some(true));
        assert_eq!(BusyFlag::Text("YES".into()).as_bool(), Some(true));
        assert_eq!(BusyFlag::Text("no".into()).as_bool(), Some(false));
        assert_eq!(BusyFlag::Text("maybe".into()).as_bool(), None);
    }

    #[tokio::test]
    async fn test_list_checkpoint_ids_reads_locks_state() {
        let url = spawn_controller(Calls::default()).await;
        let ids = gateway(url).list_checkpoint_ids().await.unwrap();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_status_parses_busy_flag() {
        let url = spawn_controller(Calls::default()).await;
        let gw = gateway(url);
        assert!(gw.status(1).await.unwrap().is_busy);
        assert!(!gw.status(2).await.unwrap().is_busy);
    }

    #[tokio::test]
    async fn test_status_rejected_checkpoint_is_unknown() {
        let url = spawn_controller(Calls::default()).await;
        let err = gateway(url).status(9).await.unwrap_err();
        assert!(matches!(err, ConveyorError::UnknownCheckpoint { id: 9 }));
    }

    #[tokio::test]
    async fn test_status_server_error_carries_data_text() {
        let url = spawn_controller(Calls::default()).await;
        let err = gateway(url).status(3).await.unwrap_err();
        match err {
            ConveyorError::Gateway {
                checkpoints,
                message,
            } => {
                assert_eq!(checkpoints, vec![3]);
                assert!(message.contains("sensor offline"));
            }
            other => panic!("Expected Gateway error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_actuation_sends_ids_body() {
        let calls = Calls::default();
        let url = spawn_controller(calls.clone()).await;
        let gw = gateway(url);
        gw.advance_one(&[2, 3]).await.unwrap();
        gw.open(&[4]).await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "pass_one");
        assert_eq!(calls[0].1, json!({"ids": [2, 3]}));
        assert_eq!(calls[1].0, "open");
        assert_eq!(calls[1].1, json!({"ids": [4]}));
    }

    #[tokio::test]
    async fn test_empty_actuation_is_noop() {
        let calls = Calls::default();
        let url = spawn_controller(calls.clone()).await;
        let gw = gateway(url);
        gw.advance_one(&[]).await.unwrap();
        gw.open(&[]).await.unwrap();
        // close always fails on the fake controller, so success proves no request
        gw.close(&[]).await.unwrap();
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_actuation_failure_is_gateway_error() {
        let url = spawn_controller(Calls::default()).await;
        let err = gateway(url).close(&[1, 2]).await.unwrap_err();
        assert_eq!(err.kind(), "gateway");
        assert!(err.to_string().contains("Can't close locks"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_controller_is_gateway_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let gw = HttpGateway::new(format!("http://{}/", addr), Duration::from_millis(500)).unwrap();
        let err = gw.list_checkpoint_ids().await.unwrap_err();
        assert!(matches!(err, ConveyorError::Gateway { .. }));
    }
}
