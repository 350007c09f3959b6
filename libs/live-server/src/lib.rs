pub mod broker;
mod ws;

pub use broker::{Broker, BrokerHandle, SubscriberId};
pub use ws::WsTiming;

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use fleet_api::{EntryFields, PositionStream};

#[derive(Clone)]
struct AppState {
    stream: Arc<dyn PositionStream>,
    broker: BrokerHandle,
    timing: WsTiming,
}

/// HTTP + WebSocket front: the live-subscriber endpoint, the producer
/// append boundary, and a liveness probe.
pub async fn run(
    port: u16,
    stream: Arc<dyn PositionStream>,
    broker: BrokerHandle,
    timing: WsTiming,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let state = AppState {
        stream,
        broker,
        timing,
    };

    let app = Router::new()
        .route("/healthz", get(handle_health))
        .route("/locations", post(handle_post_location))
        .route("/ws", get(ws::handle_ws))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|e| format!("bind api :{port}: {e}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| format!("axum serve: {e}"))?;

    Ok(())
}

// --- GET /healthz ---

async fn handle_health() -> impl IntoResponse {
    axum::Json(json!({"status": "ok"}))
}

// --- POST /locations ---

#[derive(Debug, Deserialize)]
struct LocationRequest {
    #[serde(rename = "busId")]
    bus_id: String,
    latitude: f64,
    longitude: f64,
    /// Unix epoch seconds.
    timestamp: i64,
    #[serde(rename = "speedKph", default)]
    speed_kph: f64,
    #[serde(default)]
    heading: f64,
}

/// Max tolerated clock skew for producer timestamps.
const MAX_FUTURE_SKEW_SECS: i64 = 300;

fn validate_location(req: &LocationRequest, now_secs: i64) -> Result<(), &'static str> {
    if req.bus_id.is_empty() {
        return Err("busId is required");
    }
    if !(req.latitude > -90.0 && req.latitude < 90.0) {
        return Err("latitude out of range");
    }
    if !(req.longitude > -180.0 && req.longitude < 180.0) {
        return Err("longitude out of range");
    }
    if req.timestamp > now_secs + MAX_FUTURE_SKEW_SECS {
        return Err("timestamp too far in the future");
    }
    Ok(())
}

/// Producer append boundary: validate, assign a message id, append to
/// the durable stream. The producer sees only the append outcome; all
/// downstream processing is asynchronous.
async fn handle_post_location(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<LocationRequest>,
) -> impl IntoResponse {
    if let Err(reason) = validate_location(&req, fleet_api::now_secs()) {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"error": reason})),
        )
            .into_response();
    }

    let msg_id = uuid::Uuid::new_v4().to_string();
    let mut fields = EntryFields::new();
    fields.insert("msgId".to_string(), json!(msg_id));
    fields.insert("busId".to_string(), json!(req.bus_id));
    fields.insert("lat".to_string(), json!(req.latitude));
    fields.insert("lon".to_string(), json!(req.longitude));
    fields.insert("ts".to_string(), json!(req.timestamp));
    fields.insert("speed".to_string(), json!(req.speed_kph));
    fields.insert("heading".to_string(), json!(req.heading));

    match state.stream.append(fields).await {
        Ok(id) => {
            tracing::debug!(entry = %id, bus = %req.bus_id, "position accepted");
            axum::Json(json!({"msgId": msg_id})).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "append failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({"error": "ingest failed"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_api::{EntryId, PositionReport, StreamError};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Stream that records appended fields; appends fail on demand.
    #[derive(Default)]
    struct CapturingStream {
        appended: Mutex<Vec<EntryFields>>,
        fail: AtomicBool,
    }

    impl PositionStream for CapturingStream {
        fn append(
            &self,
            fields: EntryFields,
        ) -> Pin<Box<dyn Future<Output = Result<EntryId, StreamError>> + Send + '_>> {
            Box::pin(async move {
                if self.fail.load(Ordering::SeqCst) {
                    return Err(StreamError::Unavailable);
                }
                let mut appended = self.appended.lock().unwrap();
                appended.push(fields);
                Ok(EntryId(appended.len() as u64))
            })
        }

        fn create_group(
            &self,
            _group: &str,
        ) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn read_group(
            &self,
            _group: &str,
            _consumer: &str,
            _max_count: usize,
            _block: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<fleet_api::StreamEntry>, StreamError>> + Send + '_>>
        {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn ack(
            &self,
            _group: &str,
            _id: EntryId,
        ) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn state(stream: Arc<dyn PositionStream>) -> AppState {
        let (_events_tx, events_rx) = mpsc::channel(8);
        let (_broker, broker) = Broker::new(events_rx, 8);
        AppState {
            stream,
            broker,
            timing: WsTiming::default(),
        }
    }

    fn request(lat: f64, lon: f64, ts: i64) -> LocationRequest {
        LocationRequest {
            bus_id: "bus-1".to_string(),
            latitude: lat,
            longitude: lon,
            timestamp: ts,
            speed_kph: 30.0,
            heading: 0.0,
        }
    }

    #[test]
    fn accepts_a_plain_report() {
        assert_eq!(validate_location(&request(19.0, 72.0, 1_000), 1_000), Ok(()));
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(validate_location(&request(90.0, 72.0, 1_000), 1_000).is_err());
        assert!(validate_location(&request(-90.0, 72.0, 1_000), 1_000).is_err());
        assert!(validate_location(&request(19.0, 180.0, 1_000), 1_000).is_err());
        assert!(validate_location(&request(19.0, -180.0, 1_000), 1_000).is_err());
    }

    #[test]
    fn rejects_empty_bus_id() {
        let mut req = request(19.0, 72.0, 1_000);
        req.bus_id.clear();
        assert_eq!(validate_location(&req, 1_000), Err("busId is required"));
    }

    #[test]
    fn rejects_far_future_timestamps() {
        // Five minutes of skew is tolerated, a second past it is not.
        assert_eq!(validate_location(&request(19.0, 72.0, 1_300), 1_000), Ok(()));
        assert!(validate_location(&request(19.0, 72.0, 1_301), 1_000).is_err());
    }

    // The HTTP body names (latitude/longitude/timestamp/speedKph) map to
    // the stream's field names (lat/lon/ts/speed), with a generated msgId
    // that also lands in the response.
    #[tokio::test]
    async fn post_location_appends_wire_named_fields() {
        let stream = Arc::new(CapturingStream::default());
        let req = LocationRequest {
            bus_id: "bus-9".to_string(),
            latitude: 19.07,
            longitude: 72.87,
            timestamp: 1_700_000_000,
            speed_kph: 28.5,
            heading: 180.0,
        };

        let response = handle_post_location(State(state(stream.clone())), axum::Json(req))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(!reply["msgId"].as_str().unwrap().is_empty());

        let appended = stream.appended.lock().unwrap();
        assert_eq!(appended.len(), 1);
        let fields = &appended[0];
        assert_eq!(fields["busId"], json!("bus-9"));
        assert_eq!(fields["lat"], json!(19.07));
        assert_eq!(fields["lon"], json!(72.87));
        assert_eq!(fields["ts"], json!(1_700_000_000));
        assert_eq!(fields["speed"], json!(28.5));
        assert_eq!(fields["heading"], json!(180.0));
        assert_eq!(fields["msgId"], reply["msgId"]);

        // What the producer appends, the worker can decode.
        let report = PositionReport::decode(fields).unwrap();
        assert_eq!(report.bus_id, "bus-9");
        assert_eq!(report.speed_kph, 28.5);
    }

    #[tokio::test]
    async fn append_failure_maps_to_server_error() {
        let stream = Arc::new(CapturingStream {
            fail: AtomicBool::new(true),
            ..CapturingStream::default()
        });

        let response = handle_post_location(
            State(state(stream.clone())),
            axum::Json(request(19.0, 72.0, 1_700_000_000)),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply["error"], json!("ingest failed"));
        assert!(stream.appended.lock().unwrap().is_empty());
    }
}
