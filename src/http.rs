use crate::metrics::Metrics;
use crate::registry::{ProcessStatus, Registry, RegistryError};
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, header::LOCATION, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub registry: Arc<Registry>,
}

#[derive(Debug, Deserialize)]
struct ProcessRequest {
    process: ProcessSelection,
}

#[derive(Debug, Deserialize)]
struct ProcessSelection {
    #[serde(default)]
    plugins: Vec<String>,
    #[serde(default)]
    filter: Option<Map<String, Value>>,
}

pub fn build_router(metrics: Arc<Metrics>, registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/", get(about))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/plugins", get(list_plugins))
        .route("/plugins/:name", get(get_plugin))
        .route("/processes", get(list_processes).post(create_process))
        .route("/processes/:id", get(poll_process))
        .with_state(HttpAppState { metrics, registry })
}

fn process_href(id: u64) -> String {
    format!("/processes/{id}")
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn registry_error(err: RegistryError) -> Response {
    let status = match err {
        RegistryError::NoSuchCheck(_) | RegistryError::NoSuchProcess(_) => StatusCode::NOT_FOUND,
        RegistryError::NoChecksFound | RegistryError::InvalidFilter(_) => StatusCode::BAD_REQUEST,
        RegistryError::Stopping => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::MissingBaseTemplate | RegistryError::NoChecksLoaded => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, err.to_string())
}

fn in_progress(id: u64) -> Response {
    let href = process_href(id);
    let mut response = (
        StatusCode::ACCEPTED,
        Json(json!({ "asyncTask": { "link": { "poll": href } } })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&href) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}

async fn about() -> impl IntoResponse {
    Json(json!({
        "about": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "links": {
            "plugins": "/plugins",
            "processes": "/processes",
            "metrics": "/metrics",
        }
    }))
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    let gate = state.registry.gate();
    state
        .metrics
        .set_gate(gate.size(), gate.in_flight(), gate.waiting());
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn list_plugins(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(json!({ "plugins": state.registry.list_checks() }))
}

async fn get_plugin(State(state): State<HttpAppState>, Path(name): Path<String>) -> Response {
    match state.registry.get_check(&name) {
        Ok(snapshot) => Json(json!({ "plugin": snapshot })).into_response(),
        Err(err) => registry_error(err),
    }
}

async fn list_processes(State(state): State<HttpAppState>) -> impl IntoResponse {
    let processes: Vec<Value> = state
        .registry
        .list_processes()
        .into_iter()
        .map(|entry| json!({ "href": process_href(entry.id), "plugins": entry.plugins }))
        .collect();
    Json(json!({ "processes": processes }))
}

async fn create_process(State(state): State<HttpAppState>, body: Bytes) -> Response {
    let request: ProcessRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, "malformed process request");
            return error_response(StatusCode::BAD_REQUEST, format!("malformed request: {err}"));
        }
    };
    let selection = request.process;
    if selection.plugins.is_empty() && selection.filter.is_none() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "process needs plugins or filter",
        );
    }

    match state
        .registry
        .add_process(&selection.plugins, selection.filter.as_ref())
    {
        Ok(id) => {
            state.metrics.inc_forced_request();
            in_progress(id)
        }
        Err(err) => {
            warn!(error = %err, "process request rejected");
            registry_error(err)
        }
    }
}

async fn poll_process(State(state): State<HttpAppState>, Path(id): Path<u64>) -> Response {
    match state.registry.poll_process(id) {
        Ok(ProcessStatus::InProgress { .. }) => in_progress(id),
        Ok(ProcessStatus::Complete { plugins }) => Json(json!({
            "id": id,
            "href": process_href(id),
            "plugins": plugins,
        }))
        .into_response(),
        Err(err) => registry_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::Capabilities;
    use crate::registry::{CheckTables, EngineSettings};
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn registry() -> Arc<Registry> {
        let tables = CheckTables {
            templates: match json!({"BasePlugin": {"Timeout": 5}}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            },
            actions: Map::new(),
            plugins: match json!({
                "hello": {"Command": "echo hello", "Group": "web"},
                "other": {"Command": "true"},
            }) {
                Value::Object(map) => map,
                _ => unreachable!(),
            },
        };
        Arc::new(
            Registry::load(
                &tables,
                EngineSettings {
                    concurrency: 2,
                    ..EngineSettings::default()
                },
                Capabilities::builtin(),
            )
            .unwrap(),
        )
    }

    fn app(registry: Arc<Registry>) -> Router {
        build_router(Metrics::new().expect("metrics init"), registry)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Option<String>, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, location, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let response = app(registry()).oneshot(get("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn metrics_contains_gate_capacity() {
        let response = app(registry()).oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("smokerd_gate_capacity 2"));
    }

    #[tokio::test]
    async fn plugins_are_listed() {
        let registry = registry();
        let (status, _, body) = send(app(registry.clone()), get("/plugins")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["plugins"].as_array().unwrap().len(), 2);

        let (status, _, body) = send(app(registry.clone()), get("/plugins/hello")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["plugin"]["parameters"]["Command"], json!("echo hello"));

        let (status, _, _) = send(app(registry), get("/plugins/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn process_request_validation() {
        let registry = registry();
        let (status, _, _) = send(app(registry.clone()), post("/processes", "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = send(app(registry.clone()), post("/processes", r#"{"process": {}}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = send(
            app(registry.clone()),
            post("/processes", r#"{"process": {"plugins": ["missing"]}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = send(
            app(registry.clone()),
            post("/processes", r#"{"process": {"filter": {"Group": "db"}}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = send(app(registry), get("/processes/7")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn forced_run_round_trip() {
        let registry = registry();
        let (status, location, body) = send(
            app(registry.clone()),
            post("/processes", r#"{"process": {"filter": {"Group": "web"}}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(location.as_deref(), Some("/processes/1"));
        assert_eq!(body["asyncTask"]["link"]["poll"], json!("/processes/1"));

        let (status, _, _) = send(app(registry.clone()), get("/processes/1")).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let mut done = None;
        for _ in 0..200 {
            registry.tick();
            let (status, _, body) = send(app(registry.clone()), get("/processes/1")).await;
            if status == StatusCode::OK {
                done = Some(body);
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let body = done.expect("process completed");
        assert_eq!(body["plugins"][0]["name"], json!("hello"));
        assert_eq!(
            body["plugins"][0]["forcedResult"]["messages"]["info"],
            json!(["hello"])
        );

        let (_, _, list) = send(app(registry), get("/processes")).await;
        assert_eq!(list["processes"][0]["href"], json!("/processes/1"));
        assert_eq!(list["processes"][0]["plugins"], json!(["hello"]));
    }
}
