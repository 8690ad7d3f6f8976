use std::fmt::{Display, Write};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::{
    error::{IngestError, StoreError},
    ingest::{IngestOutcome, OnExisting},
    models::PortScripts,
    store::{offload, offload_until, Deadline},
    AppState,
};

const SUMMARY_RULE: &str = "---------------------------";

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_report_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/nmap/up", post(upload_report))
        .route("/nmap/ips", get(list_addresses))
        .route("/nmap/ports/{port}", get(addresses_by_port))
        .route("/nmap/show/{ip}", get(show_ports))
        .route("/nmap/show/{ip}/all", get(show_host))
        .route("/nmap/show/{ip}/sum", get(show_summary))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    #[serde(default)]
    force: Option<String>,
}

pub async fn healthz(State(state): State<AppState>) -> Response {
    let queries = state.queries.clone();
    match offload(state.config.request_timeout, move || queries.host_count()).await {
        Ok(hosts) => Json(json!({ "ok": true, "hosts": hosts, "timestamp": Utc::now() }))
            .into_response(),
        Err(err) => {
            error!("Health check failed: {err}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "ok": false, "timestamp": Utc::now() })),
            )
                .into_response()
        }
    }
}

pub async fn upload_report(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Response {
    let force = params.force.as_deref().is_some_and(|v| !v.is_empty());
    let on_existing = OnExisting::from(force);
    info!(bytes = body.len(), force, "Report upload received");

    let ingestor = state.ingestor.clone();
    let deadline = Deadline::after(state.config.request_timeout);
    let result = offload_until(deadline, move |deadline| {
        ingestor.ingest_report_until(&body, on_existing, deadline)
    })
    .await;

    match result {
        Ok(outcome) => plain_text(StatusCode::OK, render_outcome(&outcome)),
        Err(IngestError::MalformedReport(err)) => {
            warn!("Rejected report upload: {err}");
            plain_text(
                StatusCode::BAD_REQUEST,
                "unable to parse xml nmap\nNOK\n".to_string(),
            )
        }
        Err(IngestError::StorageUnavailable(err)) => {
            error!("Report ingestion aborted: {err}");
            plain_text(StatusCode::SERVICE_UNAVAILABLE, "NOK\n".to_string())
        }
    }
}

pub async fn show_host(State(state): State<AppState>, Path(ip): Path<String>) -> Response {
    let queries = state.queries.clone();
    match offload(state.config.request_timeout, move || queries.host_document(&ip)).await {
        Ok(document) => Json(document).into_response(),
        Err(err) => storage_unavailable(err),
    }
}

pub async fn show_ports(State(state): State<AppState>, Path(ip): Path<String>) -> Response {
    let queries = state.queries.clone();
    match offload(state.config.request_timeout, move || queries.port_numbers(&ip)).await {
        Ok(ports) => plain_text(StatusCode::OK, render_lines(&ports)),
        Err(err) => storage_unavailable(err),
    }
}

pub async fn show_summary(State(state): State<AppState>, Path(ip): Path<String>) -> Response {
    let queries = state.queries.clone();
    match offload(state.config.request_timeout, move || queries.port_scripts(&ip)).await {
        Ok(ports) => plain_text(StatusCode::OK, render_summary(&ports)),
        Err(err) => storage_unavailable(err),
    }
}

pub async fn list_addresses(State(state): State<AppState>) -> Response {
    let queries = state.queries.clone();
    match offload(state.config.request_timeout, move || queries.addresses()).await {
        Ok(addresses) => plain_text(StatusCode::OK, render_lines(&addresses)),
        Err(err) => storage_unavailable(err),
    }
}

pub async fn addresses_by_port(
    State(state): State<AppState>,
    Path(port): Path<String>,
) -> Response {
    let Ok(port) = port.trim().parse::<u16>() else {
        return plain_text(
            StatusCode::BAD_REQUEST,
            format!("invalid port number: {port}\n"),
        );
    };

    let queries = state.queries.clone();
    match offload(state.config.request_timeout, move || {
        queries.addresses_with_open_port(port)
    })
    .await
    {
        Ok(addresses) => plain_text(StatusCode::OK, render_lines(&addresses)),
        Err(err) => storage_unavailable(err),
    }
}

fn plain_text(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

fn storage_unavailable(err: StoreError) -> Response {
    error!("Query failed: {err}");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": {
                "code": "STORAGE_UNAVAILABLE",
                "message": err.to_string()
            }
        })),
    )
        .into_response()
}

fn render_lines<T: Display>(items: &[T]) -> String {
    let mut out = String::new();
    for item in items {
        let _ = writeln!(out, "{item}");
    }
    out
}

fn render_summary(ports: &[PortScripts]) -> String {
    let mut out = String::new();
    for port in ports {
        let _ = writeln!(out, "{}:", port.number);
        for script in &port.scripts {
            let _ = writeln!(out, "\t{}:\n\t\t{}", script.title, script.output);
        }
        let _ = writeln!(out, "{SUMMARY_RULE}");
    }
    out
}

fn render_outcome(outcome: &IngestOutcome) -> String {
    let mut out = String::new();
    for host in &outcome.inserted {
        if host.ports.is_empty() {
            let _ = writeln!(out, "adding {}", host.address);
        }
        for port in &host.ports {
            let _ = writeln!(out, "adding {}:{}", host.address, port);
        }
    }
    for address in &outcome.skipped {
        let _ = writeln!(out, "skipping {address}");
    }
    for failure in &outcome.mapping_failures {
        let _ = writeln!(out, "unable to map host #{}: {}", failure.index, failure.reason);
    }
    out.push_str("OK\n");
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
        Router,
    };
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::router;
    use crate::{config::Config, fixtures, store::HostStore, AppState};

    fn test_app() -> (TempDir, Router) {
        test_app_with(|_| {})
    }

    fn test_app_with(configure: impl FnOnce(&mut Config)) -> (TempDir, Router) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            db_path: dir.path().join("db/hosts.db"),
            storage_busy_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            max_report_bytes: 1024 * 1024,
        };
        configure(&mut config);
        let state = AppState::new(config).expect("state");
        (dir, router(state))
    }

    fn stored_hosts(dir: &TempDir) -> u64 {
        HostStore::open(&dir.path().join("db/hosts.db"), Duration::from_secs(2))
            .expect("store")
            .count_hosts()
            .expect("count")
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body");
        (status, String::from_utf8(bytes.to_vec()).expect("utf8"))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    fn upload(uri: &str, report: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::from(report))
            .expect("request")
    }

    #[tokio::test]
    async fn upload_then_replace_flow() {
        let (_dir, app) = test_app();

        let open = fixtures::single_host_report("10.0.0.5", &[(22, "tcp", "open", "ssh")]);
        let (status, body) = send(&app, upload("/nmap/up", open.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "adding 10.0.0.5:22\nOK\n");

        let (_, body) = send(&app, upload("/nmap/up", open)).await;
        assert_eq!(body, "skipping 10.0.0.5\nOK\n");

        let (_, body) = send(&app, get("/nmap/ports/22")).await;
        assert_eq!(body, "10.0.0.5\n");

        let closed = fixtures::single_host_report("10.0.0.5", &[(22, "tcp", "closed", "ssh")]);
        let (status, body) = send(&app, upload("/nmap/up?force=1", closed)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "adding 10.0.0.5:22\nOK\n");

        let (_, body) = send(&app, get("/nmap/ports/22")).await;
        assert_eq!(body, "");
        let (_, body) = send(&app, get("/nmap/show/10.0.0.5")).await;
        assert_eq!(body, "22\n");
        let (_, body) = send(&app, get("/nmap/ips")).await;
        assert_eq!(body, "10.0.0.5\n");
    }

    #[tokio::test]
    async fn empty_force_value_does_not_replace() {
        let (_dir, app) = test_app();
        let report = fixtures::single_host_report("10.0.0.5", &[(22, "tcp", "open", "ssh")]);
        send(&app, upload("/nmap/up", report.clone())).await;
        let (_, body) = send(&app, upload("/nmap/up?force=", report)).await;
        assert_eq!(body, "skipping 10.0.0.5\nOK\n");
    }

    #[tokio::test]
    async fn malformed_upload_reports_nok() {
        let (_dir, app) = test_app();
        let (status, body) = send(&app, upload("/nmap/up", b"not xml at all".to_vec())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "unable to parse xml nmap\nNOK\n");
    }

    #[tokio::test]
    async fn summary_and_full_document() {
        let (_dir, app) = test_app();
        let report = fixtures::report(&[fixtures::FULL_HOST]).into_bytes();
        send(&app, upload("/nmap/up", report)).await;

        let (_, body) = send(&app, get("/nmap/show/192.168.1.20/sum")).await;
        assert_eq!(
            body,
            "22:\n\tssh-hostkey:\n\t\t2048 aa:bb (RSA)\n256 cc:dd (ED25519)\n---------------------------\n53:\n---------------------------\n"
        );

        let (status, body) = send(&app, get("/nmap/show/192.168.1.20/all")).await;
        assert_eq!(status, StatusCode::OK);
        let doc: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(doc["address"], "192.168.1.20");
        assert_eq!(doc["name"], "files.lan");
        assert_eq!(doc["ports"][1]["service"], "domain");
        assert_eq!(doc["hostScripts"][0]["output"], "OS: Linux");
        assert_eq!(doc["raw"]["comment"], "nas box");
    }

    #[tokio::test]
    async fn unknown_addresses_return_empty_bodies() {
        let (_dir, app) = test_app();
        let (status, body) = send(&app, get("/nmap/show/10.1.2.3")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");

        let (_, body) = send(&app, get("/nmap/show/10.1.2.3/sum")).await;
        assert_eq!(body, "");

        let (status, body) = send(&app, get("/nmap/show/10.1.2.3/all")).await;
        assert_eq!(status, StatusCode::OK);
        let doc: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(doc["address"], "");
        assert_eq!(doc["ports"], Value::Array(Vec::new()));
    }

    #[tokio::test]
    async fn invalid_port_is_rejected() {
        let (_dir, app) = test_app();
        let (status, _) = send(&app, get("/nmap/ports/ssh")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, get("/nmap/ports/70000")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn healthz_counts_hosts() {
        let (_dir, app) = test_app();
        let report = fixtures::report(&[
            &fixtures::simple_host("10.0.0.1", &[]),
            &fixtures::simple_host("10.0.0.2", &[]),
        ]);
        let (_, body) = send(&app, upload("/nmap/up", report.into_bytes())).await;
        assert_eq!(body, "adding 10.0.0.1\nadding 10.0.0.2\nOK\n");

        let (status, body) = send(&app, get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        let health: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(health["ok"], true);
        assert_eq!(health["hosts"], 2);
    }

    #[tokio::test]
    async fn timed_out_upload_reports_nok_and_commits_nothing() {
        let (dir, app) = test_app_with(|config| config.request_timeout = Duration::ZERO);
        let hosts: Vec<String> = (0..3000u32)
            .map(|i| fixtures::simple_host(&format!("10.2.{}.{}", i / 256, i % 256), &[]))
            .collect();
        let refs: Vec<&str> = hosts.iter().map(String::as_str).collect();

        let (status, body) =
            send(&app, upload("/nmap/up", fixtures::report(&refs).into_bytes())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "NOK\n");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(stored_hosts(&dir), 0);
    }

    #[tokio::test]
    async fn locked_storage_rejects_upload_with_nok() {
        let (dir, app) =
            test_app_with(|config| config.storage_busy_timeout = Duration::from_millis(50));
        let writer = rusqlite::Connection::open(dir.path().join("db/hosts.db")).expect("writer");
        writer.execute_batch("BEGIN IMMEDIATE;").expect("hold write lock");

        let report = fixtures::single_host_report("10.0.0.5", &[(22, "tcp", "open", "ssh")]);
        let (status, body) = send(&app, upload("/nmap/up", report)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "NOK\n");
        drop(writer);

        let (status, body) = send(&app, get("/nmap/ips")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");
    }

    #[tokio::test]
    async fn unreachable_storage_fails_queries() {
        let (dir, app) = test_app();
        std::fs::remove_dir_all(dir.path().join("db")).expect("remove db dir");

        let (status, body) = send(&app, get("/nmap/show/10.0.0.5/all")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let err: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(err["error"]["code"], "STORAGE_UNAVAILABLE");

        let (status, body) = send(&app, get("/healthz")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let health: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(health["ok"], false);

        let report = fixtures::single_host_report("10.0.0.5", &[]);
        let (status, body) = send(&app, upload("/nmap/up", report)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "NOK\n");
    }

    #[tokio::test]
    async fn oversized_report_is_rejected() {
        let (dir, app) = test_app_with(|config| config.max_report_bytes = 1024);

        let large = fixtures::report(&[fixtures::FULL_HOST]).into_bytes();
        assert!(large.len() > 1024);
        let (status, _) = send(&app, upload("/nmap/up", large)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(stored_hosts(&dir), 0);

        let small = fixtures::single_host_report("10.0.0.5", &[]);
        assert!(small.len() <= 1024);
        let (status, body) = send(&app, upload("/nmap/up", small)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "adding 10.0.0.5\nOK\n");
    }
}
