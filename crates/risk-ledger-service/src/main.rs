use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use risk_ledger_api::{
    load_policy, CompareRequest, IngestResult, LedgerCompareRequest, MigrateResult, PeriodUpdate,
    RiskLedgerApi, StoreBackend, StoreConfig, API_CONTRACT_VERSION,
};
use risk_ledger_core::{ComparisonReport, ProjectId, ProjectLedger};
use risk_ledger_store::SchemaStatus;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: RiskLedgerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "risk-ledger-service")]
#[command(about = "Local HTTP service for the risk ledger")]
struct Args {
    #[arg(long, default_value = "json")]
    store: StoreBackend,
    #[arg(long, default_value = "./risk_ledger")]
    path: PathBuf,
    /// YAML decay policy; built-in thresholds when omitted.
    #[arg(long)]
    policy: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        let message = message.into();
        warn!(error = %message, "request failed");
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message }
    }
}

/// Unwrap a JSON body, reporting rejections in the service error envelope.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    payload.map(|Json(body)| body).map_err(|rejection| ServiceState::error(rejection.body_text()))
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/projects", get(projects_list))
        .route("/v1/projects/:project_id/ledger", get(ledger_show))
        .route("/v1/projects/:project_id/ingest", post(ledger_ingest))
        .route("/v1/projects/:project_id/compare", post(ledger_compare))
        .route("/v1/compare", post(updates_compare))
        .with_state(state)
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut api = RiskLedgerApi::new(StoreConfig::new(args.store, args.path));
    if let Some(policy_path) = &args.policy {
        api = api.with_policy(load_policy(policy_path)?)?;
    }
    let state = ServiceState { api };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, backend = args.store.as_str(), "risk ledger service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse {
        status: "ok",
        backend: state.api.store_config().backend.as_str(),
    }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    payload: Result<Json<MigrateRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let request = json_body(payload)?;
    let result =
        state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn projects_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<ProjectId>>>, ServiceError> {
    let projects = state.api.list_projects().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(projects)))
}

async fn ledger_show(
    State(state): State<ServiceState>,
    Path(project_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ProjectLedger>>, ServiceError> {
    let ledger =
        state.api.show_ledger(&project_id).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(ledger)))
}

async fn ledger_ingest(
    State(state): State<ServiceState>,
    Path(project_id): Path<String>,
    payload: Result<Json<PeriodUpdate>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<IngestResult>>, ServiceError> {
    let update = json_body(payload)?;
    let result = state
        .api
        .ingest(&project_id, update)
        .map_err(|err| ServiceState::error(format!("{err:#}")))?;
    Ok(Json(envelope(result)))
}

async fn ledger_compare(
    State(state): State<ServiceState>,
    Path(project_id): Path<String>,
    payload: Result<Json<LedgerCompareRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ComparisonReport>>, ServiceError> {
    let request = json_body(payload)?;
    let report = state
        .api
        .compare_ledger(&project_id, request)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(report)))
}

async fn updates_compare(
    State(state): State<ServiceState>,
    payload: Result<Json<CompareRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ComparisonReport>>, ServiceError> {
    let request = json_body(payload)?;
    let report =
        state.api.compare_updates(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn state_in(dir: &tempfile::TempDir, backend: StoreBackend) -> ServiceState {
        ServiceState {
            api: RiskLedgerApi::new(StoreConfig::new(backend, dir.path().to_path_buf())),
        }
    }

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"))
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, payload: Option<Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match payload {
            Some(payload) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(payload.to_string())),
            None => builder.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn vendor_update(period: &str, severity: &str, attention: &str) -> Value {
        serde_json::json!({
            "period": period,
            "records": [{
                "description": "Vendor contract unsigned",
                "category": "Schedule",
                "severity": severity,
                "attention_level": attention,
                "suggested_owner": "Vendor Manager"
            }]
        })
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let dir = temp_dir();
        let router = app(state_in(&dir, StoreBackend::Json));

        let response = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value.pointer("/data/backend").and_then(Value::as_str), Some("json"));
    }

    #[tokio::test]
    async fn ingest_show_and_compare_ledger_flow() {
        let dir = temp_dir();
        let router = app(state_in(&dir, StoreBackend::Sqlite));

        let first = send(
            &router,
            "POST",
            "/v1/projects/apollo/ingest",
            Some(vendor_update("2026-W01", "Medium", "Near-term")),
        )
        .await;
        assert_eq!(first.status(), StatusCode::OK);
        let first = response_json(first).await;
        assert_eq!(
            first.get("api_contract_version").and_then(Value::as_str),
            Some(API_CONTRACT_VERSION)
        );
        assert_eq!(
            first.pointer("/data/summary/created/0").and_then(Value::as_str),
            Some("vendor_dependency")
        );

        let second = send(
            &router,
            "POST",
            "/v1/projects/apollo/ingest",
            Some(vendor_update("2026-W02", "High", "Immediate")),
        )
        .await;
        assert_eq!(second.status(), StatusCode::OK);
        let second = response_json(second).await;
        assert_eq!(
            second.pointer("/data/escalation_summary/0").and_then(Value::as_str),
            Some("- Vendor contract unsigned (Owner: Vendor Manager, Severity: High)")
        );

        let ledger =
            response_json(send(&router, "GET", "/v1/projects/apollo/ledger", None).await).await;
        assert_eq!(
            ledger.pointer("/data/risks/vendor_dependency/current_status").and_then(Value::as_str),
            Some("Escalated")
        );
        assert_eq!(
            ledger.pointer("/data/risks/vendor_dependency/periods_open").and_then(Value::as_u64),
            Some(2)
        );

        let projects = response_json(send(&router, "GET", "/v1/projects", None).await).await;
        assert_eq!(projects.pointer("/data/0").and_then(Value::as_str), Some("apollo"));

        let compared = send(
            &router,
            "POST",
            "/v1/projects/apollo/compare",
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(compared.status(), StatusCode::OK);
        let compared = response_json(compared).await;
        assert_eq!(
            compared.pointer("/data/change_summary/escalated/0").and_then(Value::as_str),
            Some("Vendor contract unsigned (Medium → High)")
        );
        assert_eq!(
            compared.pointer("/data/leadership_summary").and_then(Value::as_str),
            Some("1 risk(s) have escalated since the last update.")
        );
    }

    #[tokio::test]
    async fn compare_updates_requires_two_periods() {
        let dir = temp_dir();
        let router = app(state_in(&dir, StoreBackend::Json));

        let single =
            serde_json::json!({ "updates": [vendor_update("2026-W01", "High", "Immediate")] });
        let response = send(&router, "POST", "/v1/compare", Some(single)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value
            .get("error")
            .and_then(Value::as_str)
            .is_some_and(|error| error.contains("at least two periods")));

        let pair = serde_json::json!({
            "updates": [
                vendor_update("2026-W01", "High", "Immediate"),
                vendor_update("2026-W02", "Low", "Monitor")
            ]
        });
        let response = send(&router, "POST", "/v1/compare", Some(pair)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(
            value.pointer("/data/change_summary/de_escalated/0").and_then(Value::as_str),
            Some("Vendor contract unsigned (High → Low)")
        );
        assert_eq!(
            value.pointer("/data/risk_comparison_table/0/trend").and_then(Value::as_str),
            Some("Down")
        );
    }

    #[tokio::test]
    async fn invalid_input_is_reported_with_error_envelope() {
        let dir = temp_dir();
        let router = app(state_in(&dir, StoreBackend::Json));

        let response = send(
            &router,
            "POST",
            "/v1/projects/bad%20id/ingest",
            Some(vendor_update("2026-W01", "High", "Immediate")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value
            .get("error")
            .and_then(Value::as_str)
            .is_some_and(|error| error.contains("invalid project id")));

        let malformed = serde_json::json!({
            "period": "2026-W01",
            "records": [{
                "description": "Vendor contract unsigned",
                "category": "Schedule",
                "severity": "High"
            }]
        });
        let response = send(&router, "POST", "/v1/projects/apollo/ingest", Some(malformed)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value
            .get("error")
            .and_then(Value::as_str)
            .is_some_and(|error| error.contains("attention_level")));
    }

    #[tokio::test]
    async fn ingest_rejects_body_without_records_and_keeps_ledger() {
        let dir = temp_dir();
        let router = app(state_in(&dir, StoreBackend::Json));

        let first = send(
            &router,
            "POST",
            "/v1/projects/apollo/ingest",
            Some(vendor_update("2026-W01", "Low", "Monitor")),
        )
        .await;
        assert_eq!(first.status(), StatusCode::OK);
        let before = response_json(send(&router, "GET", "/v1/projects/apollo/ledger", None).await)
            .await
            .get("data")
            .cloned();

        let records = vendor_update("2026-W02", "Low", "Monitor")
            .get("records")
            .cloned()
            .unwrap_or_else(|| panic!("fixture should carry records"));
        let misnamed = serde_json::json!({ "period": "2026-W02", "risks": records });
        let response = send(&router, "POST", "/v1/projects/apollo/ingest", Some(misnamed)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert!(value
            .get("error")
            .and_then(Value::as_str)
            .is_some_and(|error| error.contains("unknown field `risks`")));

        let missing = serde_json::json!({ "period": "2026-W02" });
        let response = send(&router, "POST", "/v1/projects/apollo/ingest", Some(missing)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value
            .get("error")
            .and_then(Value::as_str)
            .is_some_and(|error| error.contains("missing field `records`")));

        let after = response_json(send(&router, "GET", "/v1/projects/apollo/ledger", None).await)
            .await
            .get("data")
            .cloned();
        assert_eq!(after, before);
        let entry = after.as_ref().and_then(|ledger| ledger.pointer("/risks/vendor_dependency"));
        assert_eq!(
            entry
                .and_then(|entry| entry.pointer("/confidence/absence_count"))
                .and_then(Value::as_u64),
            Some(0)
        );
        assert_eq!(
            entry.and_then(|entry| entry.get("periods_open")).and_then(Value::as_u64),
            Some(1)
        );
    }

    #[tokio::test]
    async fn schema_version_and_migrate_on_sqlite() {
        let dir = temp_dir();
        let router = app(state_in(&dir, StoreBackend::Sqlite));

        let status =
            response_json(send(&router, "POST", "/v1/db/schema-version", None).await).await;
        assert_eq!(status.pointer("/data/backend").and_then(Value::as_str), Some("sqlite"));
        assert_eq!(status.pointer("/data/ledger_schema_version").and_then(Value::as_u64), Some(2));

        let migrated = send(
            &router,
            "POST",
            "/v1/db/migrate",
            Some(serde_json::json!({ "dry_run": false })),
        )
        .await;
        assert_eq!(migrated.status(), StatusCode::OK);
        let migrated = response_json(migrated).await;
        assert_eq!(
            migrated
                .pointer("/data/after/pending_versions")
                .and_then(Value::as_array)
                .map(Vec::len),
            Some(0)
        );
    }
}
