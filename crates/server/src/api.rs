//! HTTP surface. Thin handlers: decode, derive an idempotency key, call the
//! workflow or intake service, map errors to statuses. Approval callbacks
//! are HMAC verified against the raw body before anything is decoded.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use apflow_core::audit::{ActorType, AuditEvent};
use apflow_core::correlation::Detection;
use apflow_core::domain::item::{ApItem, ApItemId, OrganizationId};
use apflow_core::domain::policy::{PolicyConfig, PolicyDocument};
use apflow_core::errors::{ApplicationError, InterfaceError};
use apflow_core::lifecycle::ActionContext;
use apflow_core::signing;

use crate::intake::{BatchSummary, IntakeOutcome, IntakeService};
use crate::workflow::{SplitRequest, ValidationContext, WorkflowService, WorklistEntry};

pub const SIGNATURE_HEADER: &str = "x-apflow-signature";

#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<WorkflowService>,
    pub intake: Arc<IntakeService>,
    pub webhook_secret: SecretString,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/detections", post(submit_detection))
        .route("/api/v1/detections/batch", post(submit_detection_batch))
        .route("/api/v1/worklist", get(worklist))
        .route("/api/v1/items/{id}", get(get_item))
        .route("/api/v1/items/{id}/audit-events", get(item_audit_events))
        .route("/api/v1/items/{id}/validate", post(validate_item))
        .route("/api/v1/items/{id}/approve", post(approve_item))
        .route("/api/v1/items/{id}/reject", post(reject_item))
        .route("/api/v1/items/{id}/post", post(post_item))
        .route("/api/v1/items/{id}/retry-post", post(retry_post_item))
        .route("/api/v1/items/{id}/merge", post(merge_items))
        .route("/api/v1/items/{id}/split", post(split_item))
        .route("/api/v1/approvals/callback", post(approval_callback))
        .route("/api/v1/policies/{policy_name}", get(get_policy).put(put_policy))
        .route("/api/v1/audit-events", get(organization_audit_events).post(append_audit_event))
        .with_state(state)
}

pub async fn serve(
    bind_address: &str,
    port: u16,
    state: AppState,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.api.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "api listener started"
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

pub struct ApiError(InterfaceError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn correlation_id(&self) -> &str {
        match &self.0 {
            InterfaceError::BadRequest { correlation_id, .. }
            | InterfaceError::Unauthorized { correlation_id, .. }
            | InterfaceError::NotFound { correlation_id, .. }
            | InterfaceError::Conflict { correlation_id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id, .. }
            | InterfaceError::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.0.to_string(),
            "message": self.0.user_message(),
            "correlation_id": self.correlation_id(),
        });
        (self.status(), Json(body)).into_response()
    }
}

fn interface(error: ApplicationError, correlation_id: &str) -> ApiError {
    ApiError(error.into_interface(correlation_id))
}

fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Deserialize)]
struct DetectionRequest {
    organization_id: String,
    #[serde(flatten)]
    detection: Detection,
}

#[derive(Debug, Deserialize)]
struct DetectionBatchRequest {
    organization_id: String,
    detections: Vec<Detection>,
}

#[derive(Debug, Serialize)]
struct DetectionResponse {
    outcome: &'static str,
    ap_item_id: String,
    state: Option<&'static str>,
    merge_reason: Option<&'static str>,
    flagged_against: Option<String>,
}

async fn submit_detection(
    State(state): State<AppState>,
    Json(request): Json<DetectionRequest>,
) -> Result<(StatusCode, Json<DetectionResponse>), ApiError> {
    let correlation_id = new_correlation_id();
    let organization_id = OrganizationId(request.organization_id);

    let outcome = state
        .intake
        .process_detection(&organization_id, request.detection)
        .await
        .map_err(|error| interface(error, &correlation_id))?;

    let (status, response) = match outcome {
        IntakeOutcome::Created { item, .. } => (
            StatusCode::CREATED,
            DetectionResponse {
                outcome: "created",
                ap_item_id: item.id.0,
                state: Some(item.state.as_str()),
                merge_reason: None,
                flagged_against: None,
            },
        ),
        IntakeOutcome::Merged { item_id, reason, .. } => (
            StatusCode::OK,
            DetectionResponse {
                outcome: "merged",
                ap_item_id: item_id.0,
                state: None,
                merge_reason: Some(reason.as_str()),
                flagged_against: None,
            },
        ),
        IntakeOutcome::Conflict { item, flagged_against } => (
            StatusCode::CREATED,
            DetectionResponse {
                outcome: "conflict",
                ap_item_id: item.id.0,
                state: Some(item.state.as_str()),
                merge_reason: None,
                flagged_against: Some(flagged_against.0),
            },
        ),
    };
    Ok((status, Json(response)))
}

async fn submit_detection_batch(
    State(state): State<AppState>,
    Json(request): Json<DetectionBatchRequest>,
) -> Json<BatchSummary> {
    let organization_id = OrganizationId(request.organization_id);
    Json(state.intake.process_batch(&organization_id, request.detections).await)
}

#[derive(Debug, Deserialize)]
struct WorklistQuery {
    organization_id: String,
}

async fn worklist(
    State(state): State<AppState>,
    Query(query): Query<WorklistQuery>,
) -> Result<Json<Vec<WorklistEntry>>, ApiError> {
    let correlation_id = new_correlation_id();
    let entries = state
        .workflow
        .worklist(&OrganizationId(query.organization_id))
        .await
        .map_err(|error| interface(error, &correlation_id))?;
    Ok(Json(entries))
}

async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApItem>, ApiError> {
    let correlation_id = new_correlation_id();
    let item = state
        .workflow
        .load(&ApItemId(id))
        .await
        .map_err(|error| interface(error, &correlation_id))?;
    Ok(Json(item))
}

async fn item_audit_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<AuditEvent>>, ApiError> {
    let correlation_id = new_correlation_id();
    let events = state
        .workflow
        .audit_events(&ApItemId(id))
        .await
        .map_err(|error| interface(error, &correlation_id))?;
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
struct ValidateBody {
    #[serde(default)]
    actor_id: Option<String>,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(flatten)]
    context: ValidationContext,
}

async fn validate_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ValidateBody>,
) -> Result<Json<ApItem>, ApiError> {
    let correlation_id = new_correlation_id();
    let id = ApItemId(id);
    let actor_id = body.actor_id.unwrap_or_else(|| "system".to_string());
    let key = body
        .idempotency_key
        .unwrap_or_else(|| format!("validated:{}:{}", id.0, actor_id));

    let outcome = state
        .workflow
        .validate(&id, body.context, ActionContext::new(ActorType::Human, actor_id, key))
        .await
        .map_err(|error| interface(error, &correlation_id))?;
    Ok(Json(outcome.item))
}

#[derive(Debug, Deserialize)]
struct ApproveBody {
    actor_id: String,
    #[serde(default)]
    justification: Option<String>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

async fn approve_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<ApItem>, ApiError> {
    let correlation_id = new_correlation_id();
    let id = ApItemId(id);
    let key = body
        .idempotency_key
        .unwrap_or_else(|| format!("approve:{}:{}", id.0, body.actor_id));

    let item = state
        .workflow
        .approve(
            &id,
            body.justification,
            ActionContext::new(ActorType::Human, body.actor_id, key),
        )
        .await
        .map_err(|error| interface(error, &correlation_id))?;
    Ok(Json(item))
}

#[derive(Debug, Deserialize)]
struct RejectBody {
    actor_id: String,
    reason: String,
    #[serde(default)]
    idempotency_key: Option<String>,
}

async fn reject_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> Result<Json<ApItem>, ApiError> {
    let correlation_id = new_correlation_id();
    let id = ApItemId(id);
    let key = body
        .idempotency_key
        .unwrap_or_else(|| format!("reject:{}:{}", id.0, body.actor_id));

    let item = state
        .workflow
        .reject(
            &id,
            &body.reason,
            ActionContext::new(ActorType::Human, body.actor_id, key),
        )
        .await
        .map_err(|error| interface(error, &correlation_id))?;
    Ok(Json(item))
}

#[derive(Debug, Default, Deserialize)]
struct PostBody {
    #[serde(default)]
    actor_id: Option<String>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

async fn post_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PostBody>,
) -> Result<Json<ApItem>, ApiError> {
    let correlation_id = new_correlation_id();
    let id = ApItemId(id);
    let actor_id = body.actor_id.unwrap_or_else(|| "system".to_string());
    // One logical posting per item; retries change the key via the explicit
    // retry endpoint first.
    let key = body.idempotency_key.unwrap_or_else(|| format!("post:{}", id.0));

    let item = state
        .workflow
        .attempt_post(&id, ActionContext::new(ActorType::Human, actor_id, key))
        .await
        .map_err(|error| interface(error, &correlation_id))?;
    Ok(Json(item))
}

#[derive(Debug, Deserialize)]
struct RetryBody {
    actor_id: String,
    #[serde(default)]
    idempotency_key: Option<String>,
}

async fn retry_post_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RetryBody>,
) -> Result<Json<ApItem>, ApiError> {
    let correlation_id = new_correlation_id();
    let id = ApItemId(id);
    let key = body
        .idempotency_key
        .unwrap_or_else(|| format!("retry:{}:{}", id.0, body.actor_id));

    let item = state
        .workflow
        .retry_post(&id, ActionContext::new(ActorType::Human, body.actor_id, key))
        .await
        .map_err(|error| interface(error, &correlation_id))?;
    Ok(Json(item))
}

#[derive(Debug, Deserialize)]
struct MergeBody {
    source_item_id: String,
    actor_id: String,
    #[serde(default)]
    idempotency_key: Option<String>,
}

async fn merge_items(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MergeBody>,
) -> Result<Json<ApItem>, ApiError> {
    let correlation_id = new_correlation_id();
    let target = ApItemId(id);
    let source = ApItemId(body.source_item_id);
    let key = body
        .idempotency_key
        .unwrap_or_else(|| format!("merge:{}:{}", target.0, source.0));

    let item = state
        .workflow
        .merge(&target, &source, ActionContext::new(ActorType::Human, body.actor_id, key))
        .await
        .map_err(|error| interface(error, &correlation_id))?;
    Ok(Json(item))
}

#[derive(Debug, Deserialize)]
struct SplitBody {
    actor_id: String,
    amount: Decimal,
    #[serde(default)]
    invoice_number: Option<String>,
    #[serde(default)]
    source_ids: Vec<String>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

async fn split_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SplitBody>,
) -> Result<(StatusCode, Json<ApItem>), ApiError> {
    let correlation_id = new_correlation_id();
    let id = ApItemId(id);
    let key = body
        .idempotency_key
        .unwrap_or_else(|| format!("split:{}:{}", id.0, body.amount));

    let new_item = state
        .workflow
        .split(
            &id,
            SplitRequest {
                amount: body.amount,
                invoice_number: body.invoice_number,
                source_ids: body.source_ids,
            },
            ActionContext::new(ActorType::Human, body.actor_id, key),
        )
        .await
        .map_err(|error| interface(error, &correlation_id))?;
    Ok((StatusCode::CREATED, Json(new_item)))
}

#[derive(Debug, Deserialize)]
struct CallbackPayload {
    token: String,
    ap_item_id: String,
    actor_id: String,
    decision: String,
    #[serde(default)]
    justification: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Approval decisions delivered by the external approval channel. The HMAC
/// covers the raw body; verification failures are answered 401 and leave an
/// audit trail on the targeted item.
async fn approval_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApItem>, ApiError> {
    let correlation_id = new_correlation_id();
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    if let Err(error) = signing::verify(&state.webhook_secret, &body, signature) {
        if let Ok(payload) = serde_json::from_slice::<CallbackPayload>(&body) {
            let _ = state
                .workflow
                .record_callback_rejection(
                    &ApItemId(payload.ap_item_id),
                    &payload.token,
                    &error.to_string(),
                )
                .await;
        }
        tracing::warn!(
            event_name = "api.callback.rejected",
            correlation_id = %correlation_id,
            error = %error,
            "approval callback failed signature verification"
        );
        return Err(ApiError(InterfaceError::Unauthorized {
            message: "invalid callback signature".to_string(),
            correlation_id,
        }));
    }

    let payload: CallbackPayload = serde_json::from_slice(&body).map_err(|error| {
        ApiError(InterfaceError::BadRequest {
            message: format!("malformed callback payload: {error}"),
            correlation_id: correlation_id.clone(),
        })
    })?;

    let id = ApItemId(payload.ap_item_id);
    let ctx = ActionContext::new(
        ActorType::Webhook,
        payload.actor_id,
        format!("callback:{}", payload.token),
    );

    let item = match payload.decision.as_str() {
        "approve" => state.workflow.approve(&id, payload.justification, ctx).await,
        "reject" => {
            let reason = payload.reason.unwrap_or_else(|| "rejected via callback".to_string());
            state.workflow.reject(&id, &reason, ctx).await
        }
        other => {
            return Err(ApiError(InterfaceError::BadRequest {
                message: format!("unsupported callback decision `{other}`"),
                correlation_id,
            }))
        }
    }
    .map_err(|error| interface(error, &correlation_id))?;

    Ok(Json(item))
}

#[derive(Debug, Deserialize)]
struct PolicyQuery {
    organization_id: String,
    #[serde(default)]
    include_versions: bool,
}

#[derive(Debug, Serialize)]
struct PolicyResponse {
    document: PolicyDocument,
    configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    versions: Option<Vec<PolicyDocument>>,
}

async fn get_policy(
    State(state): State<AppState>,
    Path(policy_name): Path<String>,
    Query(query): Query<PolicyQuery>,
) -> Result<Json<PolicyResponse>, ApiError> {
    let correlation_id = new_correlation_id();
    let organization_id = OrganizationId(query.organization_id);

    let effective = state
        .workflow
        .effective_policy(&organization_id, &policy_name)
        .await
        .map_err(|error| interface(error, &correlation_id))?;
    let configured = effective.is_configured();

    let versions = if query.include_versions {
        Some(
            state
                .workflow
                .policy_versions(&organization_id, &policy_name)
                .await
                .map_err(|error| interface(error, &correlation_id))?,
        )
    } else {
        None
    };

    Ok(Json(PolicyResponse { document: effective.into_document(), configured, versions }))
}

#[derive(Debug, Deserialize)]
struct PutPolicyBody {
    organization_id: String,
    updated_by: String,
    #[serde(default)]
    config: PolicyConfig,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn put_policy(
    State(state): State<AppState>,
    Path(policy_name): Path<String>,
    Json(body): Json<PutPolicyBody>,
) -> Result<(StatusCode, Json<PolicyDocument>), ApiError> {
    let correlation_id = new_correlation_id();
    let document = state
        .workflow
        .put_policy(
            &OrganizationId(body.organization_id),
            &policy_name,
            body.config,
            &body.updated_by,
            body.enabled,
        )
        .await
        .map_err(|error| interface(error, &correlation_id))?;
    Ok((StatusCode::CREATED, Json(document)))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    organization_id: String,
    #[serde(default = "default_audit_limit")]
    limit: u32,
}

fn default_audit_limit() -> u32 {
    100
}

async fn organization_audit_events(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEvent>>, ApiError> {
    let correlation_id = new_correlation_id();
    let events = state
        .workflow
        .organization_events(&OrganizationId(query.organization_id), query.limit)
        .await
        .map_err(|error| interface(error, &correlation_id))?;
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
struct AppendEventBody {
    ap_item_id: String,
    event_type: String,
    #[serde(default)]
    actor_type: Option<String>,
    actor_id: String,
    idempotency_key: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Compliance append. Redelivering the same idempotency key answers 200
/// with the original event instead of writing a second row.
async fn append_audit_event(
    State(state): State<AppState>,
    Json(body): Json<AppendEventBody>,
) -> Result<(StatusCode, Json<AuditEvent>), ApiError> {
    let correlation_id = new_correlation_id();
    let actor_type = body
        .actor_type
        .as_deref()
        .and_then(ActorType::parse)
        .unwrap_or(ActorType::System);

    let (event, fresh) = state
        .workflow
        .record_external_event(
            &ApItemId(body.ap_item_id),
            &body.event_type,
            actor_type,
            &body.actor_id,
            &body.idempotency_key,
            body.payload,
        )
        .await
        .map_err(|error| interface(error, &correlation_id))?;

    let status = if fresh { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(event)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use apflow_core::correlation::CorrelationConfig;
    use apflow_core::domain::item::{
        ApItem, ApItemId, ApState, ItemMetadata, OrganizationId,
    };
    use apflow_core::signing;
    use apflow_db::{
        InMemoryAuditLedger, InMemoryItemRepository, InMemoryPolicyRepository,
        InMemorySourceRepository, ItemRepository,
    };

    use crate::erp::fakes::SequencedErpPoster;
    use crate::intake::IntakeService;
    use crate::notify::fakes::RecordingNotifier;
    use crate::workflow::WorkflowService;

    use super::{router, AppState, SIGNATURE_HEADER};

    const WEBHOOK_SECRET: &str = "wh-test-secret";

    struct Harness {
        app: Router,
        items: Arc<InMemoryItemRepository>,
    }

    fn harness(erp: SequencedErpPoster) -> Harness {
        let items = Arc::new(InMemoryItemRepository::default());
        let sources = Arc::new(InMemorySourceRepository::default());
        let ledger = Arc::new(InMemoryAuditLedger::default());
        let policies = Arc::new(InMemoryPolicyRepository::default());
        let workflow = Arc::new(WorkflowService::new(
            items.clone(),
            sources.clone(),
            ledger.clone(),
            policies,
            Arc::new(erp),
            Arc::new(RecordingNotifier::default()),
            0.85,
            24 * 60,
        ));
        let intake = Arc::new(IntakeService::new(
            items.clone(),
            sources,
            ledger,
            workflow.clone(),
            CorrelationConfig::default(),
            4,
        ));
        let state = AppState {
            workflow,
            intake,
            webhook_secret: SecretString::from(WEBHOOK_SECRET.to_string()),
        };
        Harness { app: router(state), items }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.expect("request");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().method("GET").uri(uri).body(Body::empty()).expect("request")
    }

    fn detection_body(invoice_number: &str, amount: &str, confidence: f64) -> Value {
        json!({
            "organization_id": "org-1",
            "vendor_name": "Initech Supplies",
            "amount": amount,
            "currency": "USD",
            "invoice_number": invoice_number,
            "due_date": null,
            "confidence": confidence,
            "attachment_hashes": [],
            "source": {
                "source_type": "gmail_thread",
                "source_ref": format!("thread-{invoice_number}"),
                "subject": "Invoice",
                "sender": "billing@initech.test"
            }
        })
    }

    fn seeded_item(id: &str, state: ApState) -> ApItem {
        let now = Utc::now();
        ApItem {
            id: ApItemId(id.to_string()),
            organization_id: OrganizationId("org-1".to_string()),
            invoice_key: String::new(),
            vendor_name: "Initech Supplies".to_string(),
            amount: Decimal::new(500_00, 2),
            currency: "USD".to_string(),
            invoice_number: Some("INV-SEED".to_string()),
            due_date: None,
            confidence: 0.9,
            state,
            approval_required: false,
            post_attempted_at: None,
            erp_reference: None,
            metadata: ItemMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn approval_path_leaves_exactly_four_audit_events() {
        let h = harness(SequencedErpPoster::new(0, "ERP-2026-100"));

        // Low extraction confidence forces the manual approval route.
        let (status, created) =
            send(&h.app, post_json("/api/v1/detections", detection_body("INV-9", "750.00", 0.60)))
                .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["outcome"], "created");
        assert_eq!(created["state"], "needs_approval");
        let item_id = created["ap_item_id"].as_str().expect("item id").to_string();

        let (status, approved) = send(
            &h.app,
            post_json(
                &format!("/api/v1/items/{item_id}/approve"),
                json!({
                    "actor_id": "ap.manager",
                    "justification": "amount verified against signed order"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(approved["state"], "ready_to_post");

        let (status, posted) =
            send(&h.app, post_json(&format!("/api/v1/items/{item_id}/post"), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(posted["state"], "closed");
        assert_eq!(posted["erp_reference"], "ERP-2026-100");

        let (status, events) =
            send(&h.app, get(&format!("/api/v1/items/{item_id}/audit-events"))).await;
        assert_eq!(status, StatusCode::OK);
        let types: Vec<&str> = events
            .as_array()
            .expect("events array")
            .iter()
            .map(|event| event["event_type"].as_str().expect("type"))
            .collect();
        assert_eq!(types, vec!["created", "validated", "approved", "posted"]);
    }

    #[tokio::test]
    async fn replayed_post_request_returns_same_reference() {
        let h = harness(SequencedErpPoster::new(0, "ERP-2026-200"));
        h.items.insert(&seeded_item("item-1", ApState::ReadyToPost)).await.expect("seed");

        let (first_status, first) =
            send(&h.app, post_json("/api/v1/items/item-1/post", json!({}))).await;
        let (second_status, second) =
            send(&h.app, post_json("/api/v1/items/item-1/post", json!({}))).await;

        assert_eq!(first_status, StatusCode::OK);
        assert_eq!(second_status, StatusCode::OK);
        assert_eq!(first["erp_reference"], "ERP-2026-200");
        assert_eq!(second["erp_reference"], "ERP-2026-200");
    }

    #[tokio::test]
    async fn reject_while_posting_in_flight_is_a_conflict() {
        let h = harness(SequencedErpPoster::new(0, "ERP-1"));
        let mut claimed = seeded_item("item-1", ApState::Posting);
        claimed.post_attempted_at = Some(Utc::now());
        h.items.insert(&claimed).await.expect("seed");

        let (status, body) = send(
            &h.app,
            post_json(
                "/api/v1/items/item-1/reject",
                json!({"actor_id": "ap.clerk", "reason": "duplicate"}),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().expect("error").contains("conflict_post_started"));
    }

    #[tokio::test]
    async fn unknown_item_maps_to_not_found() {
        let h = harness(SequencedErpPoster::new(0, "ERP-1"));

        let (status, body) = send(&h.app, get("/api/v1/items/missing-item")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "The requested resource does not exist.");
    }

    #[tokio::test]
    async fn erp_outage_maps_to_service_unavailable() {
        let h = harness(SequencedErpPoster::new(5, "ERP-1"));
        h.items.insert(&seeded_item("item-1", ApState::ReadyToPost)).await.expect("seed");

        let (status, _) =
            send(&h.app, post_json("/api/v1/items/item-1/post", json!({}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (_, item) = send(&h.app, get("/api/v1/items/item-1")).await;
        assert_eq!(item["state"], "failed_post");
    }

    #[tokio::test]
    async fn signed_callback_approves_and_forged_callback_is_refused() {
        let h = harness(SequencedErpPoster::new(0, "ERP-1"));
        let mut pending = seeded_item("item-1", ApState::NeedsApproval);
        pending.approval_required = true;
        h.items.insert(&pending).await.expect("seed");

        let payload = json!({
            "token": "cb-123",
            "ap_item_id": "item-1",
            "actor_id": "ap.manager",
            "decision": "approve",
            "justification": "reviewed in the approval channel"
        })
        .to_string();
        let secret = SecretString::from(WEBHOOK_SECRET.to_string());
        let signature = signing::sign(&secret, payload.as_bytes());

        let signed = Request::builder()
            .method("POST")
            .uri("/api/v1/approvals/callback")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(payload.clone()))
            .expect("request");
        let (status, item) = send(&h.app, signed).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(item["state"], "ready_to_post");

        let forged = Request::builder()
            .method("POST")
            .uri("/api/v1/approvals/callback")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, "deadbeef")
            .body(Body::from(payload))
            .expect("request");
        let (status, body) = send(&h.app, forged).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "The request could not be authenticated.");

        let (_, events) = send(&h.app, get("/api/v1/items/item-1/audit-events")).await;
        let types: Vec<&str> = events
            .as_array()
            .expect("events")
            .iter()
            .map(|event| event["event_type"].as_str().expect("type"))
            .collect();
        assert!(types.contains(&"approval_callback_rejected"));
    }

    #[tokio::test]
    async fn policy_put_bumps_version_and_get_reads_it_back() {
        let h = harness(SequencedErpPoster::new(0, "ERP-1"));

        let (status, stored) = send(
            &h.app,
            Request::builder()
                .method("PUT")
                .uri("/api/v1/policies/ap_approval")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "organization_id": "org-1",
                        "updated_by": "controller",
                        "config": {
                            "auto_approval_threshold": 0.9,
                            "rules": [{
                                "type": "amount_threshold",
                                "policy_id": "amount-10k",
                                "threshold": "10000",
                                "action": "require_approval",
                                "required_approvers": ["finance_manager"]
                            }]
                        }
                    })
                    .to_string(),
                ))
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(stored["version"], 1);

        let (status, fetched) = send(
            &h.app,
            get("/api/v1/policies/ap_approval?organization_id=org-1&include_versions=true"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["configured"], true);
        assert_eq!(fetched["document"]["version"], 1);
        assert_eq!(fetched["versions"].as_array().expect("versions").len(), 1);
    }

    #[tokio::test]
    async fn worklist_decorates_open_items() {
        let h = harness(SequencedErpPoster::new(0, "ERP-1"));
        send(&h.app, post_json("/api/v1/detections", detection_body("INV-7", "120.00", 0.55)))
            .await;

        let (status, entries) =
            send(&h.app, get("/api/v1/worklist?organization_id=org-1")).await;

        assert_eq!(status, StatusCode::OK);
        let entries = entries.as_array().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["item"]["state"], "needs_approval");
        assert_eq!(entries[0]["source_count"], 1);
        assert_eq!(entries[0]["sla_breached"], false);
    }

    #[tokio::test]
    async fn replayed_audit_append_keeps_a_single_row() {
        let h = harness(SequencedErpPoster::new(0, "ERP-1"));
        h.items.insert(&seeded_item("item-1", ApState::NeedsApproval)).await.expect("seed");

        let body = json!({
            "ap_item_id": "item-1",
            "event_type": "context_conflict",
            "actor_type": "human",
            "actor_id": "ap.clerk",
            "idempotency_key": "manual-flag-77",
            "payload": {"note": "vendor disputed the amount"}
        });

        let (first_status, first) =
            send(&h.app, post_json("/api/v1/audit-events", body.clone())).await;
        let (second_status, second) =
            send(&h.app, post_json("/api/v1/audit-events", body)).await;

        assert_eq!(first_status, StatusCode::CREATED);
        assert_eq!(second_status, StatusCode::OK);
        assert_eq!(first["id"], second["id"]);

        let (_, events) = send(&h.app, get("/api/v1/items/item-1/audit-events")).await;
        let flagged: Vec<&Value> = events
            .as_array()
            .expect("events")
            .iter()
            .filter(|event| event["event_type"] == "context_conflict")
            .collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0]["actor_type"], "human");
    }
}
