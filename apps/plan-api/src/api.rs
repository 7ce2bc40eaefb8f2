/// REST endpoints for onboarding, team management and plan dashboards
///
/// The caller is identified by the `x-user-id` header. Authentication itself
/// happens in front of this service.
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use collaboration::{
    Collaboration, CollaborationError, Command, CommandOutcome, DashboardStats, DenyReason,
    ErrorKind, InvitationLink, PlanContext, Workspace,
};
use plan::{CommentThread, Invitation, ItemId, PlanId, TeamMember, UserId};
use serde_json::json;
use store::SessionCounts;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;
use uuid::Uuid;

use crate::models::*;

pub const USER_HEADER: &str = "x-user-id";

/// API error type
#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    BadRequest(String),
    Collab(CollaborationError),
    Internal(String),
}

impl From<CollaborationError> for ApiError {
    fn from(e: CollaborationError) -> Self {
        ApiError::Collab(e)
    }
}

fn deny_status(reason: DenyReason) -> StatusCode {
    match reason {
        DenyReason::NotAMember | DenyReason::NotAdmin | DenyReason::NotPermitted => {
            StatusCode::FORBIDDEN
        }
        DenyReason::InvitationInvalid => StatusCode::GONE,
        DenyReason::ItemLocked
        | DenyReason::NotLockHolder
        | DenyReason::NotDraft
        | DenyReason::VotingInProgress
        | DenyReason::SessionCompleted
        | DenyReason::InFlight => StatusCode::CONFLICT,
        DenyReason::EmptyContent
        | DenyReason::DependenciesUnmet
        | DenyReason::ReplyDepth
        | DenyReason::InvalidInput => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                format!("Missing {USER_HEADER} header"),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Collab(e) => {
                let status = match e.kind() {
                    ErrorKind::Denied => e
                        .deny_reason()
                        .map(deny_status)
                        .unwrap_or(StatusCode::BAD_REQUEST),
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::TransientFailure => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorKind::Fatal => {
                        error!("Request failed: {}", e);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let message = e
                    .deny_reason()
                    .map(|r| r.message().to_string())
                    .unwrap_or_else(|| e.to_string());
                (status, e.code(), message)
            }
            ApiError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
            }
        };

        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

/// The acting user, taken from the identity header.
pub struct Caller(pub UserId);

impl Caller {
    fn on(&self, plan_id: PlanId) -> PlanContext {
        PlanContext::new(plan_id, self.0)
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_HEADER)
            .ok_or(ApiError::Unauthenticated)?;
        raw.to_str()
            .ok()
            .and_then(|s| s.trim().parse::<Uuid>().ok())
            .map(|id| Caller(UserId(id)))
            .ok_or_else(|| ApiError::BadRequest(format!("{USER_HEADER} must be a UUID")))
    }
}

/// Runs a store-backed call off the async workers.
async fn blocking<T, F>(collab: Collaboration, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Collaboration) -> collaboration::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&collab))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}

pub fn router(collab: Collaboration) -> Router {
    Router::new()
        .route("/api/health", get(|| async { "ok" }))
        .route("/api/onboarding", post(onboard))
        .route("/api/plans/:plan_id/dashboard", get(dashboard))
        .route("/api/plans/:plan_id/sessions", get(sessions))
        .route("/api/plans/:plan_id/team", get(team))
        .route(
            "/api/plans/:plan_id/invitations",
            get(list_invitations).post(create_invitation),
        )
        .route(
            "/api/plans/:plan_id/items/:item_id/comments",
            get(comment_threads),
        )
        .route(
            "/api/plans/:plan_id/items/:item_id/force-unlock",
            post(force_unlock),
        )
        .route("/api/invitations/:token/accept", post(accept_invitation))
        // CORS for local development
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(collab)
}

/// POST /api/onboarding - Create company, plan and default sections
pub async fn onboard(
    State(collab): State<Collaboration>,
    caller: Caller,
    Json(req): Json<OnboardRequest>,
) -> Result<(StatusCode, Json<Workspace>), ApiError> {
    if req.plan_name.trim().is_empty() {
        return Err(ApiError::BadRequest("Plan name is required".to_string()));
    }
    let user = caller.0;
    let workspace = blocking(collab, move |c| {
        c.team
            .onboard(user, req.company_name.as_deref(), &req.plan_name)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(workspace)))
}

/// GET /api/plans/:plan_id/dashboard - Recompute and return progress
pub async fn dashboard(
    State(collab): State<Collaboration>,
    caller: Caller,
    Path(plan_id): Path<PlanId>,
) -> Result<Json<DashboardStats>, ApiError> {
    let ctx = caller.on(plan_id);
    blocking(collab, move |c| {
        c.team.membership(&ctx)?;
        c.progress.recompute(plan_id)
    })
    .await
    .map(Json)
}

/// GET /api/plans/:plan_id/sessions - Voting sessions with ballot counts
pub async fn sessions(
    State(collab): State<Collaboration>,
    caller: Caller,
    Path(plan_id): Path<PlanId>,
) -> Result<Json<Vec<SessionCounts>>, ApiError> {
    let ctx = caller.on(plan_id);
    blocking(collab, move |c| c.voting.sessions_with_counts(&ctx))
        .await
        .map(Json)
}

/// GET /api/plans/:plan_id/team - Team roster
pub async fn team(
    State(collab): State<Collaboration>,
    caller: Caller,
    Path(plan_id): Path<PlanId>,
) -> Result<Json<Vec<TeamMember>>, ApiError> {
    let ctx = caller.on(plan_id);
    blocking(collab, move |c| c.team.roster(&ctx)).await.map(Json)
}

pub async fn list_invitations(
    State(collab): State<Collaboration>,
    caller: Caller,
    Path(plan_id): Path<PlanId>,
) -> Result<Json<Vec<Invitation>>, ApiError> {
    let ctx = caller.on(plan_id);
    blocking(collab, move |c| c.team.list_invitations(&ctx))
        .await
        .map(Json)
}

/// POST /api/plans/:plan_id/invitations - Invite by email, returns the link
pub async fn create_invitation(
    State(collab): State<Collaboration>,
    caller: Caller,
    Path(plan_id): Path<PlanId>,
    Json(req): Json<InviteRequest>,
) -> Result<(StatusCode, Json<InvitationLink>), ApiError> {
    let ctx = caller.on(plan_id);
    let link = blocking(collab, move |c| c.team.invite(&ctx, &req.email)).await?;
    Ok((StatusCode::CREATED, Json(link)))
}

/// POST /api/invitations/:token/accept
pub async fn accept_invitation(
    State(collab): State<Collaboration>,
    caller: Caller,
    Path(token): Path<String>,
) -> Result<Json<TeamMember>, ApiError> {
    let user = caller.0;
    blocking(collab, move |c| c.team.accept_invitation(user, &token))
        .await
        .map(Json)
}

pub async fn comment_threads(
    State(collab): State<Collaboration>,
    caller: Caller,
    Path((plan_id, item_id)): Path<(PlanId, ItemId)>,
) -> Result<Json<Vec<CommentThread>>, ApiError> {
    let ctx = caller.on(plan_id);
    blocking(collab, move |c| c.editing.list_threads(&ctx, item_id))
        .await
        .map(Json)
}

/// POST /api/plans/:plan_id/items/:item_id/force-unlock - Admin lock override
pub async fn force_unlock(
    State(collab): State<Collaboration>,
    caller: Caller,
    Path((plan_id, item_id)): Path<(PlanId, ItemId)>,
) -> Result<Json<CommandOutcome>, ApiError> {
    let ctx = caller.on(plan_id);
    blocking(collab, move |c| {
        c.execute(&ctx, Command::ForceUnlock { item_id })
    })
    .await
    .map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use collaboration::{CollabConfig, ManualClock};
    use serde::de::DeserializeOwned;
    use std::sync::Arc;
    use store::SqliteStore;
    use tower::ServiceExt;

    fn app() -> Router {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let collab = Collaboration::new(
            store,
            Arc::new(ManualClock::default()),
            CollabConfig::default(),
            "https://plans.test",
        );
        router(collab)
    }

    fn request(method: &str, uri: &str, user: Option<UserId>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user.0.to_string());
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn parse<T: DeserializeOwned>(value: serde_json::Value) -> T {
        serde_json::from_value(value).unwrap()
    }

    async fn onboard_plan(app: &Router, owner: UserId) -> Workspace {
        let (status, body) = call(
            app,
            request(
                "POST",
                "/api/onboarding",
                Some(owner),
                json!({ "company_name": "Acme", "plan_name": "Bakery" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        parse(body)
    }

    #[tokio::test]
    async fn test_onboarding_then_dashboard() {
        let app = app();
        let owner = UserId::new();
        let workspace = onboard_plan(&app, owner).await;

        let uri = format!("/api/plans/{}/dashboard", workspace.plan.id);
        let (status, body) = call(&app, request("GET", &uri, Some(owner), json!(null))).await;
        assert_eq!(status, StatusCode::OK);
        let stats: DashboardStats = parse(body);
        assert_eq!(
            stats.total_sections,
            workspace.canvas_sections + workspace.detailed_sections
        );
        assert_eq!(stats.overall_progress, 0);
        assert_eq!(stats.active_members, 1);
    }

    #[tokio::test]
    async fn test_identity_header_required() {
        let app = app();
        let (status, body) = call(
            &app,
            request("POST", "/api/onboarding", None, json!({ "plan_name": "Bakery" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_outsider_is_forbidden() {
        let app = app();
        let workspace = onboard_plan(&app, UserId::new()).await;
        let uri = format!("/api/plans/{}/team", workspace.plan.id);
        let (status, body) = call(&app, request("GET", &uri, Some(UserId::new()), json!(null))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "not_a_member");
    }

    #[tokio::test]
    async fn test_invitation_accepted_once() {
        let app = app();
        let owner = UserId::new();
        let workspace = onboard_plan(&app, owner).await;
        let uri = format!("/api/plans/{}/invitations", workspace.plan.id);
        let (status, body) = call(
            &app,
            request("POST", &uri, Some(owner), json!({ "email": "sam@example.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let link: InvitationLink = parse(body);
        assert!(link.link.starts_with("https://plans.test"));

        let accept = format!("/api/invitations/{}/accept", link.invitation.token);
        let newcomer = UserId::new();
        let (status, _) = call(&app, request("POST", &accept, Some(newcomer), json!(null))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, request("POST", &accept, Some(UserId::new()), json!(null))).await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body["error"], "invitation_invalid");

        let team = format!("/api/plans/{}/team", workspace.plan.id);
        let (status, body) = call(&app, request("GET", &team, Some(newcomer), json!(null))).await;
        assert_eq!(status, StatusCode::OK);
        let roster: Vec<TeamMember> = parse(body);
        assert_eq!(roster.len(), 2);

        // Members cannot invite.
        let (status, _) = call(
            &app,
            request("POST", &uri, Some(newcomer), json!({ "email": "x@example.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_force_unlock_missing_item() {
        let app = app();
        let owner = UserId::new();
        let workspace = onboard_plan(&app, owner).await;
        let uri = format!(
            "/api/plans/{}/items/{}/force-unlock",
            workspace.plan.id,
            ItemId::new()
        );
        let (status, body) = call(&app, request("POST", &uri, Some(owner), json!(null))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }
}
