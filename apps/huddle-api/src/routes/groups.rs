//! Group admin endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{ApiError, ApiErrorBody};
use crate::models::group::{GroupId, GroupRecord, GroupState, MemberId};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/groups", post(create_group))
        .route("/groups/{group_id}", get(get_group).patch(update_group))
        .route(
            "/groups/{group_id}/members/{member_id}",
            delete(remove_member),
        )
}

// ---------------------------------------------------------------------------
// POST /api/v1/groups
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CreateGroupRequest {
    /// Upper bound on simultaneously active members. Unbounded if absent.
    pub max_active_members: Option<u32>,
}

#[utoipa::path(
    post,
    path = "/api/v1/groups",
    tag = "Groups",
    request_body = CreateGroupRequest,
    responses(
        (status = 201, description = "Group created", body = GroupRecord),
        (status = 400, description = "Validation error", body = ApiErrorBody),
    ),
)]
pub async fn create_group(
    State(state): State<AppState>,
    Json(body): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<GroupRecord>), ApiError> {
    let record = state.store.create_group(body.max_active_members).await?;
    tracing::info!(group_id = %record.id, max = ?record.max_active_members, "group created");
    Ok((StatusCode::CREATED, Json(record)))
}

// ---------------------------------------------------------------------------
// GET /api/v1/groups/{group_id}
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct GroupResponse {
    #[serde(flatten)]
    pub group: GroupRecord,
    /// Members with a live channel right now, as seen by the dispatcher.
    #[schema(value_type = Vec<u64>)]
    pub connected_members: Vec<MemberId>,
}

#[utoipa::path(
    get,
    path = "/api/v1/groups/{group_id}",
    tag = "Groups",
    params(("group_id" = u64, Path, description = "Group ID")),
    responses(
        (status = 200, description = "Group with live membership", body = GroupResponse),
        (status = 404, description = "Group not found", body = ApiErrorBody),
    ),
)]
pub async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
) -> Result<Json<GroupResponse>, ApiError> {
    let group = state
        .store
        .find_group(group_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Group {group_id} not found")))?;

    let connected_members = match state.groups.get(group_id) {
        // A dispatcher that stops mid-query has no members left.
        Some(dispatcher) => dispatcher.members().await.unwrap_or_default(),
        None => Vec::new(),
    };

    Ok(Json(GroupResponse {
        group,
        connected_members,
    }))
}

// ---------------------------------------------------------------------------
// PATCH /api/v1/groups/{group_id}
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateGroupRequest {
    pub state: GroupState,
}

#[utoipa::path(
    patch,
    path = "/api/v1/groups/{group_id}",
    tag = "Groups",
    params(("group_id" = u64, Path, description = "Group ID")),
    request_body = UpdateGroupRequest,
    responses(
        (status = 200, description = "Group updated", body = GroupRecord),
        (status = 404, description = "Group not found", body = ApiErrorBody),
        (status = 409, description = "Group already finished", body = ApiErrorBody),
    ),
)]
pub async fn update_group(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    Json(body): Json<UpdateGroupRequest>,
) -> Result<Json<GroupRecord>, ApiError> {
    let record = state.store.set_state(group_id, body.state).await?;
    tracing::info!(%group_id, state = %record.state, "group state changed");
    Ok(Json(record))
}

// ---------------------------------------------------------------------------
// DELETE /api/v1/groups/{group_id}/members/{member_id}
// ---------------------------------------------------------------------------

#[utoipa::path(
    delete,
    path = "/api/v1/groups/{group_id}/members/{member_id}",
    tag = "Groups",
    params(
        ("group_id" = u64, Path, description = "Group ID"),
        ("member_id" = u64, Path, description = "Member ID"),
    ),
    responses(
        (status = 204, description = "Member's channel closed and dropout recorded"),
        (status = 404, description = "Member not connected", body = ApiErrorBody),
    ),
)]
pub async fn remove_member(
    State(state): State<AppState>,
    Path((group_id, member_id)): Path<(GroupId, MemberId)>,
) -> Result<StatusCode, ApiError> {
    let not_connected =
        || ApiError::not_found(format!("Member {member_id} isn't connected to group {group_id}"));

    let dispatcher = state.groups.get(group_id).ok_or_else(not_connected)?;
    let removed = match dispatcher.forced_close(member_id).await {
        Ok(removed) => removed,
        Err(err) => {
            tracing::debug!(%group_id, %member_id, %err, "dispatcher stopped during forced close");
            false
        }
    };
    if !removed {
        return Err(not_connected());
    }

    // The dispatcher doesn't persist forced closes; record the drop here.
    state.store.persist_dropout(group_id, member_id).await?;
    tracing::info!(%group_id, %member_id, "member removed from group");

    Ok(StatusCode::NO_CONTENT)
}
