pub mod groups;
pub mod health;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest("/api/v1", groups::router())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Groups
        groups::create_group,
        groups::get_group,
        groups::update_group,
        groups::remove_member,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            // Models
            crate::models::group::GroupRecord,
            crate::models::group::GroupState,
            crate::models::group::GroupId,
            crate::models::group::MemberId,
            // Route request/response types
            health::HealthResponse,
            groups::CreateGroupRequest,
            groups::GroupResponse,
            groups::UpdateGroupRequest,
        )
    ),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Groups", description = "Group lifecycle and membership"),
    )
)]
pub struct ApiDoc;
