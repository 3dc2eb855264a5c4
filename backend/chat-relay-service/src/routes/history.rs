use crate::error::AppError;
use crate::models::{ChatMessage, RoomSummary};
use crate::state::AppState;
use actix_web::{get, web, HttpResponse};
use serde::{Deserialize, Serialize};

const DEFAULT_PAGE_LIMIT: i64 = 50;

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub room_id: String,
    pub limit: i64,
    pub offset: i64,
    pub messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountResponse {
    pub email: String,
    pub unread_count: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRoomsResponse {
    pub email: String,
    pub rooms: Vec<RoomSummary>,
}

/// Clamp a requested page into `1..=max`; offsets never go negative.
fn page_bounds(query: &HistoryQuery, max: i64) -> Result<(i64, i64), AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    if limit <= 0 {
        return Err(AppError::BadRequest("limit must be positive".into()));
    }
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(AppError::BadRequest("offset must not be negative".into()));
    }
    Ok((limit.min(max), offset))
}

// ============================================================================
// Handlers
// ============================================================================

/// Room history, oldest first.
#[get("/rooms/{room_id}/messages")]
pub async fn get_room_messages(
    state: web::Data<AppState>,
    room_id: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let room_id = room_id.into_inner();
    let (limit, offset) = page_bounds(&query, state.config.history_page_limit_max)?;

    let messages = state.store.list_messages(&room_id, limit, offset).await?;

    Ok(HttpResponse::Ok().json(HistoryResponse {
        room_id,
        limit,
        offset,
        messages,
    }))
}

#[get("/users/{email}/unread-count")]
pub async fn get_unread_count(
    state: web::Data<AppState>,
    email: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let email = email.into_inner();
    let unread_count = state.store.unread_count(&email).await?;
    Ok(HttpResponse::Ok().json(UnreadCountResponse {
        email,
        unread_count,
    }))
}

/// Rooms the user takes part in, most recent activity first.
#[get("/users/{email}/rooms")]
pub async fn get_user_rooms(
    state: web::Data<AppState>,
    email: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let email = email.into_inner();
    let rooms = state.store.list_rooms_for(&email).await?;
    Ok(HttpResponse::Ok().json(UserRoomsResponse { email, rooms }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_defaults_and_clamps() {
        let query = HistoryQuery {
            limit: None,
            offset: None,
        };
        assert_eq!(page_bounds(&query, 200).unwrap(), (50, 0));

        let query = HistoryQuery {
            limit: Some(10_000),
            offset: Some(20),
        };
        assert_eq!(page_bounds(&query, 200).unwrap(), (200, 20));
    }

    #[test]
    fn page_rejects_nonsense() {
        let query = HistoryQuery {
            limit: Some(0),
            offset: None,
        };
        assert!(page_bounds(&query, 200).is_err());

        let query = HistoryQuery {
            limit: Some(5),
            offset: Some(-1),
        };
        assert!(page_bounds(&query, 200).is_err());
    }
}
