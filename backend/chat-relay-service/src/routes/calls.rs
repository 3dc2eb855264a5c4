use crate::error::AppError;
use crate::models::{CallRecord, CallStatus};
use crate::state::AppState;
use actix_web::{get, web, HttpResponse};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    #[serde(flatten)]
    pub call: CallRecord,
    /// Status as seen by this process, which wins over the stored one when
    /// a status write failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_status: Option<CallStatus>,
}

/// Persisted call log entry.
#[get("/calls/{call_id}")]
pub async fn get_call(
    state: web::Data<AppState>,
    call_id: web::Path<i64>,
) -> Result<HttpResponse, AppError> {
    let call_id = call_id.into_inner();
    let call = state
        .store
        .find_call(call_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let live_status = state
        .relay
        .calls()
        .status(call_id)
        .await
        .filter(|live| *live != call.status);

    Ok(HttpResponse::Ok().json(CallResponse { call, live_status }))
}
