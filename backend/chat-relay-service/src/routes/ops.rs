use crate::state::AppState;
use actix_web::{get, web, HttpResponse, Responder};

#[get("/health")]
pub async fn health() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

/// Live connection, room and call counts.
#[get("/stats")]
pub async fn stats(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.relay.stats().await)
}
