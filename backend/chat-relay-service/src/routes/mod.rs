use actix_web::web;

pub mod calls;
pub mod history;
pub mod ops;
pub mod wsroute;

/// Every route the service exposes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(wsroute::ws_handler)
        .service(history::get_room_messages)
        .service(history::get_unread_count)
        .service(history::get_user_rooms)
        .service(calls::get_call)
        .service(ops::health)
        .service(ops::stats);
}
