use actix_web::{web, App, HttpServer};
use chat_relay_service::{
    config, db, error, logging, routes,
    services::{Relay, RelaySettings},
    state::AppState,
    store::{ChatStore, InMemoryChatStore, PgChatStore},
};
use std::sync::Arc;
use tracing_actix_web::TracingLogger;

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let store: Arc<dyn ChatStore> = match &cfg.database {
        Some(db_cfg) => {
            let pool = db::init_pool(db_cfg)
                .await
                .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;
            Arc::new(PgChatStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory store, nothing survives a restart");
            Arc::new(InMemoryChatStore::new())
        }
    };

    let relay = Relay::new(store, RelaySettings::from(cfg.as_ref()));
    let state = AppState::new(relay, cfg.clone());

    let bind_addr = cfg.bind_addr();
    tracing::info!(
        %bind_addr,
        ring_timeout_secs = cfg.call_ring_timeout.as_secs(),
        "starting chat-relay-service"
    );

    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(TracingLogger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind: {e}")))?
    .run()
    .await
    .map_err(|e| error::AppError::StartServer(format!("server: {e}")))
}
