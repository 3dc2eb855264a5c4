use crate::config::WsConfig;
use crate::services::Relay;
use crate::state::AppState;
use crate::websocket::ConnectionId;
use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::Instant;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

// WebSocket Actor
//
// Inbound text frames go through a per-connection worker task so events
// from one connection are handled strictly in arrival order. Outbound
// frames arrive from the registry channel and are written as-is.
pub struct WsSession {
    connection_id: ConnectionId,
    relay: Relay,
    hb: Instant,
    ws: WsConfig,
    outbound: Option<UnboundedReceiver<String>>,
    inbound: Option<UnboundedSender<String>>,
}

impl WsSession {
    pub fn new(
        connection_id: ConnectionId,
        relay: Relay,
        outbound: UnboundedReceiver<String>,
        ws: WsConfig,
    ) -> Self {
        Self {
            connection_id,
            relay,
            hb: Instant::now(),
            ws,
            outbound: Some(outbound),
            inbound: None,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let timeout = self.ws.client_timeout;
        ctx.run_interval(self.ws.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.hb) > timeout {
                tracing::warn!(
                    connection_id = %act.connection_id,
                    "WebSocket heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn start_inbound_worker(&mut self) {
        let (tx, mut rx) = unbounded_channel::<String>();
        let relay = self.relay.clone();
        let connection_id = self.connection_id;

        actix::spawn(async move {
            while let Some(text) = rx.recv().await {
                relay.handle_text(connection_id, &text).await;
            }
            // Session is gone and every queued frame has been handled.
            relay.disconnect(connection_id).await;
        });

        self.inbound = Some(tx);
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(connection_id = %self.connection_id, "WebSocket session started");

        self.hb(ctx);
        self.start_inbound_worker();

        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(connection_id = %self.connection_id, "WebSocket session stopped");

        // Closing the inbound channel lets the worker finish and unregister.
        self.inbound.take();
    }
}

// Frames queued by the registry for this connection
impl StreamHandler<String> for WsSession {
    fn handle(&mut self, frame: String, ctx: &mut Self::Context) {
        ctx.text(frame);
    }
}

// Handle WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                let queued = self
                    .inbound
                    .as_ref()
                    .map(|tx| tx.send(text.to_string()).is_ok())
                    .unwrap_or(false);
                if !queued {
                    tracing::warn!(
                        connection_id = %self.connection_id,
                        "inbound worker gone, closing session"
                    );
                    ctx.stop();
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    "Binary WebSocket messages not supported"
                );
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::info!(
                    connection_id = %self.connection_id,
                    ?reason,
                    "WebSocket close message received"
                );
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(connection_id = %self.connection_id, error = %e, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

// HTTP handler
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let (connection_id, outbound) = state.relay.connect().await;
    let session = WsSession::new(
        connection_id,
        state.relay.clone(),
        outbound,
        state.config.ws.clone(),
    );

    match ws::start(session, &req, stream) {
        Ok(response) => Ok(response),
        Err(e) => {
            tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket handshake failed");
            state.relay.disconnect(connection_id).await;
            Err(e)
        }
    }
}
