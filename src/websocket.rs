//! # Job WebSocket Transport
//!
//! Clients connect to `/hunnoi/ws` to queue a job. Each connection is an
//! actix actor that owns the socket; the queue and job logic run in a
//! separate task and talk to the actor through [`WsChannel`], the WebSocket
//! implementation of [`ClientChannel`].
//!
//! ## Message Flow:
//! - **Server → Client**: `StatusEvent` JSON, delivered as `SendText` actor messages
//! - **Client → Server**: text/binary frames forwarded into an mpsc queue the
//!   dispatcher reads from
//! - **Close**: the dispatcher closes through a `CloseChannel` actor message;
//!   when the job task ends the socket is closed if it still is open
//!
//! Protocol-level pings keep idle queued clients alive; a client silent for
//! longer than [`CLIENT_TIMEOUT`] is dropped, which the dispatcher sees as a
//! disconnect.

use crate::dispatcher::Dispatcher;
use crate::protocol::{CloseCode, StatusEvent};
use crate::queue::{ChannelError, ChannelId, ClientChannel, Inbound};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// How often the server pings the client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Silence after which the client is considered gone.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Send a serialized status event to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// Close the socket with the given code and stop the actor.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseChannel(CloseCode);

/// The job task finished; close the socket if nobody did.
#[derive(Message)]
#[rtype(result = "()")]
struct SessionEnded;

/// WebSocket actor for one job connection.
pub struct JobWebSocket {
    id: ChannelId,
    dispatcher: Arc<Dispatcher>,
    /// Dropped when the actor stops, which ends the channel's `recv`
    inbound_tx: Option<mpsc::UnboundedSender<Inbound>>,
    inbound_rx: Option<mpsc::UnboundedReceiver<Inbound>>,
    last_heartbeat: Instant,
    closed: bool,
}

impl JobWebSocket {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id: ChannelId::new(),
            dispatcher,
            inbound_tx: Some(tx),
            inbound_rx: Some(rx),
            last_heartbeat: Instant::now(),
            closed: false,
        }
    }

    fn forward(&mut self, inbound: Inbound) {
        if let Some(tx) = &self.inbound_tx {
            // The job task may already be gone; late client messages are dropped.
            let _ = tx.send(inbound);
        }
    }

    fn close(&mut self, code: CloseCode, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.closed {
            self.closed = true;
            ctx.close(Some(close_reason(code)));
        }
        ctx.stop();
    }
}

fn close_reason(code: CloseCode) -> ws::CloseReason {
    ws::CloseCode::from(code.as_u16()).into()
}

/// Map a data frame to an inbound message; control frames map to `None`.
fn inbound_from(msg: &ws::Message) -> Option<Inbound> {
    match msg {
        ws::Message::Text(text) => Some(Inbound::Text(text.to_string())),
        ws::Message::Binary(data) => Some(Inbound::Binary(data.to_vec())),
        _ => None,
    }
}

impl Actor for JobWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(channel_id = %self.id, "Job connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(channel_id = %act.id, "WebSocket heartbeat timeout, closing connection");
                act.close(CloseCode::Away, ctx);
            } else {
                ctx.ping(b"");
            }
        });

        let Some(inbound) = self.inbound_rx.take() else {
            error!(channel_id = %self.id, "Job connection started twice");
            ctx.stop();
            return;
        };
        let addr = ctx.address();
        let channel: Arc<dyn ClientChannel> = Arc::new(WsChannel {
            id: self.id,
            addr: addr.clone(),
            inbound: Mutex::new(inbound),
        });
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.serve(channel).await;
            addr.do_send(SessionEnded);
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(channel_id = %self.id, "Job connection stopped");
        self.inbound_tx = None;
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for JobWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                error!(channel_id = %self.id, error = %err, "WebSocket protocol error");
                ctx.stop();
                return;
            }
        };

        self.last_heartbeat = Instant::now();
        if let Some(inbound) = inbound_from(&msg) {
            debug!(channel_id = %self.id, "Client message received");
            self.forward(inbound);
            return;
        }

        match msg {
            ws::Message::Ping(data) => ctx.pong(&data),
            ws::Message::Close(reason) => {
                info!(channel_id = %self.id, reason = ?reason, "Client closed the connection");
                self.closed = true;
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) => {
                warn!(channel_id = %self.id, "Received unexpected continuation frame");
            }
            _ => {}
        }
    }
}

impl Handler<SendText> for JobWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<CloseChannel> for JobWebSocket {
    type Result = ();

    fn handle(&mut self, msg: CloseChannel, ctx: &mut Self::Context) {
        debug!(channel_id = %self.id, code = msg.0.as_u16(), "Closing job connection");
        self.close(msg.0, ctx);
    }
}

impl Handler<SessionEnded> for JobWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: SessionEnded, ctx: &mut Self::Context) {
        self.close(CloseCode::Normal, ctx);
    }
}

/// [`ClientChannel`] over a [`JobWebSocket`] actor.
pub struct WsChannel {
    id: ChannelId,
    addr: Addr<JobWebSocket>,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

#[async_trait]
impl ClientChannel for WsChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn send(&self, event: StatusEvent) -> Result<(), ChannelError> {
        let json = serde_json::to_string(&event).map_err(|e| ChannelError::Encode(e.to_string()))?;
        self.addr.send(SendText(json)).await.map_err(|_| ChannelError::Closed)
    }

    async fn recv(&self) -> Option<Inbound> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self, code: CloseCode) -> Result<(), ChannelError> {
        self.addr.send(CloseChannel(code)).await.map_err(|_| ChannelError::Closed)
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the socket to a fresh [`JobWebSocket`];
/// queueing starts as soon as the actor is running.
pub async fn job_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(peer = ?req.connection_info().peer_addr(), "New job connection request");
    let websocket = JobWebSocket::new(app_state.dispatcher.clone());
    ws::start(websocket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::web::Bytes;

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(close_reason(CloseCode::Normal).code, ws::CloseCode::Normal);
        assert_eq!(close_reason(CloseCode::Away).code, ws::CloseCode::Away);
        assert_eq!(close_reason(CloseCode::Policy).code, ws::CloseCode::Policy);
    }

    #[test]
    fn test_only_data_frames_are_forwarded() {
        assert_eq!(
            inbound_from(&ws::Message::Text("https://youtu.be/abc".into())),
            Some(Inbound::Text("https://youtu.be/abc".to_string()))
        );
        assert_eq!(
            inbound_from(&ws::Message::Binary(Bytes::from_static(b"\x01\x02"))),
            Some(Inbound::Binary(vec![1, 2]))
        );
        assert_eq!(inbound_from(&ws::Message::Ping(Bytes::new())), None);
        assert_eq!(inbound_from(&ws::Message::Pong(Bytes::new())), None);
        assert_eq!(inbound_from(&ws::Message::Close(None)), None);
        assert_eq!(inbound_from(&ws::Message::Nop), None);
    }
}
