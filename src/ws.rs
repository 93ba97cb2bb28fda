use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::TransportError;
use crate::session::{CloseStatus, Inbound, Outbound, Session, SessionContext};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
/// Frames read from the peer but not yet taken by ingress. A peer that outruns ingress
/// past this is disconnected.
pub const INBOUND_BACKLOG: usize = 64;

type InboundFrame = Result<String, TransportError>;

/// Actor owning one upgraded websocket. It only moves frames: text from the peer goes to
/// the session's ingress loop, [`Frame`]s from the session go to the peer.
pub struct WsConnection {
    hb: Instant,
    inbound: mpsc::Sender<InboundFrame>,
}

#[derive(Debug, Message)]
#[rtype(result = "()")]
pub enum Frame {
    Text(String),
    Close(CloseStatus),
}

impl WsConnection {
    fn new(inbound: mpsc::Sender<InboundFrame>) -> Self {
        Self {
            hb: Instant::now(),
            inbound,
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                debug!("websocket heartbeat timed out");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn forward(&mut self, text: String, ctx: &mut ws::WebsocketContext<Self>) {
        self.hb = Instant::now();
        match self.inbound.try_send(Ok(text)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "websocket peer outran ingress by {} frames, disconnecting",
                    INBOUND_BACKLOG
                );
                ctx.stop();
            }
            // ingress loop is gone
            Err(TrySendError::Closed(_)) => ctx.stop(),
        }
    }
}

impl Actor for WsConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.start_heartbeat(ctx);
    }
}

impl Handler<Frame> for WsConnection {
    type Result = ();

    fn handle(&mut self, msg: Frame, ctx: &mut Self::Context) -> Self::Result {
        match msg {
            Frame::Text(text) => ctx.text(text),
            Frame::Close(status) => {
                ctx.close(Some(close_reason(status)));
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsConnection {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match item {
            Ok(m) => m,
            Err(e) => {
                let _ = self
                    .inbound
                    .try_send(Err(TransportError::Protocol(e.to_string())));
                ctx.stop();
                return;
            }
        };

        match msg {
            ws::Message::Ping(bytes) => {
                self.hb = Instant::now();
                ctx.pong(&bytes);
            }
            ws::Message::Pong(_) => {
                self.hb = Instant::now();
            }
            ws::Message::Text(text) => self.forward(text.to_string(), ctx),
            ws::Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => self.forward(text, ctx),
                Err(_) => debug!("ignoring non utf-8 binary frame"),
            },
            ws::Message::Close(reason) => {
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) => ctx.stop(),
            ws::Message::Nop => {}
        }
    }
}

fn close_reason(status: CloseStatus) -> ws::CloseReason {
    let (code, description) = match status {
        CloseStatus::ReadDone => (ws::CloseCode::Normal, "read done"),
        CloseStatus::WriteDone => (ws::CloseCode::Normal, "write done"),
        CloseStatus::HubClosed => (ws::CloseCode::Error, "hub closed"),
        CloseStatus::Expired => (ws::CloseCode::Normal, "session expired"),
    };
    ws::CloseReason {
        code,
        description: Some(description.to_string()),
    }
}

pub struct WsInbound(mpsc::Receiver<InboundFrame>);

impl Inbound for WsInbound {
    fn recv(&mut self) -> BoxFuture<'_, Option<InboundFrame>> {
        Box::pin(self.0.recv())
    }
}

#[derive(Clone)]
pub struct WsOutbound(Addr<WsConnection>);

impl Outbound for WsOutbound {
    fn send(&self, text: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.0
                .send(Frame::Text(text))
                .await
                .map_err(|_| TransportError::Closed)
        })
    }

    fn close(&self, status: CloseStatus) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.0.send(Frame::Close(status)).await;
        })
    }
}

/// Upgrade the request and run a [`Session`] over the resulting connection.
pub fn start(
    req: &HttpRequest,
    stream: web::Payload,
    ctx: SessionContext,
) -> Result<HttpResponse, actix_web::Error> {
    let (tx, rx) = mpsc::channel(INBOUND_BACKLOG);
    let (addr, response) =
        ws::WsResponseBuilder::new(WsConnection::new(tx), req, stream).start_with_addr()?;

    let session = Session::new(ctx, WsInbound(rx), WsOutbound(addr));
    debug!("websocket upgraded for session {}", session.id());
    actix_web::rt::spawn(session.run());
    Ok(response)
}
