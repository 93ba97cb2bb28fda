//! HTTP surface: the websocket upgrade, message submission and a session count.
//!
//! Handlers expect `web::Data<SessionContext>` and `web::Data<NodeId>` in the app data.

use actix_web::{web, Error, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::hub::ListSessions;
use crate::redis_bridge::NodeId;
use crate::session::SessionContext;
use crate::ws;

#[derive(Debug, Deserialize, Serialize)]
pub struct SubmitJson {
    pub text: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct JsonResponse {
    pub status: String,
    pub seq: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Stats {
    pub node: String,
    pub sessions: usize,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/", web::get().to(ws_handler))
        .route("/messages", web::post().to(submit))
        .route("/stats", web::get().to(stats));
}

async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    ctx: web::Data<SessionContext>,
) -> Result<HttpResponse, Error> {
    ws::start(&req, stream, ctx.get_ref().clone())
}

async fn submit(ctx: web::Data<SessionContext>, body: web::Json<SubmitJson>) -> HttpResponse {
    match ctx.submit(&body.text).await {
        Ok(seq) => HttpResponse::Ok().json(JsonResponse {
            status: "message stored and broadcast".to_string(),
            seq,
        }),
        Err(e) => {
            warn!("rejected submitted message: {}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn stats(ctx: web::Data<SessionContext>, node: web::Data<NodeId>) -> HttpResponse {
    match ctx.hub.send(ListSessions).await {
        Ok(ids) => HttpResponse::Ok().json(Stats {
            node: node.to_string(),
            sessions: ids.len(),
        }),
        Err(_) => HttpResponse::ServiceUnavailable().finish(),
    }
}
