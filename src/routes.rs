use log::warn;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::bus::{Bus, ItemUpdate, Value};
use crate::controller::WriteRequest;
use crate::error::AppError;

/// Read-mostly HTTP view of the device tree. Writes never touch handler
/// state here; they are forwarded to the event context and awaited.
#[derive(Clone)]
pub struct AppState {
    pub bus: Bus,
    pub writes: mpsc::Sender<WriteRequest>,
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    service: Option<String>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<ItemUpdate>,
    service_filter: Option<String>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(update) => {
                        if service_filter.as_deref().map(|s| s == update.service).unwrap_or(true) {
                            if let Ok(text) = serde_json::to_string(&update) {
                                if session.text(text).await.is_err() {
                                    warn!("WebSocket client disconnected");
                                    break;
                                }
                            }
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        if session.text(AppError::Gpio(format!("Event stream lagged by {n} messages")).to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

pub fn api_scope(base_path: &str) -> actix_web::Scope {
    web::scope(base_path)
        .service(
            web::resource("/services")
                .route(web::get().to(list_services))
                .route(
                    web::route()
                        .guard(guard_not_methods(&[Method::GET]))
                        .to(method_not_allowed),
                ),
        )
        .service(
            web::resource("/events")
                .route(web::get().to(events_ws))
                .route(
                    web::route()
                        .guard(guard_not_methods(&[Method::GET]))
                        .to(method_not_allowed),
                ),
        )
        .service(
            web::resource("/service/{name}")
                .route(web::get().to(service_snapshot))
                .route(
                    web::route()
                        .guard(guard_not_methods(&[Method::GET]))
                        .to(method_not_allowed),
                ),
        )
        .service(
            web::resource("/service/{name}/{tail:.*}")
                .route(web::get().to(get_item))
                .route(web::post().to(set_item))
                .route(
                    web::route()
                        .guard(guard_not_methods(&[Method::GET, Method::POST]))
                        .to(method_not_allowed),
                ),
        )
}

async fn list_services(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.bus.service_names("")))
}

async fn service_snapshot(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let name = parse_service_name(&req)?;
    let snapshot = state
        .bus
        .snapshot(&name)
        .ok_or(AppError::NotFoundService(name))?;

    Ok(web::Json(snapshot))
}

async fn get_item(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let name = parse_service_name(&req)?;
    let path = parse_item_path(&req)?;
    let value = state
        .bus
        .get(&name, &path)
        .ok_or_else(|| AppError::NotFoundService(format!("{name}{path}")))?;
    let text = state.bus.get_text(&name, &path).unwrap_or_default();

    Ok(web::Json(serde_json::json!({ "value": value, "text": text })))
}

async fn set_item(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let name = parse_service_name(&req)?;
    let path = parse_item_path(&req)?;
    let value = parse_value_payload(&body)?;

    match state.bus.is_writable(&name, &path) {
        None => return Err(AppError::NotFoundService(format!("{name}{path}"))),
        Some(false) => {
            return Err(AppError::InvalidState(format!("{path} is not writable")));
        }
        Some(true) => {}
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .writes
        .send(WriteRequest {
            service: name,
            path,
            value,
            reply: Some(reply_tx),
        })
        .await
        .map_err(|_| AppError::InvalidState("event loop unavailable".into()))?;
    reply_rx
        .await
        .map_err(|_| AppError::InvalidState("event loop unavailable".into()))??;

    Ok(HttpResponse::Ok())
}

async fn events_ws(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let rx = state.bus.subscribe();
    let (response, session, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::Gpio(format!("Websocket error: {e}")))?;

    let filter = query.into_inner().service;
    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, filter).await;
    });

    Ok(response)
}

fn parse_service_name(req: &HttpRequest) -> Result<String, AppError> {
    req.match_info()
        .get("name")
        .map(str::to_string)
        .ok_or_else(|| AppError::InvalidValue("Missing service name".into()))
}

fn parse_item_path(req: &HttpRequest) -> Result<String, AppError> {
    let tail = req
        .match_info()
        .get("tail")
        .ok_or_else(|| AppError::InvalidValue("Missing item path".into()))?;

    Ok(format!("/{tail}"))
}

fn parse_value_payload(body: &[u8]) -> Result<Value, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty value payload".into()));
    }

    let parsed: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidValue(format!("Invalid value payload: {e}")))?;
    match parsed {
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Ok(Value::Int(v))
            } else if let Some(v) = n.as_f64() {
                Ok(Value::Float(v))
            } else {
                Err(AppError::InvalidValue("Unrepresentable number".into()))
            }
        }
        serde_json::Value::String(s) => Ok(Value::Text(s)),
        _ => Err(AppError::InvalidValue(
            "Value must be a number or a string".into(),
        )),
    }
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
