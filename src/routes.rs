use log::warn;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::backend::GpioBackend;
use crate::config::{Direction, EdgeDetect, Pull};
use crate::error::AppError;
use crate::gpio::{EdgeEvent, GpioManager};
use crate::pins::{BoardRevision, NumberingMode};
use crate::poller::PollerState;
use crate::registry::ChannelSnapshot;

pub struct AppState<B: GpioBackend> {
    pub manager: Arc<GpioManager<B>>,
}

impl<B: GpioBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

#[derive(Deserialize)]
struct NumberingPayload {
    mode: NumberingMode,
}

#[derive(Deserialize)]
struct SetupPayload {
    direction: Direction,
    #[serde(default)]
    pull: Pull,
}

#[derive(Deserialize)]
struct WatchPayload {
    edge: EdgeDetect,
    debounce_ms: Option<u64>,
}

#[derive(Deserialize)]
struct WaitPayload {
    edge: EdgeDetect,
    debounce_ms: Option<u64>,
    /// Zero or negative polls once; absent waits up to the HTTP timeout.
    timeout_ms: Option<i64>,
}

#[derive(Deserialize, Default)]
struct CleanupPayload {
    channel: Option<u32>,
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct StatusView {
    numbering: NumberingMode,
    board_revision: BoardRevision,
    poller: PollerState,
    channels: usize,
}

#[derive(Serialize)]
struct ChannelView {
    channel: u32,
    gpio: u32,
    direction: Option<Direction>,
    edge_detection: Option<ChannelSnapshot>,
}

#[derive(Serialize)]
struct WaitResult {
    value: Option<u8>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<EdgeEvent>,
    channel_filter: Option<u32>,
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
                    Ok(event) => {
                        if channel_filter.is_none_or(|c| c == event.channel)
                            && let Ok(text) = serde_json::to_string(&event)
                            && session.text(text).await.is_err()
                        {
                            warn!("WebSocket client disconnected");
                            break;
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

impl<B: GpioBackend> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        api_scope::<B>(base_path)
    }
}

pub fn api_scope<B: GpioBackend>(base_path: &str) -> actix_web::Scope {
    web::scope(base_path)
        .service(
            web::resource("/status")
                .route(web::get().to(status::<B>))
                .route(not_allowed(&[Method::GET])),
        )
        .service(
            web::resource("/numbering")
                .route(web::post().to(set_numbering::<B>))
                .route(not_allowed(&[Method::POST])),
        )
        .service(
            web::resource("/cleanup")
                .route(web::post().to(cleanup::<B>))
                .route(not_allowed(&[Method::POST])),
        )
        .service(
            web::resource("/gpios")
                .route(web::get().to(list_channels::<B>))
                .route(not_allowed(&[Method::GET])),
        )
        .service(
            web::resource("/gpios/events")
                .route(web::get().to(events_ws_all::<B>))
                .route(not_allowed(&[Method::GET])),
        )
        .service(
            web::resource("/gpio/{channel}")
                .route(web::get().to(channel_view::<B>))
                .route(not_allowed(&[Method::GET])),
        )
        .service(
            web::resource("/gpio/{channel}/setup")
                .route(web::post().to(setup::<B>))
                .route(not_allowed(&[Method::POST])),
        )
        .service(
            web::resource("/gpio/{channel}/watch")
                .route(web::post().to(watch::<B>))
                .route(web::delete().to(stop_watching::<B>))
                .route(not_allowed(&[Method::POST, Method::DELETE])),
        )
        .service(
            web::resource("/gpio/{channel}/wait")
                .route(web::post().to(wait_for_edge::<B>))
                .route(not_allowed(&[Method::POST])),
        )
        .service(
            web::resource("/gpio/{channel}/detected")
                .route(web::get().to(event_detected::<B>))
                .route(not_allowed(&[Method::GET])),
        )
        .service(
            web::resource("/gpio/{channel}/event")
                .route(web::get().to(get_last_event::<B>))
                .route(not_allowed(&[Method::GET])),
        )
        .service(
            web::resource("/gpio/{channel}/events")
                .route(web::get().to(get_events::<B>))
                .route(not_allowed(&[Method::GET])),
        )
        .service(
            web::resource("/gpio/{channel}/stream")
                .route(web::get().to(events_ws_channel::<B>))
                .route(not_allowed(&[Method::GET])),
        )
}

/// Runs a manager call on the blocking pool; sysfs writes may sleep between
/// retries and waits block until an edge arrives.
async fn run_blocking<B, R, F>(state: &web::Data<AppState<B>>, f: F) -> Result<R, AppError>
where
    B: GpioBackend,
    R: Send + 'static,
    F: FnOnce(&GpioManager<B>) -> Result<R, AppError> + Send + 'static,
{
    let manager = Arc::clone(&state.manager);
    web::block(move || f(&manager))
        .await
        .map_err(|e| AppError::Gpio(format!("blocking task failed: {e}")))?
}

async fn status<B: GpioBackend>(state: web::Data<AppState<B>>) -> Result<impl Responder, AppError> {
    let manager = &state.manager;

    Ok(web::Json(StatusView {
        numbering: manager.numbering(),
        board_revision: manager.board_revision(),
        poller: manager.poller_state(),
        channels: manager.channels().len(),
    }))
}

async fn set_numbering<B: GpioBackend>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let payload: NumberingPayload = parse_json_payload(&body)?;
    state.manager.set_numbering(payload.mode)?;

    Ok(HttpResponse::Ok())
}

async fn cleanup<B: GpioBackend>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let payload: CleanupPayload = if body.is_empty() {
        CleanupPayload::default()
    } else {
        parse_json_payload(&body)?
    };
    run_blocking(&state, move |m| m.cleanup(payload.channel)).await?;

    Ok(HttpResponse::Ok())
}

async fn list_channels<B: GpioBackend>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.channels()))
}

async fn channel_view<B: GpioBackend>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;
    let manager = &state.manager;

    Ok(web::Json(ChannelView {
        channel,
        gpio: manager.resolve(channel)?,
        direction: manager.direction(channel)?,
        edge_detection: manager.channel_state(channel)?,
    }))
}

async fn setup<B: GpioBackend>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;
    let payload: SetupPayload = parse_json_payload(&body)?;

    run_blocking(&state, move |m| m.setup(channel, payload.direction, payload.pull)).await?;

    Ok(HttpResponse::Ok())
}

async fn watch<B: GpioBackend>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;
    let payload: WatchPayload = parse_json_payload(&body)?;
    let debounce = payload.debounce_ms.map(Duration::from_millis);

    run_blocking(&state, move |m| m.watch_events(channel, payload.edge, debounce)).await?;

    Ok(HttpResponse::Created().finish())
}

async fn stop_watching<B: GpioBackend>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;

    run_blocking(&state, move |m| m.stop_watching(channel)).await?;

    Ok(HttpResponse::Ok())
}

async fn wait_for_edge<B: GpioBackend>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;
    let payload: WaitPayload = parse_json_payload(&body)?;
    let debounce = payload.debounce_ms.map(Duration::from_millis);
    let timeout = match payload.timeout_ms {
        Some(ms) => Duration::from_millis(ms.max(0) as u64),
        None => Duration::from_secs(state.manager.config().http.timeout),
    };

    let value = run_blocking(&state, move |m| {
        m.wait_for_edge(channel, payload.edge, debounce, Some(timeout))
    })
    .await?;

    Ok(web::Json(WaitResult { value }))
}

async fn event_detected<B: GpioBackend>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;

    Ok(web::Json(state.manager.event_detected(channel)?))
}

async fn get_last_event<B: GpioBackend>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;

    let last = state.manager.get_last_event(channel)?;

    match last {
        Some(event) => Ok(HttpResponse::Ok().json(event)),
        None => Ok(HttpResponse::Ok().finish()),
    }
}

async fn get_events<B: GpioBackend>(
    req: HttpRequest,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;

    let events = state.manager.get_events(channel, query.limit)?;

    Ok(web::Json(events))
}

async fn events_ws_all<B: GpioBackend>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    open_event_websocket(&req, stream, &state, None)
}

async fn events_ws_channel<B: GpioBackend>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    let channel = parse_channel(&req)?;
    state.manager.resolve(channel)?;
    open_event_websocket(&req, stream, &state, Some(channel))
}

fn open_event_websocket<B: GpioBackend>(
    req: &HttpRequest,
    stream: web::Payload,
    state: &web::Data<AppState<B>>,
    channel_filter: Option<u32>,
) -> Result<HttpResponse, AppError> {
    let rx = state.manager.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(req, stream)
        .map_err(|e| AppError::Gpio(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, channel_filter).await;
    });

    Ok(response)
}

fn parse_channel(req: &HttpRequest) -> Result<u32, AppError> {
    let channel = req
        .match_info()
        .get("channel")
        .ok_or_else(|| AppError::InvalidValue("Missing channel".into()))?;
    let channel = channel
        .parse::<u32>()
        .map_err(|_| AppError::InvalidValue("Invalid channel".into()))?;

    Ok(channel)
}

fn parse_json_payload<T: DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty payload".into()));
    }

    serde_json::from_slice(body).map_err(|e| AppError::InvalidValue(format!("Invalid payload: {e}")))
}

fn not_allowed(allowed: &[Method]) -> actix_web::Route {
    web::route()
        .guard(guard_not_methods(allowed))
        .to(method_not_allowed)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard + use<> {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
