use crate::domain::is_valid_room_code;
use crate::interface_adapters::http::ErrorResponse;
use crate::interface_adapters::protocol::{ClientMessage, ServerMessage};
use crate::interface_adapters::state::AppState;
use crate::interface_adapters::utils::rng;
use crate::use_cases::{ClientSession, SessionConfig, SessionEvent};

use axum::{
    Error, Json,
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::SinkExt;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};

const LOG_THROTTLE: Duration = Duration::from_secs(2);
const MAX_INVALID_JSON: u32 = 10;
const MAX_NICKNAME_LEN: usize = 32;

#[derive(Debug)]
enum NetError {
    // Categorizes connection lifecycle failures so callers can decide policy.
    #[allow(dead_code)]
    Ws(axum::Error),
    #[allow(dead_code)]
    Serialization(serde_json::Error),
}

impl From<axum::Error> for NetError {
    fn from(e: axum::Error) -> Self {
        NetError::Ws(e)
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct JoinQuery {
    // Room to join; hosts without one get a freshly generated code.
    #[serde(default)]
    room_code: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    is_host: bool,
}

fn error_response(status: StatusCode, error: &str) -> axum::response::Response {
    (status, Json(ErrorResponse::new(error))).into_response()
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<JoinQuery>,
) -> impl IntoResponse {
    let room_code = match (query.room_code, query.is_host) {
        (Some(code), _) => code.trim().to_string(),
        (None, true) => rng::room_code(),
        (None, false) => return error_response(StatusCode::BAD_REQUEST, "room_code is required"),
    };
    if !is_valid_room_code(&room_code) {
        return error_response(StatusCode::BAD_REQUEST, "invalid room_code");
    }
    // Only hosts may announce rooms; everyone else needs an active one.
    if !query.is_host && state.registry.summary(&room_code).await.is_none() {
        return error_response(StatusCode::NOT_FOUND, "room not found");
    }

    let nickname: String = query
        .nickname
        .unwrap_or_default()
        .trim()
        .chars()
        .take(MAX_NICKNAME_LEN)
        .collect();
    let config = SessionConfig::new(room_code, nickname, query.is_host)
        .with_field(state.field)
        .with_end_navigation_delay(state.end_navigation_delay);

    ws.on_upgrade(move |socket| {
        // Separate connection id doubles as the player's identity in the room.
        let client_id = rng::client_id();
        let span = info_span!(
            "conn",
            client_id = %client_id,
            room_code = %config.room_code,
            is_host = config.is_host
        );
        handle_socket(socket, state, config, client_id).instrument(span)
    })
}

async fn handle_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    config: SessionConfig,
    client_id: String,
) {
    let room_code = config.room_code.clone();

    // Tell the client "This is who you are" before anything else arrives.
    let identity = ServerMessage::Identity {
        player_id: client_id.clone(),
        room_code,
    };
    if let Err(e) = send_message(&mut socket, &identity).await {
        debug!(error = ?e, "client disconnected before identity");
        return;
    }

    let conn = state.bus.connect(client_id);
    let (session, events) = match ClientSession::start(conn, config) {
        Ok(started) => started,
        Err(e) => {
            warn!(error = %e, "failed to start session");
            let _ = send_close_with_reason(&mut socket, close_code::ERROR, "room unavailable").await;
            return;
        }
    };
    info!("client connected");

    let mut ctx = ConnCtx {
        session,
        events,
        msgs_in: 0,
        msgs_out: 0,
        invalid_json: 0,
        last_invalid_input_log: Instant::now() - LOG_THROTTLE,
        close_frame: None,
    };

    if let Err(e) = run_client_loop(&mut socket, &mut ctx).await {
        warn!(error = ?e, "client loop exited with error");
    }

    // Leaving drops presence; the coordinator turns that into a tombstone.
    let _ = ctx.session.leave();
    info!(
        msgs_in = ctx.msgs_in,
        msgs_out = ctx.msgs_out,
        invalid_json = ctx.invalid_json,
        "client disconnected"
    );
}

struct ConnCtx {
    session: ClientSession,
    events: mpsc::Receiver<SessionEvent>,

    msgs_in: u64,
    msgs_out: u64,
    invalid_json: u32,

    last_invalid_input_log: Instant,

    close_frame: Option<CloseFrame>,
}

enum LoopControl {
    Continue,
    Disconnect,
}

async fn run_client_loop(socket: &mut WebSocket, ctx: &mut ConnCtx) -> Result<(), NetError> {
    let mut fatal: Option<NetError> = None;

    loop {
        let control = tokio::select! {
            // Incoming Message from Client
            incoming = socket.recv() => handle_incoming_ws(incoming, ctx),

            // Outgoing Session Event
            event = ctx.events.recv() => match event {
                Some(event) => match forward_event(socket, &event).await {
                    Ok(()) => {
                        ctx.msgs_out += 1;
                        if event == SessionEvent::ReturnToLobby {
                            ctx.close_frame = Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: "game over".into(),
                            });
                            LoopControl::Disconnect
                        } else if let SessionEvent::RoomFailed { .. } = event {
                            ctx.close_frame = Some(CloseFrame {
                                code: close_code::ERROR,
                                reason: "room could not be created".into(),
                            });
                            LoopControl::Disconnect
                        } else {
                            LoopControl::Continue
                        }
                    }
                    Err(e) => {
                        fatal = Some(e);
                        LoopControl::Disconnect
                    }
                },
                None => {
                    debug!("session ended");
                    LoopControl::Disconnect
                }
            },
        };

        if let LoopControl::Disconnect = control {
            if let Some(frame) = ctx.close_frame.take() {
                let _ = socket.send(Message::Close(Some(frame))).await;
            }
            if let Err(err) = socket.close().await.map_err(NetError::Ws) {
                debug!(error = ?err, "socket close error");
            }
            break;
        }
    }

    match fatal {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn handle_incoming_ws(incoming: Option<Result<Message, Error>>, ctx: &mut ConnCtx) -> LoopControl {
    match incoming {
        Some(Ok(msg)) => match msg {
            Message::Text(text) => {
                ctx.msgs_in += 1;
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => dispatch(msg, ctx),
                    Err(parse_err) => {
                        ctx.invalid_json += 1;
                        if should_log(&mut ctx.last_invalid_input_log) {
                            warn!(
                                bytes = text.len(),
                                error = %parse_err,
                                "failed to parse client message"
                            );
                        }

                        if ctx.invalid_json > MAX_INVALID_JSON {
                            ctx.close_frame = Some(CloseFrame {
                                code: close_code::POLICY,
                                reason: "too many invalid messages".into(),
                            });
                            return LoopControl::Disconnect;
                        }
                        LoopControl::Continue
                    }
                }
            }
            Message::Binary(_) => {
                ctx.close_frame = Some(CloseFrame {
                    code: close_code::UNSUPPORTED,
                    reason: "binary messages not supported".into(),
                });
                LoopControl::Disconnect
            }
            Message::Ping(_) | Message::Pong(_) => LoopControl::Continue,
            Message::Close(_) => LoopControl::Disconnect,
        },
        Some(Err(e)) => {
            warn!(error = %e, "websocket recv error");
            LoopControl::Disconnect
        }
        None => {
            info!("websocket closed");
            LoopControl::Disconnect
        }
    }
}

fn dispatch(msg: ClientMessage, ctx: &mut ConnCtx) -> LoopControl {
    let sent = match msg {
        ClientMessage::Move { x, y } => match ClientMessage::move_target(x, y) {
            Ok(target) => ctx.session.move_to(target),
            Err(e) => {
                if should_log(&mut ctx.last_invalid_input_log) {
                    warn!(error = %e, "invalid move dropped");
                }
                Ok(())
            }
        },
        ClientMessage::Step { direction } => ctx.session.step(direction.into()),
        ClientMessage::Died => ctx.session.die(),
        ClientMessage::StartGame => ctx.session.start_game(),
        ClientMessage::EndGame => ctx.session.end_game(),
    };

    match sent {
        Ok(()) => LoopControl::Continue,
        Err(e) => {
            debug!(error = %e, "session gone; disconnecting");
            LoopControl::Disconnect
        }
    }
}

async fn forward_event(socket: &mut WebSocket, event: &SessionEvent) -> Result<(), NetError> {
    send_message(socket, &ServerMessage::from(event)).await?;
    Ok(())
}

async fn send_message(socket: &mut WebSocket, msg: &ServerMessage) -> Result<usize, NetError> {
    // Serialize message safely; log JSON errors instead of panicking
    let txt = serde_json::to_string(msg).map_err(NetError::Serialization)?;
    let bytes = txt.len();
    socket
        .send(Message::Text(txt.into()))
        .await
        .map_err(NetError::Ws)?;
    Ok(bytes)
}

async fn send_close_with_reason(
    socket: &mut WebSocket,
    code: u16,
    reason: &'static str,
) -> Result<(), NetError> {
    socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await
        .map_err(NetError::Ws)?;
    socket.close().await.map_err(NetError::Ws)
}

fn should_log(last: &mut Instant) -> bool {
    if last.elapsed() >= LOG_THROTTLE {
        *last = Instant::now();
        true
    } else {
        false
    }
}
