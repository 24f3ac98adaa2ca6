use crate::domain::Phase;
use crate::interface_adapters::protocol::{RoomRouteDto, RoomView, RoomsResponse};
use crate::interface_adapters::state::AppState;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use std::sync::Arc;

#[derive(Debug, serde::Deserialize)]
pub struct RouteQuery {
    // Hosts always land on the host page, whether or not the room exists yet.
    #[serde(default)]
    is_host: bool,
}

pub async fn list_rooms_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summaries = state.registry.list_summaries().await;
    let totals = state.registry.totals().await;
    Json(RoomsResponse::new(&summaries, totals))
}

/// Decides which page a requester should see for `room_code`.
pub async fn room_route_handler(
    State(state): State<Arc<AppState>>,
    Path(room_code): Path<String>,
    Query(query): Query<RouteQuery>,
) -> impl IntoResponse {
    let summary = state.registry.summary(&room_code).await;
    let view = match (query.is_host, summary) {
        (true, _) => RoomView::Host,
        (false, Some(summary)) if summary.phase == Phase::Waiting => RoomView::Waiting,
        (false, Some(_)) => RoomView::Started,
        (false, None) => RoomView::NotFound,
    };

    let status = if view == RoomView::NotFound {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    (status, Json(RoomRouteDto { room_code, view }))
}
