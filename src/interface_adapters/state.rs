use crate::domain::PlayField;
use crate::interface_adapters::bus::Bus;
use crate::use_cases::RoomRegistry;

use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    // Directory of active rooms; read-only projection for HTTP routes.
    pub registry: Arc<RoomRegistry>,
    // Substrate every browser session connects to.
    pub bus: Bus,
    pub field: PlayField,
    // Delay before an ended game sends players back to the lobby.
    pub end_navigation_delay: Duration,
}
