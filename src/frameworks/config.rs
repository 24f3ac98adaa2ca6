use std::{env, time::Duration};

// Runtime/server constants (not room rules).

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub fn http_port() -> u16 {
    env::var("ROOM_SERVER_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000)
}

pub fn tick_interval() -> Duration {
    let millis = env_u64("TICK_INTERVAL_MS")
        .filter(|ms| *ms > 0)
        .unwrap_or(100);
    Duration::from_millis(millis)
}

/// Broadcasts a disconnected player stays visible for. Never below the minimum.
pub fn removal_grace_ticks() -> u32 {
    env_u64("REMOVAL_GRACE_TICKS")
        .and_then(|ticks| u32::try_from(ticks).ok())
        .unwrap_or(MIN_REMOVAL_GRACE_TICKS)
        .max(MIN_REMOVAL_GRACE_TICKS)
}

pub fn max_rooms() -> usize {
    env_u64("MAX_ROOMS")
        .and_then(|rooms| usize::try_from(rooms).ok())
        .filter(|rooms| *rooms > 0)
        .unwrap_or(1024)
}

pub fn room_idle_timeout() -> Duration {
    Duration::from_secs(env_u64("ROOM_IDLE_TIMEOUT_SECS").unwrap_or(30))
}

pub fn end_navigation_delay() -> Duration {
    Duration::from_millis(env_u64("END_NAVIGATION_DELAY_MS").unwrap_or(3000))
}

pub const MIN_REMOVAL_GRACE_TICKS: u32 = 2;

pub const BUS_CHANNEL_CAPACITY: usize = 256;
pub const ROOM_INBOX_CAPACITY: usize = 1024;
pub const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub const FIELD_WIDTH: i32 = 800;
pub const FIELD_HEIGHT: i32 = 400;
pub const FIELD_STEP: i32 = 20;

