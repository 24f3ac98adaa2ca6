use crate::domain::{PlayField, Position};
use rand::Rng;
use std::{
    sync::{
        OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

const ROOM_CODE_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ROOM_CODE_LEN: usize = 8;

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Returns a process-unique, monotonically increasing identifier.
///
/// Used to tell apart successive coordinators that reuse the same room code.
pub fn rand_id() -> u64 {
    static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    let counter = COUNTER.get_or_init(|| AtomicU64::new(now_nanos()));
    counter.fetch_add(1, Ordering::Relaxed)
}

/// Random room code such as `room-k3j9x0ab` (36^8 combinations).
pub fn room_code() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ROOM_CODE_LEN)
        .map(|_| char::from(ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())]))
        .collect();
    format!("room-{suffix}")
}

/// Opaque per-connection identity.
pub fn client_id() -> String {
    format!("id-{}", uuid::Uuid::new_v4().simple())
}

/// `#rrggbb` display color.
pub fn player_color() -> String {
    format!("#{:06x}", rand::thread_rng().gen_range(0..=0x00ff_ffffu32))
}

/// Uniformly sampled spawn point inside the field.
pub fn spawn_position(field: &PlayField) -> Position {
    let mut rng = rand::thread_rng();
    Position::new(rng.gen_range(0..=field.width), rng.gen_range(0..=field.height))
}
