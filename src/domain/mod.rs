// Domain layer: room rules and the types they operate on.

pub mod field;
pub mod room;
pub mod state;

pub use field::{Direction, PlayField, Position};
pub use room::{Admission, Dismissal, IgnoredIntent, IntentOutcome, Room, is_valid_room_code};
pub use state::{
    Connection, CoordinatorStatus, Intent, Phase, PlayerId, PlayerSnapshot, PlayerState,
    RoomSnapshot,
};
