// Network adapter modules split by browser sockets vs room listing routes.

pub mod client;
pub mod rooms;

pub use client::ws_handler;
pub use rooms::{list_rooms_handler, room_route_handler};
