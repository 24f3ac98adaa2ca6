// Use cases layer: room coordination, registry and client session workflows.

pub mod coordinator;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod types;

pub use coordinator::{CoordinatorError, CoordinatorSettings, RoomHandle, spawn_coordinator};
pub use reconcile::{PlayerEvent, Reconciliation, ShadowState};
pub use registry::{RegistryError, RegistrySettings, RoomRegistry, SpawnOutcome};
pub use session::{ClientSession, SessionConfig, SessionError};
pub use types::{LifecycleMessage, PlayerTotals, RoomEvent, RoomSummary, SessionEvent};
