mod autoscaler;
mod fleet;
mod game_type;
mod server;

pub use autoscaler::{
    AutoscalePolicy, GameTypeAutoscaler, GameTypeAutoscalerSpec, ServiceRef, SyncSpec,
    WebhookPolicy,
};
pub use fleet::{AgePriority, Fleet, FleetSpec, FleetStatus, ScalingSpec};
pub use game_type::{GameType, GameTypeSpec, GameTypeStatus};
pub use server::{GameInfo, Server, ServerSpec, ServerStatus, SidecarSettings};

/// API group shared by all four resources.
pub const GROUP: &str = "gameserver.arcadia.dev";

/// Label tying a Server to the Fleet that created it.
pub const FLEET_LABEL: &str = "fleet";

/// Label tying a Fleet to the GameType that created it.
pub const GAME_TYPE_LABEL: &str = "gametype";

/// Label tying a Pod to the Server that created it.
pub const SERVER_LABEL: &str = "server";
