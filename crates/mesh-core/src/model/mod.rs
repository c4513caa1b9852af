//! Domain models cached by the governance layer.
//!
//! Every model implements [`Record`](crate::Record). The four rule kinds
//! additionally implement [`Rule`], which tells the wildcard index where a
//! rule binds and in which order rules are evaluated.

mod circuitbreaker;
mod faultdetect;
mod instance;
mod lane;
mod router;
mod rule;

pub use circuitbreaker::{CircuitBreakerLevel, CircuitBreakerRule};
pub use faultdetect::FaultDetectRule;
pub use instance::{
    Instance, InstanceCount, Location, VersionCount, DEFAULT_HEARTBEAT_TTL_SECS,
    METADATA_CAMPUS, METADATA_LAST_HEARTBEAT, METADATA_PROTOCOL, METADATA_REGION,
    METADATA_VERSION, METADATA_ZERO_PROTECTED, METADATA_ZONE,
};
pub use lane::{LaneGroup, LaneRule};
pub use router::{LegacyOrigin, RouterRule, RoutingPolicy};
pub use rule::{Rule, RuleMeta};
