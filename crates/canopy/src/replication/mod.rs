mod config;
mod deferred;
mod engine;
mod events;
mod pending;
mod timing;

pub use config::ReplicationConfig;
pub use deferred::{DeferredOp, DeferredQueue};
pub use engine::{ReplicationError, Replicator, Role};
pub use events::ReplicationEvent;
pub use pending::PendingAdds;
pub use timing::{IntervalTimer, StepClock};
