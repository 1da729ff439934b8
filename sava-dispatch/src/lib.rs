mod delivery;
mod errors;
mod instance;
mod registry;
mod scheduler;

pub use delivery::{Delivery, Resolution};
pub use errors::{DispatchError, Result};
pub use instance::{InstanceState, MessageInstance};
pub use registry::{MessageRef, MessageRegistry, ReleaseOutcome};
pub use scheduler::{
    ConsumerSlot, PreparedDelivery, PreparedMessage, QueueScheduler, ResolutionEffects,
    SweepEffects,
};
