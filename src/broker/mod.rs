mod broker;
mod event;

pub use broker::{EventBroker, EventStream};
pub use event::{Event, EventKind, Phase};
