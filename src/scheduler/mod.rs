mod engine;
mod signal;

pub use engine::Scheduler;
pub use signal::AbortSignal;
