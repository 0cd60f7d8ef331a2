mod gate;

pub use gate::{Decision, InterventionAction, InterventionGate, PendingIntervention};
