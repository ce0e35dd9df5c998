pub mod decision;
pub mod time;

pub use decision::{DecisionGraph, HeuristicGraph};
pub use time::{AdvanceOutcome, SimulatedClock, TimeService};
