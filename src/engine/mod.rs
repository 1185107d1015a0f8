//! Engine: the periodic control loop tying catalog, ledger, tracker,
//! scheduler and risk together.

mod orchestrator;
mod restore;

pub use orchestrator::{Collaborators, Engine, EngineStatus, IterationReport};
pub use restore::RestoreReport;
