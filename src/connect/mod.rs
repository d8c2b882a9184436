//! Bootstrap/connect subsystem (§3–§5): stage machine, probe, and the two
//! flavors of bootstrap attempt, coordinated by `ConnectOrchestrator`.

mod auto_bootstrap;
mod bootstrap_attempt;
mod internet_probe;
mod orchestrator;
mod stage;

pub use auto_bootstrap::{AutoBootstrapAttempt, AutoBootstrapOutcome};
pub use bootstrap_attempt::{BootstrapAttempt, BootstrapOutcome};
pub use internet_probe::{build_probe, InternetProbe};
pub use orchestrator::ConnectOrchestrator;
pub use stage::{BootstrapOptions, BootstrapStatus, Stage, StageSnapshot};
