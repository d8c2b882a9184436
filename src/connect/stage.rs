//! Stage machine data model (§3): the tagged-enum state ConnectOrchestrator
//! dispatches on. Replaces the original's class-inheritance state objects
//! with a plain enum plus a single nullable "requested stage" field.

use serde::{Deserialize, Serialize};

use crate::error::BootstrapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Disabled,
    Loading,
    Start,
    Bootstrapping,
    Offline,
    ChooseRegion,
    RegionNotFound,
    ConfirmRegion,
    FinalError,
    Bootstrapped,
}

impl Stage {
    pub fn can_begin_bootstrap(self) -> bool {
        matches!(
            self,
            Stage::Start | Stage::Offline | Stage::ChooseRegion | Stage::RegionNotFound | Stage::ConfirmRegion
        )
    }

    pub fn can_begin_auto_bootstrap(self) -> bool {
        matches!(self, Stage::ChooseRegion | Stage::RegionNotFound | Stage::ConfirmRegion)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapStatus {
    pub progress: u8,
    pub has_warning: bool,
}

impl Default for BootstrapStatus {
    fn default() -> Self {
        Self { progress: 0, has_warning: false }
    }
}

/// Emitted on every stage change (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub name: Stage,
    pub default_region: String,
    pub bootstrap_trigger: Option<Stage>,
    pub error: Option<BootstrapError>,
    pub try_again: bool,
    pub potentially_blocked: bool,
    pub status: BootstrapStatus,
}

impl StageSnapshot {
    pub fn new(default_region: impl Into<String>) -> Self {
        Self {
            name: Stage::Disabled,
            default_region: default_region.into(),
            bootstrap_trigger: None,
            error: None,
            try_again: false,
            potentially_blocked: false,
            status: BootstrapStatus::default(),
        }
    }
}

/// `regionCode: None` means "ordinary bootstrap"; `Some("automatic")` means
/// "auto-bootstrap, let Moat detect the region"; any other `Some(code)` is
/// an explicit region for auto-bootstrap.
#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    pub region_code: Option<String>,
    pub test_internet: bool,
}
