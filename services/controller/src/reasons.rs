//! Event and condition reasons.

pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
pub const FAILED_CREATE: &str = "FailedCreate";
pub const SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
pub const FAILED_DELETE: &str = "FailedDelete";
pub const SUCCESSFUL_UPDATE: &str = "SuccessfulUpdate";
pub const FAILED_UPDATE: &str = "FailedUpdate";
pub const SUCCESSFUL_PAUSED: &str = "SuccessfulPaused";
pub const SUCCESSFUL_RESUME: &str = "SuccessfulResume";
pub const SUCCESSFUL_RESUMED: &str = "SuccessfulResumed";

pub const FAILED_SCALE_OUT: &str = "FailedScaleOut";
pub const FAILED_SCALE_IN: &str = "FailedScaleIn";
pub const FAILED_REVISION_PRUNING: &str = "FailedRevisionPruning";
