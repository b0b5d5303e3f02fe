//! Structured logging setup: a service-manager core has no interactive
//! console to draw progress on, but every job transition still needs a
//! canonical, greppable log line.

use tracing_subscriber::EnvFilter;

use crate::config::ManagerConfig;

/// Canonical message ids a careful operator greps for
/// (`UnitStarted`, `UnitStopped`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    UnitStarted,
    UnitStopped,
    UnitReloaded,
    UnitFailed,
}

impl MessageId {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageId::UnitStarted => "UnitStarted",
            MessageId::UnitStopped => "UnitStopped",
            MessageId::UnitReloaded => "UnitReloaded",
            MessageId::UnitFailed => "UnitFailed",
        }
    }
}

/// Install the global tracing subscriber. Idempotent-ish: a second call
/// returns `Err` from `try_init`, which callers are expected to ignore in
/// test setups that call it from multiple test threads.
pub fn init(config: &ManagerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Emit the canonical job-transition log line.
#[macro_export]
macro_rules! log_job_transition {
    ($unit:expr, $job_type:expr, $job_result:expr, $message_id:expr) => {
        tracing::info!(
            unit = %$unit,
            job_type = ?$job_type,
            job_result = ?$job_result,
            message_id = $message_id.as_str(),
            "job transition"
        );
    };
}
