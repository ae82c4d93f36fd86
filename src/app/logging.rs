use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::app::config::LoggingSettings;

pub fn init_logging(settings: &LoggingSettings) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.to_lowercase()));

    if cfg!(debug_assertions) || !settings.json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_names(true)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_target(false)
            .with_thread_names(true)
            .try_init();
    }
}

/// Fresh correlation id for one worker or one top-level operation.
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}
