use farmhand_core::{LogEnvelope, LogLevel};

/// Replays one worker log event on the parent logger.
pub(crate) fn forward(envelope: &LogEnvelope) {
    match envelope.level {
        LogLevel::Info => tracing::info!(target: "farmhand::worker", "{}", envelope.message),
        LogLevel::Progress => tracing::debug!(target: "farmhand::worker", "{}", envelope.message),
        LogLevel::Verbose => tracing::trace!(target: "farmhand::worker", "{}", envelope.message),
        LogLevel::Warn => tracing::warn!(target: "farmhand::worker", "{}", envelope.message),
        LogLevel::Error => tracing::error!(target: "farmhand::worker", "{}", envelope.message),
    }
}
