//! Seams to the parts of the application that live outside the sessions:
//! the platform clipboard writer and the user notification surface.

use std::sync::Arc;

use clipcascade_core::ClipboardEvent;
use tracing::info;

pub const LOST_TITLE: &str = "ClipCascade: Connection Lost";
pub const LOST_MESSAGE: &str = "Check your internet connection. Retrying...";
pub const RESTORED_TITLE: &str = "ClipCascade: Connection Restored";
pub const RESTORED_MESSAGE: &str = "Connection re-established";

/// Applies a verified inbound clipboard payload to the local clipboard.
pub trait ClipboardSink: Send + Sync {
    fn write_clipboard(&self, event: ClipboardEvent) -> Result<(), String>;
}

pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Routes notifications into the log.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, message: &str) {
        info!(title, "{}", message);
    }
}

/// Drops every notification; used when the user turned them off.
#[derive(Debug, Clone, Default)]
pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn notify(&self, _title: &str, _message: &str) {}
}

pub fn notifier_for(enabled: bool) -> Arc<dyn Notifier> {
    if enabled {
        Arc::new(TracingNotifier)
    } else {
        Arc::new(SilentNotifier)
    }
}
