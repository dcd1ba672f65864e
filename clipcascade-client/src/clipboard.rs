//! Text clipboard access through `arboard`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use arboard::Clipboard;
use clipcascade_core::{ClipboardEvent, PayloadKind, content_hash};
use tracing::{debug, warn};

use crate::collab::ClipboardSink;

/// Writes inbound text to the system clipboard.
#[derive(Debug, Clone, Default)]
pub struct ArboardClipboard;

impl ClipboardSink for ArboardClipboard {
    fn write_clipboard(&self, event: ClipboardEvent) -> Result<(), String> {
        if event.kind != PayloadKind::Text {
            return Err(format!(
                "{} payloads are not supported by the text clipboard",
                event.kind.as_str()
            ));
        }
        let mut clipboard = Clipboard::new().map_err(|err| err.to_string())?;
        clipboard.set_text(event.content).map_err(|err| err.to_string())
    }
}

/// Polls the clipboard on a dedicated thread and reports text changes.
///
/// Only compares against the previous poll; echo suppression of content
/// that arrived from other devices happens in the session.
pub struct ClipboardCollector {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ClipboardCollector {
    pub fn start<F>(interval: Duration, on_change: F) -> Self
    where
        F: Fn(ClipboardEvent) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::spawn(move || {
            let mut clipboard = None;
            let mut last_hash = None;
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                if clipboard.is_none() {
                    clipboard = match Clipboard::new() {
                        Ok(clipboard) => Some(clipboard),
                        Err(err) => {
                            warn!("clipboard unavailable: {}", err);
                            continue;
                        }
                    };
                }
                let Some(board) = clipboard.as_mut() else {
                    continue;
                };

                let text = match board.get_text() {
                    Ok(text) => text,
                    Err(arboard::Error::ContentNotAvailable) => continue,
                    Err(err) => {
                        debug!("clipboard read failed: {}", err);
                        clipboard = None;
                        continue;
                    }
                };
                let hash = content_hash(text.as_bytes());
                if last_hash.replace(hash) == Some(hash) {
                    continue;
                }
                on_change(ClipboardEvent::text(text));
            }
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("clipboard collector thread panicked");
        }
    }
}

impl Drop for ClipboardCollector {
    fn drop(&mut self) {
        self.stop();
    }
}
