use std::{
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use clipcascade_core::{ChangeDetector, ClipboardEvent};
use tracing::{debug, info, warn};

use crate::{
    SessionError,
    collab::{LOST_MESSAGE, LOST_TITLE, Notifier, RESTORED_MESSAGE, RESTORED_TITLE},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub connected: bool,
    pub disconnected_by_user: bool,
    pub auto_reconnecting: bool,
    pub first_loss_notified: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    flags: SessionFlags,
    detector: ChangeDetector,
    // Bumped on every user disconnect; reconnect loops from an older epoch stop.
    epoch: u64,
}

/// Connection flags and the change detector of one session.
///
/// Both the send path and the receive path go through this single mutex, and
/// notifications are emitted after the lock is released.
#[derive(Debug, Default)]
pub struct SessionShared {
    state: Mutex<SessionState>,
}

impl SessionShared {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn flags(&self) -> SessionFlags {
        self.lock().flags
    }

    pub fn is_connected(&self) -> bool {
        self.lock().flags.connected
    }

    pub fn is_user_disconnected(&self) -> bool {
        self.lock().flags.disconnected_by_user
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn has_changed(&self, content: &str) -> bool {
        self.lock().detector.has_changed(content.as_bytes())
    }

    /// Records a successful connect; a recovery after a notified loss
    /// produces exactly one "restored" notification.
    pub fn mark_connected(&self, notifier: &dyn Notifier) {
        let restored = {
            let mut state = self.lock();
            state.flags.connected = true;
            state.flags.auto_reconnecting = false;
            std::mem::replace(&mut state.flags.first_loss_notified, false)
        };
        if restored {
            notifier.notify(RESTORED_TITLE, RESTORED_MESSAGE);
        }
    }

    /// Records a lost or failed connection. Returns `false` when the user
    /// disconnected and no reconnect should happen.
    pub fn mark_lost(&self, notifier: &dyn Notifier) -> bool {
        let notify = {
            let mut state = self.lock();
            state.flags.connected = false;
            if state.flags.disconnected_by_user {
                state.flags.auto_reconnecting = false;
                return false;
            }
            state.flags.auto_reconnecting = true;
            !std::mem::replace(&mut state.flags.first_loss_notified, true)
        };
        if notify {
            notifier.notify(LOST_TITLE, LOST_MESSAGE);
        }
        true
    }

    pub fn mark_user_disconnect(&self) {
        let mut state = self.lock();
        state.flags = SessionFlags {
            connected: false,
            disconnected_by_user: true,
            auto_reconnecting: false,
            first_loss_notified: false,
        };
        state.epoch += 1;
        state.detector.reset();
    }

    /// Clears the user-disconnect mark ahead of a manual reconnect. Returns
    /// `false` while the automatic loop owns reconnection.
    pub fn begin_manual_reconnect(&self) -> bool {
        let mut state = self.lock();
        if state.flags.auto_reconnecting {
            return false;
        }
        state.flags.disconnected_by_user = false;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub backoff: Duration,
    pub connect_timeout: Duration,
}

impl ReconnectPolicy {
    /// Longest a caller can wait between a loss and the next completed attempt.
    pub fn total_timeout(&self) -> Duration {
        self.backoff + self.connect_timeout
    }
}

/// Sleeps `backoff` and retries `attempt` until it succeeds or the user
/// disconnects. A disconnect during the sleep is only seen once it ends.
///
/// `epoch` is the value of [`SessionShared::epoch`] when the connection being
/// recovered was opened.
pub async fn reconnect_until_restored<T, F, Fut>(
    shared: &SessionShared,
    notifier: &dyn Notifier,
    backoff: Duration,
    epoch: u64,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
{
    let killed = || shared.epoch() != epoch || shared.is_user_disconnected();
    let mut attempts: u32 = 0;
    loop {
        if shared.epoch() != epoch || !shared.mark_lost(notifier) {
            debug!(attempts, "reconnect loop stopped by user disconnect");
            return None;
        }
        tokio::time::sleep(backoff).await;
        if killed() {
            debug!(attempts, "reconnect loop stopped by user disconnect");
            return None;
        }

        attempts += 1;
        match attempt().await {
            Ok(value) => {
                info!(attempts, "connection restored");
                return Some(value);
            }
            Err(err) => warn!(attempts, "reconnect attempt failed: {}", err),
        }
    }
}

/// Contract shared by the relay and mesh transports.
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn shared(&self) -> &SessionShared;

    fn policy(&self) -> ReconnectPolicy;

    /// Opens the transport and waits for the server acknowledgment, bounded
    /// by the connect timeout.
    async fn connect(&self) -> Result<(), SessionError>;

    /// Marks the session user-disconnected, stops reconnecting and closes
    /// the transport.
    async fn disconnect(&self);

    /// Queues a clipboard change for delivery. Never blocks on the network.
    fn send(&self, event: ClipboardEvent);

    fn get_stats(&self) -> String;

    async fn manual_reconnect(&self) -> Result<(), SessionError> {
        if !self.shared().begin_manual_reconnect() {
            debug!("manual reconnect ignored while reconnecting automatically");
            return Ok(());
        }
        if self.shared().is_connected() {
            return Ok(());
        }
        self.connect().await
    }

    fn get_total_timeout(&self) -> Duration {
        self.policy().total_timeout()
    }

    fn is_connected(&self) -> bool {
        self.shared().is_connected()
    }
}
