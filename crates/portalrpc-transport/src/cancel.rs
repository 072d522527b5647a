//! Cooperative cancellation for blocking RPC waits.
//!
//! A [`CancelHandle`] triggers cancellation; every clone of the paired
//! [`CancelToken`] observes it, either by polling [`CancelToken::is_cancelled`] or by
//! awaiting [`CancelToken::cancelled`], which suspends without consuming compute.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Reasons for cancelling a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CancelReason {
    /// The caller gave up on the exchange.
    #[default]
    UserRequested,
    /// A caller-side deadline expired.
    DeadlineExceeded,
    /// The owning process is shutting down.
    Shutdown,
    /// A newer exchange supersedes this one.
    Superseded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            CancelReason::Shutdown => write!(f, "Shutdown"),
            CancelReason::Superseded => write!(f, "Superseded"),
        }
    }
}

// The reason is stored before the token fires, so every observer of the
// cancellation also sees its reason.
#[derive(Default)]
struct CancelState {
    token: CancellationToken,
    reason: Mutex<Option<CancelReason>>,
}

impl CancelState {
    fn cancel(&self, reason: CancelReason) {
        if let Ok(mut r) = self.reason.lock() {
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.token.cancel();
    }

    fn reason(&self) -> Option<CancelReason> {
        if !self.token.is_cancelled() {
            return None;
        }
        self.reason.lock().ok().and_then(|r| *r)
    }
}

/// A lightweight, cloneable cancellation token.
#[derive(Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.cancelled_reason())
            .finish()
    }
}

impl CancelToken {
    /// A token nobody holds a handle for; it is never cancelled.
    pub fn never() -> Self {
        Self::default()
    }

    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.token.is_cancelled()
    }

    /// Get the cancellation reason if cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        self.state.reason()
    }

    /// Suspends until the token is cancelled and returns the reason.
    pub async fn cancelled(&self) -> CancelReason {
        self.state.token.cancelled().await;
        self.state.reason().unwrap_or_default()
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Trigger cancellation. Only the first reason is kept.
    pub fn cancel(&self, reason: CancelReason) {
        self.state.cancel(reason);
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.state.token.is_cancelled()
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = Arc::new(CancelState::default());
    (
        CancelToken {
            state: Arc::clone(&state),
        },
        CancelHandle { state },
    )
}
