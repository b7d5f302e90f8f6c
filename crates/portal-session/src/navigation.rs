//! Navigation seam between the session core and the application shell.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

/// Moves the application to another route.
pub trait Navigator: Send + Sync + 'static {
    /// Navigates to `path`.
    fn navigate(&self, path: &str);
}

/// [`Navigator`] that records every visited path.
#[derive(Debug, Clone, Default)]
pub struct HistoryNavigator {
    history: Arc<Mutex<Vec<String>>>,
}

impl HistoryNavigator {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent path, if any navigation happened.
    #[must_use]
    pub fn current(&self) -> Option<String> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Every visited path, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Navigator for HistoryNavigator {
    fn navigate(&self, path: &str) {
        info!(path, "Navigating");
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_string());
    }
}
