//! User-visible side effects of incoming events.
//!
//! Sound, toasts and read-model invalidation belong to the rendering layer;
//! the core only talks to them through these traits. Every call is
//! best-effort: callers log failures and carry on.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::SideEffectError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastVariant {
    Default,
    Success,
    Info,
}

/// "Go to the relevant screen" button on a toast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToastAction {
    pub label: String,
    pub route: String,
}

/// A dismissable visual notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Toast {
    pub title: String,
    pub description: String,
    pub variant: ToastVariant,
    pub duration_ms: u64,
    pub action: Option<ToastAction>,
}

pub trait SoundPlayer: Send + Sync {
    fn play(&self, path: &str) -> Result<(), SideEffectError>;
}

pub trait Toaster: Send + Sync {
    fn show(&self, toast: &Toast) -> Result<(), SideEffectError>;
}

/// Invalidates a cached read-model so open list views refetch it.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, key: &str) -> Result<(), SideEffectError>;
}

/// The set of side-effect sinks handed to the notification router.
#[derive(Clone)]
pub struct SideEffects {
    pub sound: Arc<dyn SoundPlayer>,
    pub toaster: Arc<dyn Toaster>,
    pub cache: Arc<dyn CacheInvalidator>,
}

impl SideEffects {
    /// Side effects that only write log lines (headless use).
    pub fn logging() -> Self {
        let sink = Arc::new(LogEffects);
        Self {
            sound: sink.clone(),
            toaster: sink.clone(),
            cache: sink,
        }
    }
}

/// Log-only implementation of every side-effect trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEffects;

impl SoundPlayer for LogEffects {
    fn play(&self, path: &str) -> Result<(), SideEffectError> {
        debug!(path, "Playing notification sound");
        Ok(())
    }
}

impl Toaster for LogEffects {
    fn show(&self, toast: &Toast) -> Result<(), SideEffectError> {
        info!(
            title = %toast.title,
            description = %toast.description,
            route = toast.action.as_ref().map(|a| a.route.as_str()),
            "Toast"
        );
        Ok(())
    }
}

impl CacheInvalidator for LogEffects {
    fn invalidate(&self, key: &str) -> Result<(), SideEffectError> {
        info!(key, "Invalidating cached read-model");
        Ok(())
    }
}
