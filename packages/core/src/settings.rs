//! Typed, TOML-deserializable runtime configuration (spec §2.2/§6), with
//! defaults carried over from lona's `default_settings.py`.

use std::path::Path;

use serde::Deserialize;

use crate::scheduler::Priority;
use viewloop_router::HandlerId;

fn default_max_workers() -> usize {
    10
}

fn default_priority_normal() -> Priority {
    Priority::Normal
}

fn default_priority_high() -> Priority {
    Priority::High
}

/// Runtime configuration for a [`crate::controller::Controller`].
///
/// Deserializable from TOML so a deployment can ship a config file
/// alongside its handler registrations, the way lona ships a Python
/// settings module.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Size of the bounded worker pool (spec §4.2). lona's
    /// `MAX_WORKERS` default is 10.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Priority at which newly started single-user view handlers are
    /// scheduled.
    #[serde(default = "default_priority_normal")]
    pub default_view_priority: Priority,

    /// Priority at which multi-user view handlers are scheduled.
    #[serde(default = "default_priority_normal")]
    pub default_multi_user_view_priority: Priority,

    /// Priority at which request middleware is scheduled; lona runs
    /// middleware ahead of view dispatch, so it defaults higher.
    #[serde(default = "default_priority_high")]
    pub request_middleware_priority: Priority,

    /// Handler invoked to render the initial, non-interactive page shell
    /// the browser bootstraps from, before the persistent channel opens.
    pub core_frontend_view: Option<HandlerId>,

    /// Deployment override of [`Settings::core_frontend_view`].
    pub frontend_view: Option<HandlerId>,

    /// Handler invoked when no route matches a request (spec §4.6).
    pub error_404_view: Option<HandlerId>,

    /// Fallback used only if `error_404_view` is unset or itself fails.
    pub core_error_404_view: Option<HandlerId>,

    /// Handler invoked when middleware or a view raises `Forbidden`
    /// (spec §4.4, modeled on `CORE_ERROR_403_VIEW`/`ERROR_403_VIEW`).
    pub error_403_view: Option<HandlerId>,

    pub core_error_403_view: Option<HandlerId>,

    /// Handler invoked when a view handler panics (spec §4.7).
    pub error_500_view: Option<HandlerId>,

    pub core_error_500_view: Option<HandlerId>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            default_view_priority: Priority::Normal,
            default_multi_user_view_priority: Priority::Normal,
            request_middleware_priority: Priority::High,
            core_frontend_view: None,
            frontend_view: None,
            error_404_view: None,
            core_error_404_view: None,
            error_403_view: None,
            core_error_403_view: None,
            error_500_view: None,
            core_error_500_view: None,
        }
    }
}

impl Settings {
    /// Read and parse a TOML settings file. Missing keys fall back to
    /// [`Settings::default`], mirroring how lona's settings module layers
    /// user overrides on top of `default_settings.py`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| SettingsError::Read { path: path.display().to_string(), source })?;

        toml::from_str(&raw).map_err(|source| SettingsError::Parse { path: path.display().to_string(), source })
    }

    /// Resolve the frontend view to use, preferring the deployment
    /// override over the built-in default (spec §2.2 / lona's
    /// `FRONTEND_VIEW` precedence over `CORE_FRONTEND_VIEW`).
    pub fn frontend_view(&self) -> Option<&HandlerId> {
        self.frontend_view.as_ref().or(self.core_frontend_view.as_ref())
    }

    pub fn error_404_view(&self) -> Option<&HandlerId> {
        self.error_404_view.as_ref().or(self.core_error_404_view.as_ref())
    }

    pub fn error_403_view(&self) -> Option<&HandlerId> {
        self.error_403_view.as_ref().or(self.core_error_403_view.as_ref())
    }

    pub fn error_500_view(&self) -> Option<&HandlerId> {
        self.error_500_view.as_ref().or(self.core_error_500_view.as_ref())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("failed to parse settings file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
}
