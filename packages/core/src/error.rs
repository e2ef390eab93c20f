//! Error and control-flow exception types shared across the core.

use viewloop_router::HandlerId;

/// Raised by a view handler or middleware to short-circuit dispatch with a
/// specific, named status rather than an arbitrary response (spec §4.4,
/// modeled on lona's `Forbidden`/`HttpRedirectResponse` exceptions).
#[derive(Debug, Clone)]
pub enum HandlerException {
    /// Equivalent to raising `lona.errors.Forbidden`: dispatch jumps
    /// straight to the 403 handler.
    Forbidden,

    /// A plain HTTP redirect, short-circuiting the rest of dispatch.
    HttpRedirect(String),
}

impl std::fmt::Display for HandlerException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerException::Forbidden => write!(f, "forbidden"),
            HandlerException::HttpRedirect(url) => write!(f, "http redirect to {url}"),
        }
    }
}

impl std::error::Error for HandlerException {}

/// Errors surfaced by the [`crate::controller::Controller`] actor.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("no route matches {path:?}")]
    NotFound { path: String },

    #[error("handler {0} is not registered")]
    UnknownHandler(HandlerId),

    #[error("the controller has already been stopped")]
    Stopped,

    #[error(transparent)]
    Scheduler(#[from] crate::scheduler::SchedulerError),

    #[error(transparent)]
    Router(#[from] viewloop_router::RouterError),
}

/// Errors surfaced by a single running [`crate::view_runtime::ViewRuntime`].
#[derive(Debug, thiserror::Error)]
pub enum ViewRuntimeError {
    #[error("view runtime already finished")]
    AlreadyFinished,

    #[error("view runtime has no window {0:?} attached")]
    UnknownWindow(String),

    #[error(transparent)]
    Scheduler(#[from] crate::scheduler::SchedulerError),
}
