//! The view runtime core: the controller, view runtimes, scheduler,
//! middleware pipeline, and response renderer that together dispatch
//! client messages to long-lived, server-resident views.

pub mod connection;
pub mod controller;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod settings;
pub mod view_runtime;

pub use connection::{Connection, ConnectionHandle, ConnectionId, UserId};
pub use controller::{Controller, ControllerHandle, LifecycleHook};
pub use error::{ControllerError, HandlerException, ViewRuntimeError};
pub use handler::{HandlerRegistry, HandlerRegistryBuilder, ViewHandler};
pub use middleware::{DispatchError, Middleware, MiddlewarePipeline};
pub use request::Request;
pub use response::{render, RawResponse, ResponseDict, TemplatingEngine, TemplatingError};
pub use scheduler::{Priority, Scheduler, SchedulerError};
pub use settings::{Settings, SettingsError};
pub use view_runtime::{Mode, StopReason, ViewContext, ViewRuntime};
