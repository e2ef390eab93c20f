//! A runnable shell around `viewloop-core`: an axum HTTP/WebSocket listener
//! and a minimal templating engine, wired to the same trait seams a real
//! deployment would implement itself (spec §1, §3 Non-goals).

pub mod app;
pub mod telemetry;
pub mod templating;
pub mod transport;

pub use app::{build_app, AppState};
