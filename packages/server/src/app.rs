//! Builds the axum [`axum::Router`] that upgrades `/ws` to a viewloop
//! connection. Everything else about running a server — TLS, static
//! assets, the admin shell — is a real deployment's problem, not this
//! crate's (spec §3 Non-goals).

use std::collections::HashMap;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;

use viewloop_core::{ControllerHandle, UserId};

use crate::transport;

#[derive(Clone)]
pub struct AppState {
    pub controller: ControllerHandle,
}

/// Build the axum app. A real deployment authenticates the upgrade request
/// itself and passes the resulting identity in; this one reads an optional
/// `?user=` query parameter and otherwise falls back to
/// [`UserId::anonymous`].
pub fn build_app(state: AppState) -> axum::Router {
    axum::Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>, Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let user = params.get("user").cloned().map(UserId::new).unwrap_or_else(UserId::anonymous);

    ws.on_upgrade(move |socket| transport::serve(socket, user, state.controller))
}
