//! The message envelope exchanged between a viewloop server and its clients.
//!
//! Everything here is deliberately small: the wire format is a thin,
//! serde-driven shell around the three message shapes a client and server
//! need to agree on. Transport framing (the WebSocket/HTTP layer itself) and
//! HTML patch encoding live outside this crate.

use serde::{Deserialize, Serialize};

/// A window identifier: one logical browser tab within a connection.
pub type WindowId = u64;

/// The method of an incoming client message.
///
/// Kept as a small integer code rather than a string so it round-trips
/// cheaply; the exact discriminants only need to be stable between the two
/// ends of a single deployment, not across the wider ecosystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Method {
    /// The client is requesting a view at `url`, either as its first
    /// navigation or as a follow-up navigation within an existing window.
    View = 1,

    /// The client is delivering an input event to the view currently
    /// attached to `window_id`.
    InputEvent = 2,
}

/// A message sent from a client to the server over the persistent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub method: Method,
    pub window_id: WindowId,
    pub url: String,

    /// `VIEW`: optional POST-style form data. `INPUT_EVENT`: the event
    /// payload. Left untyped because its shape is owned by view code, not
    /// by the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// A message sent from the server back to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A normalized view response addressed to one window.
    Response {
        window_id: WindowId,
        status: u16,
        content_type: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        text: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        file: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        redirect: String,
    },

    /// Tell the client to navigate itself via a normal HTTP redirect instead
    /// of staying on the persistent channel — emitted for routes that are
    /// `http_pass_through` or not `interactive` (spec §4.6 step 3).
    HttpRedirect {
        window_id: WindowId,
        target_url: String,
        current_url: String,
    },
}

impl ServerMessage {
    /// Build the `HTTP_REDIRECT` envelope lona's `encode_http_redirect` sends
    /// for non-interactive / pass-through routes.
    pub fn http_redirect(window_id: WindowId, target_url: impl Into<String>, current_url: impl Into<String>) -> Self {
        ServerMessage::HttpRedirect {
            window_id,
            target_url: target_url.into(),
            current_url: current_url.into(),
        }
    }

    /// Serialize to the JSON-over-WebSocket wire form.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage always serializes")
    }
}

impl ClientMessage {
    /// Parse an inbound WebSocket text frame.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
