//! Raw view/middleware output and its normalization into a wire-ready
//! [`ResponseDict`] (spec §3, §4.5).

use serde_json::Value;

/// Anything a view or middleware can return, modeled as a tagged variant
/// instead of an arbitrary shape (spec §9 design note).
#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    /// A bare string populates `text`; `content_type` stays `text/html`.
    Text(String),

    /// Render `template` against `context` through the external templating
    /// engine; the result populates `text`.
    Template { template: String, context: Value },

    /// Serialize `value` as JSON into `text`, with `content_type` set to
    /// `application/json`.
    Json(Value),

    /// Instruct the client to request a new URL over the persistent channel.
    Redirect(String),

    /// Instruct the client to perform a plain HTTP redirect.
    HttpRedirect(String),

    /// Serve a file response.
    File(String),

    /// The fully-general escape hatch: set any subset of the recognized
    /// fields directly.
    Raw {
        status: Option<u16>,
        content_type: Option<String>,
        text: Option<String>,
    },
}

impl From<&str> for RawResponse {
    fn from(value: &str) -> Self {
        RawResponse::Text(value.to_string())
    }
}

impl From<String> for RawResponse {
    fn from(value: String) -> Self {
        RawResponse::Text(value)
    }
}

/// The normalized response record. Exactly one of `text`, `file`,
/// `redirect`, `http_redirect` is populated on a well-formed response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDict {
    pub status: u16,
    pub content_type: String,
    pub text: String,
    pub file: String,
    pub redirect: String,
    pub http_redirect: String,
}

impl Default for ResponseDict {
    fn default() -> Self {
        Self {
            status: 200,
            content_type: "text/html".to_string(),
            text: String::new(),
            file: String::new(),
            redirect: String::new(),
            http_redirect: String::new(),
        }
    }
}

/// Something that can turn a `{template, context}` pair into HTML. The real
/// templating engine lives outside the core (spec §1); this seam is all the
/// core needs of it.
pub trait TemplatingEngine: Send + Sync {
    fn render(&self, template: &str, context: &Value) -> Result<String, TemplatingError>;
}

#[derive(Debug, thiserror::Error)]
#[error("failed to render template {template:?}: {message}")]
pub struct TemplatingError {
    pub template: String,
    pub message: String,
}

/// Normalize a [`RawResponse`] into a [`ResponseDict`]. Total over the
/// variant (spec §9): every case produces a response, even when template
/// rendering fails (logged and rendered as an empty body rather than
/// propagated, since the renderer itself has no failure mode in spec §4.5).
pub fn render(raw: &RawResponse, templating: &dyn TemplatingEngine, view_name: &str) -> ResponseDict {
    let mut response = ResponseDict::default();

    match raw {
        RawResponse::Text(text) => {
            tracing::debug!(view = view_name, "string-based view response");
            response.text = text.clone();
        }

        RawResponse::Redirect(url) => {
            response.redirect = url.clone();
        }

        RawResponse::HttpRedirect(url) => {
            response.http_redirect = url.clone();
        }

        RawResponse::Template { template, context } => {
            tracing::debug!(view = view_name, template, "template-based view response");

            match templating.render(template, context) {
                Ok(rendered) => response.text = rendered,
                Err(err) => {
                    tracing::warn!(view = view_name, %err, "template render failed, returning empty body");
                }
            }
        }

        RawResponse::Json(value) => {
            tracing::debug!(view = view_name, "json-based view response");

            response.text = serde_json::to_string(value).unwrap_or_default();
            response.content_type = "application/json".to_string();
        }

        RawResponse::File(path) => {
            response.file = path.clone();
        }

        RawResponse::Raw { status, content_type, text } => {
            if let Some(status) = status {
                response.status = *status;
            }
            if let Some(content_type) = content_type {
                response.content_type = content_type.clone();
            }
            if let Some(text) = text {
                response.text = text.clone();
            }
        }
    }

    response
}
