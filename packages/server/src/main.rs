//! Demo entry point: wires a `Settings`, a two-route `Router`, a tiny
//! `HandlerRegistry`, and the view runtime `Controller` to a real
//! WebSocket listener. Intended as a runnable example, not a production
//! deployment surface.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use viewloop_core::{
    Controller, FnHandler, HandlerRegistry, MiddlewarePipeline, RawResponse, Scheduler, Settings, ViewContext, ViewHandler,
};
use viewloop_router::{HandlerId, Route, Router};
use viewloop_server::templating::StringTemplates;
use viewloop_server::{build_app, telemetry, AppState};

struct IndexView;

#[async_trait]
impl ViewHandler for IndexView {
    async fn handle(&self, ctx: &mut ViewContext) -> RawResponse {
        RawResponse::Template {
            template: "hello, {{user}}".to_string(),
            context: serde_json::json!({ "user": ctx.request().user.as_str() }),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let settings_path = std::env::args().nth(1);
    let settings = match settings_path {
        Some(path) => Settings::load(&path).with_context(|| format!("loading settings from {path}"))?,
        None => Settings::default(),
    };

    let router = Router::new(vec![
        Route::builder("/", HandlerId::new("index")).build(),
        Route::builder("/ping", HandlerId::new("ping")).build(),
    ])
    .context("building router")?;

    let handlers = HandlerRegistry::builder()
        .register(HandlerId::new("index"), Arc::new(IndexView))
        .register(HandlerId::new("ping"), Arc::new(FnHandler::new(|_ctx: &mut ViewContext| async { RawResponse::Text("pong".to_string()) })))
        .build();

    let scheduler = Scheduler::new(settings.max_workers);

    let controller = Controller::start(
        Arc::new(settings),
        Arc::new(router),
        handlers,
        MiddlewarePipeline::default(),
        scheduler,
        Arc::new(StringTemplates),
        Vec::new(),
        Vec::new(),
    );

    let app = build_app(AppState { controller });

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.context("binding listener")?;
    tracing::info!("viewloop-server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await.context("serving")?;

    Ok(())
}
