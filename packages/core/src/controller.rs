//! The view runtime controller: the dispatcher that owns every live view
//! runtime and enforces the attachment/reuse/termination policy (spec §4.6).
//!
//! Modeled as a single actor task reading a command channel — the "single
//! control-plane task" spec §5 calls for. Table mutation only ever happens
//! on that task; callers talk to it through the cheaply cloned
//! [`ControllerHandle`], the same `mpsc`-channel-plus-handle shape
//! `axum-live-view`'s `ViewHandle` uses to talk to a running view.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use viewloop_protocol::WindowId;
use viewloop_router::{HandlerId, Router};

use crate::connection::{ConnectionHandle, ConnectionId, UserId};
use crate::error::{ControllerError, HandlerException};
use crate::handler::{HandlerRegistry, ViewHandler};
use crate::middleware::{DispatchError, MiddlewarePipeline};
use crate::request::Request;
use crate::response::{render, ResponseDict, TemplatingEngine};
use crate::scheduler::{panic_message, Priority, Scheduler};
use crate::settings::Settings;
use crate::view_runtime::{dict_to_message, Mode, StopReason, ViewContext, ViewRuntime};

/// A zero-argument lifecycle callback (spec §2.5, `STARTUP_HOOKS`/
/// `SHUTDOWN_HOOKS`).
pub type LifecycleHook = Arc<dyn Fn() + Send + Sync>;

/// Invoke `handler_id`'s handler through `run_inline` (so a panic inside it
/// is captured, not propagated) and render its response; if it's absent or
/// panics too, fall through to the one hardcoded response spec §4.7 names.
/// Free function rather than a `Controller` method so the view-handler
/// panic recovery path below can share it without borrowing a `&Controller`
/// from inside a detached worker task.
async fn render_with_fallback_impl(
    handlers: &HandlerRegistry,
    templating: &dyn TemplatingEngine,
    scheduler: &Scheduler,
    handler_id: Option<&HandlerId>,
    request: Request,
) -> ResponseDict {
    if let Some(handler_id) = handler_id {
        if let Some(handler) = handlers.get(handler_id) {
            let result = scheduler
                .run_inline(Priority::High, async {
                    let mut ctx = ViewContext::standalone(request);
                    handler.handle(&mut ctx).await
                })
                .await;

            match result {
                Ok(response) => return render(&response, templating, handler_id.as_str()),
                Err(err) => tracing::error!(?err, %handler_id, "error handler itself failed"),
            }
        }
    }

    ResponseDict { status: 500, text: "Internal Server Error".to_string(), ..Default::default() }
}

/// Run a view handler inside the worker pool, catching a handler panic the
/// way spec §8 scenario 5 requires: render it through the same 404/403/500
/// fallback chain `Controller`'s own error paths use, deliver that to the
/// runtime's attached windows, and mark the runtime finished — instead of
/// leaving a silently dead runtime behind, which is all `Scheduler::spawn`'s
/// own panic capture would otherwise do.
#[allow(clippy::too_many_arguments)]
async fn run_view_catching_panics(
    runtime: Arc<ViewRuntime>,
    handler: Arc<dyn ViewHandler>,
    request: Request,
    input_rx: mpsc::UnboundedReceiver<Value>,
    handlers: HandlerRegistry,
    templating: Arc<dyn TemplatingEngine>,
    scheduler: Scheduler,
    error_500_view: Option<HandlerId>,
) {
    let fallback_request = request.clone();
    let outcome = AssertUnwindSafe(runtime.clone().run(handler, request, input_rx)).catch_unwind().await;

    if let Err(panic) = outcome {
        tracing::error!(panic = %panic_message(panic), handler = %runtime.handler, "view handler panicked");
        let dict = render_with_fallback_impl(&handlers, templating.as_ref(), &scheduler, error_500_view.as_ref(), fallback_request).await;
        runtime.finish_with(dict);
    }
}

enum ControllerCommand {
    View { connection: ConnectionHandle, window_id: WindowId, url: String, post_data: Option<Value> },
    InputEvent { connection: ConnectionHandle, window_id: WindowId, url: String, payload: Value },
    ConnectionClosed { connection_id: ConnectionId },
    RunNonInteractive { user: UserId, url: String, post_data: Option<Value>, respond_to: oneshot::Sender<ResponseDict> },
    Stop { respond_to: oneshot::Sender<()> },
}

/// A cheaply cloned handle to a running [`Controller`] actor.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<ControllerCommand>,
}

impl ControllerHandle {
    /// Dispatch an incoming `VIEW` client message (spec §4.6).
    pub fn handle_view(&self, connection: ConnectionHandle, window_id: WindowId, url: String, post_data: Option<Value>) {
        let _ = self.commands.send(ControllerCommand::View { connection, window_id, url, post_data });
    }

    /// Dispatch an incoming `INPUT_EVENT` client message (spec §4.6).
    pub fn handle_input_event(&self, connection: ConnectionHandle, window_id: WindowId, url: String, payload: Value) {
        let _ = self.commands.send(ControllerCommand::InputEvent { connection, window_id, url, payload });
    }

    /// Notify the controller that a transport disconnected, so every window
    /// it hosted can be detached (spec §5, "Clients disconnecting...").
    pub fn connection_closed(&self, connection_id: ConnectionId) {
        let _ = self.commands.send(ControllerCommand::ConnectionClosed { connection_id });
    }

    /// Run a view to completion outside the interactive channel and return
    /// its rendered response synchronously, without touching the
    /// controller's tables (spec §4.6, `run_view_non_interactive`).
    pub async fn run_view_non_interactive(&self, user: UserId, url: String, post_data: Option<Value>) -> ResponseDict {
        let (respond_to, rx) = oneshot::channel();
        if self.commands.send(ControllerCommand::RunNonInteractive { user, url, post_data, respond_to }).is_err() {
            return ResponseDict { status: 500, text: "Internal Server Error".to_string(), ..Default::default() };
        }

        rx.await.unwrap_or_else(|_| ResponseDict { status: 500, text: "Internal Server Error".to_string(), ..Default::default() })
    }

    /// Broadcast `ServerStop`: every live runtime is stopped and shutdown
    /// hooks run before this resolves (spec §5, "Cancellation").
    pub async fn stop(&self) {
        let (respond_to, rx) = oneshot::channel();
        if self.commands.send(ControllerCommand::Stop { respond_to }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Immutable, shared configuration and services the actor consults on
/// every dispatch.
struct Shared {
    settings: Arc<Settings>,
    router: Arc<Router>,
    handlers: HandlerRegistry,
    middleware: MiddlewarePipeline,
    scheduler: Scheduler,
    templating: Arc<dyn TemplatingEngine>,
    shutdown_hooks: Vec<LifecycleHook>,
}

/// The tables the dispatcher owns exclusively (spec §3, "Controller
/// tables"). Never shared outside the actor task.
#[derive(Default)]
struct Tables {
    single_user_views: FxHashMap<(UserId, usize), Arc<ViewRuntime>>,
    multi_user_views: FxHashMap<usize, Arc<ViewRuntime>>,
    window_attachments: FxHashMap<(ConnectionId, WindowId), Arc<ViewRuntime>>,
}

/// The view runtime controller.
pub struct Controller {
    shared: Shared,
    tables: Tables,
}

impl Controller {
    /// Boot the controller: start every `multi_user` route's runtime (spec
    /// §4.6 bootstrap, I6) and run startup hooks, then return a handle and
    /// spawn the actor loop.
    pub fn start(
        settings: Arc<Settings>,
        router: Arc<Router>,
        handlers: HandlerRegistry,
        middleware: MiddlewarePipeline,
        scheduler: Scheduler,
        templating: Arc<dyn TemplatingEngine>,
        startup_hooks: Vec<LifecycleHook>,
        shutdown_hooks: Vec<LifecycleHook>,
    ) -> ControllerHandle {
        let shared = Shared { settings, router, handlers, middleware, scheduler, templating, shutdown_hooks };
        let mut controller = Controller { shared, tables: Tables::default() };

        controller.bootstrap_multi_user_views();

        for hook in &startup_hooks {
            hook();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    ControllerCommand::View { connection, window_id, url, post_data } => {
                        controller.handle_view(connection, window_id, url, post_data).await;
                    }
                    ControllerCommand::InputEvent { connection, window_id, url, payload } => {
                        controller.handle_input_event(connection, window_id, url, payload);
                    }
                    ControllerCommand::ConnectionClosed { connection_id } => {
                        controller.handle_connection_closed(connection_id);
                    }
                    ControllerCommand::RunNonInteractive { user, url, post_data, respond_to } => {
                        let response = controller.run_view_non_interactive(user, url, post_data).await;
                        let _ = respond_to.send(response);
                    }
                    ControllerCommand::Stop { respond_to } => {
                        controller.shutdown().await;
                        let _ = respond_to.send(());
                        break;
                    }
                }
            }
        });

        ControllerHandle { commands: tx }
    }

    fn bootstrap_multi_user_views(&mut self) {
        for (route_id, route) in self.shared.router.routes().iter().enumerate() {
            if !route.multi_user() {
                continue;
            }

            let (runtime, input_rx) = ViewRuntime::new(
                route.handler().clone(),
                route_id,
                Mode::MultiUser,
                route.pattern().to_string(),
                Default::default(),
                self.shared.templating.clone(),
            );

            self.tables.multi_user_views.insert(route_id, runtime.clone());

            let Some(handler) = self.shared.handlers.get(route.handler()) else {
                tracing::error!(handler = %route.handler(), "multi-user route handler not registered");
                continue;
            };

            let request = runtime.gen_multi_user_request();
            let priority = self.shared.settings.default_multi_user_view_priority;
            let runtime_for_task = runtime.clone();
            let handlers = self.shared.handlers.clone();
            let templating = self.shared.templating.clone();
            let scheduler_for_fallback = self.shared.scheduler.clone();
            let error_500_view = self.shared.settings.error_500_view().cloned();

            self.shared.scheduler.spawn(priority, async move {
                run_view_catching_panics(runtime_for_task, handler, request, input_rx, handlers, templating, scheduler_for_fallback, error_500_view).await;
            });
        }
    }

    #[tracing::instrument(skip_all, fields(window_id, %url))]
    async fn handle_view(&mut self, connection: ConnectionHandle, window_id: WindowId, url: String, post_data: Option<Value>) {
        let user = connection.user();
        let connection_id = connection.id();

        // Step 1: detach the window from any previous runtime. Scoped to
        // this one window — `remove_window`, not `remove_connection` — so a
        // second window the same connection has open on that runtime (e.g.
        // two browser tabs attached to the same daemon) stays attached;
        // using the full-connection sweep here would silently drop it from
        // `previous.windows` while `window_attachments` still pointed the
        // other window's key at it.
        if let Some(previous) = self.tables.window_attachments.remove(&(connection_id, window_id)) {
            previous.remove_window(connection_id, window_id);
        }

        // Step 2: resolve.
        let Some(resolved) = self.shared.router.resolve(&url) else {
            let dict = self.render_error_404(&url).await;
            connection.send(dict_to_message(window_id, &dict));
            return;
        };

        let route_id = resolved.route_id;
        let handler_id = resolved.route.handler().clone();
        let match_info = resolved.match_info;

        // Step 3: http_pass_through / non-interactive routes never touch a runtime.
        if resolved.route.http_pass_through() || !resolved.route.interactive() {
            connection.send(viewloop_protocol::ServerMessage::http_redirect(window_id, url.clone(), url));
            return;
        }

        // Step 4: transient request for middleware visibility.
        let transient_request = Request {
            user: user.clone(),
            url: url.clone(),
            match_info: match_info.clone(),
            post_data: post_data.clone(),
            connection: Some(connection.clone()),
            window_id: Some(window_id),
            handler: handler_id.clone(),
        };

        // Step 5: middleware.
        match self
            .shared
            .middleware
            .dispatch(&self.shared.scheduler, self.shared.settings.request_middleware_priority, &transient_request, &handler_id)
            .await
        {
            Ok(Some(raw)) => {
                let dict = render(&raw, self.shared.templating.as_ref(), handler_id.as_str());
                connection.send(dict_to_message(window_id, &dict));
                return;
            }
            Ok(None) => {}
            Err(DispatchError::Handler(HandlerException::Forbidden)) => {
                let dict = self.render_error_403(&transient_request).await;
                connection.send(dict_to_message(window_id, &dict));
                return;
            }
            Err(DispatchError::Handler(HandlerException::HttpRedirect(target))) => {
                connection.send(viewloop_protocol::ServerMessage::http_redirect(window_id, target, url));
                return;
            }
            Err(err @ DispatchError::Scheduler(_)) => {
                let dict = self.render_error_500(&transient_request, &err).await;
                connection.send(dict_to_message(window_id, &dict));
                return;
            }
        }

        // Step 6: reuse policy.
        let key = (user.clone(), route_id);

        if let Some(existing) = self.tables.single_user_views.get(&key).cloned() {
            if existing.is_daemon() && !existing.is_finished() {
                existing.add_connection(connection.clone(), window_id);
                existing.set_url(url.clone());
                self.tables.window_attachments.insert((connection_id, window_id), existing);
                return;
            }

            existing.stop(StopReason::Explicit);
            self.tables.single_user_views.remove(&key);
        }

        if let Some(multi) = self.tables.multi_user_views.get(&route_id).cloned() {
            multi.add_connection(connection.clone(), window_id);
            self.tables.window_attachments.insert((connection_id, window_id), multi);
            return;
        }

        // Step 7: install and start.
        let Some(handler) = self.shared.handlers.get(&handler_id) else {
            let dict = self.render_error_500(&transient_request, &ControllerError::UnknownHandler(handler_id.clone())).await;
            connection.send(dict_to_message(window_id, &dict));
            return;
        };

        let (runtime, input_rx) =
            ViewRuntime::new(handler_id.clone(), route_id, Mode::SingleUser, url.clone(), match_info, self.shared.templating.clone());

        runtime.add_connection(connection.clone(), window_id);
        self.tables.single_user_views.insert(key, runtime.clone());
        self.tables.window_attachments.insert((connection_id, window_id), runtime.clone());

        let request = runtime.gen_request(connection, window_id, post_data);
        let priority = self.shared.settings.default_view_priority;
        let runtime_for_task = runtime;
        let handlers = self.shared.handlers.clone();
        let templating = self.shared.templating.clone();
        let scheduler_for_fallback = self.shared.scheduler.clone();
        let error_500_view = self.shared.settings.error_500_view().cloned();

        self.shared.scheduler.spawn(priority, async move {
            run_view_catching_panics(runtime_for_task, handler, request, input_rx, handlers, templating, scheduler_for_fallback, error_500_view).await;
        });
    }

    fn handle_input_event(&mut self, connection: ConnectionHandle, window_id: WindowId, url: String, payload: Value) {
        // Route by the window's current attachment rather than re-deriving
        // the target from `(user, url)`: that would only ever find
        // `single_user_views`, silently dropping every input event destined
        // for a `multi_user_views` runtime, which shares one runtime across
        // many windows that don't each own a `(user, route)` table slot.
        match self.tables.window_attachments.get(&(connection.id(), window_id)) {
            Some(runtime) => runtime.handle_input_event(payload),
            None => tracing::debug!(%url, "dropping input event for unknown view"),
        }
    }

    fn handle_connection_closed(&mut self, connection_id: ConnectionId) {
        let keys: Vec<_> =
            self.tables.window_attachments.keys().filter(|(cid, _)| *cid == connection_id).cloned().collect();

        for key in keys {
            if let Some(runtime) = self.tables.window_attachments.remove(&key) {
                runtime.remove_connection(connection_id);
            }
        }
    }

    /// Identical to steps 4-7 of `handle_view`, but with no window to
    /// attach and the response returned synchronously instead of pushed.
    /// Deliberately does not touch `single_user_views`/`multi_user_views`
    /// (confirmed against the original Python `run_view_non_interactive`,
    /// which never reads or writes the controller's tables).
    async fn run_view_non_interactive(&mut self, user: UserId, url: String, post_data: Option<Value>) -> ResponseDict {
        let Some(resolved) = self.shared.router.resolve(&url) else {
            return self.render_error_404(&url).await;
        };

        let handler_id = resolved.route.handler().clone();
        let match_info = resolved.match_info;

        let transient_request = Request {
            user: user.clone(),
            url: url.clone(),
            match_info: match_info.clone(),
            post_data: post_data.clone(),
            connection: None,
            window_id: None,
            handler: handler_id.clone(),
        };

        match self
            .shared
            .middleware
            .dispatch(&self.shared.scheduler, self.shared.settings.request_middleware_priority, &transient_request, &handler_id)
            .await
        {
            Ok(Some(raw)) => return render(&raw, self.shared.templating.as_ref(), handler_id.as_str()),
            Ok(None) => {}
            Err(DispatchError::Handler(HandlerException::Forbidden)) => return self.render_error_403(&transient_request).await,
            Err(DispatchError::Handler(HandlerException::HttpRedirect(target))) => {
                return ResponseDict { http_redirect: target, ..Default::default() };
            }
            Err(err @ DispatchError::Scheduler(_)) => return self.render_error_500(&transient_request, &err).await,
        }

        let Some(handler) = self.shared.handlers.get(&handler_id) else {
            return self.render_error_404(&url).await;
        };

        let (runtime, input_rx) = ViewRuntime::new(
            handler_id.clone(),
            resolved.route_id,
            Mode::NonInteractive,
            url,
            match_info,
            self.shared.templating.clone(),
        );

        let request = runtime.gen_non_interactive_request(user, post_data);
        let priority = self.shared.settings.default_view_priority;

        match self.shared.scheduler.schedule(priority, {
            let runtime = runtime.clone();
            async move {
                runtime.clone().run(handler, request, input_rx).await;
                runtime
            }
        }).await {
            Ok(runtime) => runtime.current_response().unwrap_or_default(),
            Err(err) => self.render_error_500(&transient_request, &err).await,
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("controller shutting down");

        let runtimes: Vec<Arc<ViewRuntime>> = self
            .tables
            .single_user_views
            .values()
            .cloned()
            .chain(self.tables.multi_user_views.values().cloned())
            .collect();

        for runtime in &runtimes {
            runtime.stop(StopReason::ServerStop);
        }

        // `stop` is a `watch::Sender::send`: it returns as soon as the value
        // is published, not once the runtime's task has woken up and run
        // `finish_with`. Hard-aborting the pool immediately after would race
        // any task that hasn't yet reached a `tokio::select!` against
        // `stop_rx.changed()` (`next_input_event`/`sleep`) — it gets killed
        // before `is_finished` is ever set, which spec §8's P6 ("is_finished
        // holds for every runtime within a bounded wake-up delay") forbids.
        // Give every runtime a bounded window to wake up and finish on its
        // own before the scheduler's `abort_all` becomes the backstop.
        self.await_runtimes_finished(&runtimes, Duration::from_secs(5)).await;

        self.shared.scheduler.stop().await;

        for hook in &self.shared.shutdown_hooks {
            hook();
        }
    }

    /// Poll `runtimes` for `is_finished()` until every one reports true or
    /// `timeout` elapses, whichever comes first. A runtime a stop signal
    /// never reaches in time (stuck handler, no cooperative suspension
    /// point) is logged and left for the scheduler's hard abort.
    async fn await_runtimes_finished(&self, runtimes: &[Arc<ViewRuntime>], timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if runtimes.iter().all(|runtime| runtime.is_finished()) {
                return;
            }

            if tokio::time::Instant::now() >= deadline {
                let stuck = runtimes.iter().filter(|runtime| !runtime.is_finished()).count();
                tracing::warn!(stuck, "timed out waiting for runtimes to finish during shutdown; aborting them");
                return;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Invoke the primary `on_404` handler; on failure or absence, fall
    /// back; if the fallback also fails, a hardcoded response (spec §4.7).
    async fn render_error_404(&self, url: &str) -> ResponseDict {
        let request = Request {
            user: UserId::anonymous(),
            url: url.to_string(),
            match_info: Default::default(),
            post_data: None,
            connection: None,
            window_id: None,
            handler: self.shared.settings.error_404_view().cloned().unwrap_or_else(|| HandlerId::new("core::error_404")),
        };

        self.render_with_fallback(self.shared.settings.error_404_view(), request).await
    }

    async fn render_error_403(&self, request: &Request) -> ResponseDict {
        self.render_with_fallback(self.shared.settings.error_403_view(), request.clone()).await
    }

    async fn render_error_500(&self, request: &Request, error: &impl std::fmt::Debug) -> ResponseDict {
        tracing::error!(?error, "handler/middleware failed");
        self.render_with_fallback(self.shared.settings.error_500_view(), request.clone()).await
    }

    /// Invoke `handler_id`'s handler; a panic inside it (the "fallback also
    /// fails" case of spec §4.7) is captured by `run_inline`'s own
    /// `catch_unwind`, not propagated, and falls through to the one hardcoded
    /// response spec §4.7 names: `status: 500, "Internal Server Error"`,
    /// regardless of which of 404/403/500 reached this point.
    async fn render_with_fallback(&self, handler_id: Option<&HandlerId>, request: Request) -> ResponseDict {
        render_with_fallback_impl(&self.shared.handlers, self.shared.templating.as_ref(), &self.shared.scheduler, handler_id, request).await
    }
}
