//! One live view instance: state, attached windows, and the cooperative
//! suspension points a handler runs through (spec §4.3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use viewloop_protocol::{ServerMessage, WindowId};
use viewloop_router::{HandlerId, MatchInfo};

use crate::connection::{ConnectionHandle, ConnectionId, UserId};
use crate::handler::ViewHandler;
use crate::request::Request;
use crate::response::{render, RawResponse, ResponseDict, TemplatingEngine};

/// Which of the three ways a view can be started (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    SingleUser,
    MultiUser,
    NonInteractive,
}

/// Why a runtime was asked to stop (spec §5, "Cancellation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ServerStop,
    DisconnectedByAllClients,
    Explicit,
}

#[derive(Clone)]
struct WindowEntry {
    connection: ConnectionHandle,
    window_id: WindowId,
}

/// One live view instance.
///
/// `windows`, `current_response` and `url` use a plain sync mutex: every
/// critical section is a handful of field reads/writes with no `.await`
/// inside it, so there's nothing a blocking lock could stall behind.
pub struct ViewRuntime {
    pub handler: HandlerId,
    pub route_id: usize,
    pub mode: Mode,
    pub match_info: MatchInfo,

    templating: Arc<dyn TemplatingEngine>,

    url: Mutex<String>,
    is_daemon: AtomicBool,
    is_finished: AtomicBool,
    windows: Mutex<Vec<WindowEntry>>,
    current_response: Mutex<Option<ResponseDict>>,

    input_tx: mpsc::UnboundedSender<Value>,
    stop_tx: watch::Sender<Option<StopReason>>,
}

impl ViewRuntime {
    pub fn new(
        handler: HandlerId,
        route_id: usize,
        mode: Mode,
        url: String,
        match_info: MatchInfo,
        templating: Arc<dyn TemplatingEngine>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Value>) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(None);

        let runtime = Arc::new(Self {
            handler,
            route_id,
            mode,
            match_info,
            templating,
            url: Mutex::new(url),
            is_daemon: AtomicBool::new(false),
            is_finished: AtomicBool::new(false),
            windows: Mutex::new(Vec::new()),
            current_response: Mutex::new(None),
            input_tx,
            stop_tx,
        });

        (runtime, input_rx)
    }

    pub fn url(&self) -> String {
        self.url.lock().clone()
    }

    pub fn set_url(&self, url: String) {
        *self.url.lock() = url;
    }

    pub fn is_daemon(&self) -> bool {
        self.is_daemon.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.is_finished.load(Ordering::Acquire)
    }

    pub fn current_response(&self) -> Option<ResponseDict> {
        self.current_response.lock().clone()
    }

    pub fn window_count(&self) -> usize {
        self.windows.lock().len()
    }

    /// Build a `Request` bound to a specific originating window (spec §4.3,
    /// `gen_request`).
    pub fn gen_request(&self, connection: ConnectionHandle, window_id: WindowId, post_data: Option<Value>) -> Request {
        Request {
            user: connection.user(),
            url: self.url(),
            match_info: self.match_info.clone(),
            post_data,
            connection: Some(connection),
            window_id: Some(window_id),
            handler: self.handler.clone(),
        }
    }

    /// Build a `Request` for a server-started multi-user view, which has no
    /// originating connection (spec §4.3, `gen_multi_user_request`).
    pub fn gen_multi_user_request(&self) -> Request {
        Request {
            user: UserId::anonymous(),
            url: self.url(),
            match_info: self.match_info.clone(),
            post_data: None,
            connection: None,
            window_id: None,
            handler: self.handler.clone(),
        }
    }

    /// Build a `Request` for non-interactive (HTTP-only) dispatch, which
    /// has a user but no window to attach.
    pub fn gen_non_interactive_request(&self, user: UserId, post_data: Option<Value>) -> Request {
        Request {
            user,
            url: self.url(),
            match_info: self.match_info.clone(),
            post_data,
            connection: None,
            window_id: None,
            handler: self.handler.clone(),
        }
    }

    /// Attach a window. If the view already has a current response, it's
    /// sent to the new window immediately (spec §4.3, `add_connection`).
    pub fn add_connection(&self, connection: ConnectionHandle, window_id: WindowId) {
        self.windows.lock().push(WindowEntry { connection: connection.clone(), window_id });

        if let Some(response) = self.current_response() {
            connection.send(dict_to_message(window_id, &response));
        }
    }

    /// Detach every window belonging to `connection_id` — used when the
    /// connection itself has gone away (spec §5, "clients disconnecting"),
    /// so there's no single window left to preserve. lona's own
    /// `remove_connection` always sweeps every window of the connection too
    /// (`view_runtime_controller.py`'s `remove_connection` hardcodes
    /// `window_id=None` on the call into the view regardless of the
    /// `window_id` it was itself given), but that's safe only because the
    /// Python controller has no separate per-window attachment table to
    /// desync against. Returns `true` if this drops the runtime to zero
    /// attached windows.
    pub fn remove_connection(&self, connection_id: ConnectionId) -> bool {
        let mut windows = self.windows.lock();
        windows.retain(|entry| entry.connection.id() != connection_id);
        let empty = windows.is_empty();
        drop(windows);

        if empty && !self.is_daemon() {
            self.stop(StopReason::DisconnectedByAllClients);
        }

        empty
    }

    /// Detach exactly one `(connection_id, window_id)` window — used when
    /// re-dispatching that single window to a new runtime (spec §4.6 step
    /// 1), so a second window the same connection has open on this runtime
    /// is left attached. Unlike `remove_connection`, this never needs to be
    /// a full sweep: the controller's `window_attachments` table (which
    /// lona's Python controller doesn't have) already tracks exactly one
    /// runtime per window, so detaching by that same key keeps both tables
    /// consistent. Returns `true` if this drops the runtime to zero
    /// attached windows.
    pub fn remove_window(&self, connection_id: ConnectionId, window_id: WindowId) -> bool {
        let mut windows = self.windows.lock();
        windows.retain(|entry| !(entry.connection.id() == connection_id && entry.window_id == window_id));
        let empty = windows.is_empty();
        drop(windows);

        if empty && !self.is_daemon() {
            self.stop(StopReason::DisconnectedByAllClients);
        }

        empty
    }

    /// Enqueue an input event and wake the view's input loop (spec §4.3,
    /// `handle_input_event`).
    pub fn handle_input_event(&self, payload: Value) {
        let _ = self.input_tx.send(payload);
    }

    /// Normalize and deliver a response produced outside the handler (e.g.
    /// a middleware short-circuit attributed to this runtime) to the given
    /// windows, or to every attached window if none are given.
    pub fn handle_raw_response_dict(&self, raw: &RawResponse, windows: Option<&[(ConnectionHandle, WindowId)]>) {
        let dict = render(raw, self.templating.as_ref(), self.handler.as_str());
        self.current_response.lock().replace(dict.clone());

        match windows {
            Some(targets) => {
                for (connection, window_id) in targets {
                    connection.send(dict_to_message(*window_id, &dict));
                }
            }
            None => self.deliver(&dict),
        }
    }

    fn deliver(&self, dict: &ResponseDict) {
        for entry in self.windows.lock().iter() {
            entry.connection.send(dict_to_message(entry.window_id, dict));
        }
    }

    /// Cooperative termination: signal the handler's suspension points
    /// (`sleep`, input wait) to unblock. `is_finished` is set once the
    /// handler actually returns, not by this call (spec §4.3).
    pub fn stop(&self, reason: StopReason) {
        let _ = self.stop_tx.send(Some(reason));
    }

    /// Deliver an already-rendered response and mark the runtime finished,
    /// without having run a handler to produce it. Used by the controller's
    /// panic-recovery path (spec §8 scenario 5) when the handler itself
    /// panicked before `run` could render and deliver its own response.
    pub(crate) fn finish_with(&self, dict: ResponseDict) {
        self.current_response.lock().replace(dict.clone());
        self.deliver(&dict);
        self.is_finished.store(true, Ordering::Release);
    }

    /// Run `handler` to completion, then render and dispatch its final
    /// response and mark the runtime finished. Handler return *always*
    /// finishes the runtime, independent of `is_daemon`: daemon status only
    /// freezes the zero-windows-after-detach path in `remove_connection`.
    pub async fn run(
        self: Arc<Self>,
        handler: Arc<dyn ViewHandler>,
        request: Request,
        input_rx: mpsc::UnboundedReceiver<Value>,
    ) {
        let mut ctx = ViewContext {
            runtime: Some(self.clone()),
            input_events: input_rx,
            stop_rx: self.stop_tx.subscribe(),
            request,
        };

        tracing::debug!(handler = %self.handler, "view handler starting");

        let response = handler.handle(&mut ctx).await;
        let dict = render(&response, self.templating.as_ref(), self.handler.as_str());
        self.finish_with(dict);

        tracing::debug!(handler = %self.handler, "view handler finished");
    }
}

pub(crate) fn dict_to_message(window_id: WindowId, dict: &ResponseDict) -> ServerMessage {
    if !dict.http_redirect.is_empty() {
        ServerMessage::http_redirect(window_id, dict.http_redirect.clone(), dict.http_redirect.clone())
    } else {
        ServerMessage::Response {
            window_id,
            status: dict.status,
            content_type: dict.content_type.clone(),
            text: dict.text.clone(),
            file: dict.file.clone(),
            redirect: dict.redirect.clone(),
        }
    }
}

/// The interface a [`ViewHandler`] runs against: how it observes input
/// events, suspends cooperatively, pushes intermediate responses, and
/// opts into daemon survival.
pub struct ViewContext {
    runtime: Option<Arc<ViewRuntime>>,
    input_events: mpsc::UnboundedReceiver<Value>,
    stop_rx: watch::Receiver<Option<StopReason>>,
    request: Request,
}

impl ViewContext {
    /// Build a context with no backing runtime, for one-shot error-handler
    /// invocations (spec §4.7) that never push intermediate responses or
    /// wait on input.
    pub fn standalone(request: Request) -> Self {
        let (_tx, input_events) = mpsc::unbounded_channel();
        let (_tx, stop_rx) = watch::channel(None);
        Self { runtime: None, input_events, stop_rx, request }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Mark this view as surviving the disconnection of its last window.
    pub fn daemonize(&self) {
        if let Some(runtime) = &self.runtime {
            runtime.is_daemon.store(true, Ordering::Release);
        }
    }

    /// Push an intermediate response to every currently attached window,
    /// without finishing the runtime. A no-op outside a runtime-bound
    /// context.
    pub fn push(&self, raw: RawResponse) {
        if let Some(runtime) = &self.runtime {
            runtime.handle_raw_response_dict(&raw, None);
        }
    }

    /// Await the next queued input event, or `None` if the runtime is
    /// stopping before one arrives.
    pub async fn next_input_event(&mut self) -> Option<Value> {
        tokio::select! {
            event = self.input_events.recv() => event,
            _ = self.stop_rx.changed() => None,
        }
    }

    /// Sleep for `duration`, or wake early if the runtime is asked to stop.
    /// Returns `true` if the full duration elapsed, `false` if interrupted —
    /// the cooperative-cancellation suspension point spec §5 calls `view.sleep`.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.stop_rx.changed() => false,
        }
    }

    /// Whether a stop has been signaled, without blocking.
    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.stop_rx.borrow()
    }
}
