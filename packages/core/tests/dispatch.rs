//! Integration-level coverage of the controller's dispatch policy, built on
//! an in-memory fake `Connection` instead of a real socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::Value;

use viewloop_core::{
    Connection, ConnectionHandle, ConnectionId, Controller, HandlerRegistry, Middleware, MiddlewarePipeline, RawResponse,
    Scheduler, Settings, TemplatingEngine, TemplatingError, UserId, ViewContext, ViewHandler,
};
use viewloop_protocol::ServerMessage;
use viewloop_router::{HandlerId, Route, Router};

#[derive(Debug)]
struct FakeConnection {
    id: ConnectionId,
    user: UserId,
    sent: Mutex<Vec<ServerMessage>>,
}

impl FakeConnection {
    fn new(user: &str) -> Arc<Self> {
        Arc::new(Self { id: ConnectionId::next(), user: UserId::new(user), sent: Mutex::new(Vec::new()) })
    }

    fn last(&self) -> Option<ServerMessage> {
        self.sent.lock().last().cloned()
    }
}

impl Connection for FakeConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }
    fn user(&self) -> UserId {
        self.user.clone()
    }
    fn send(&self, message: ServerMessage) {
        self.sent.lock().push(message);
    }
    fn is_open(&self) -> bool {
        true
    }
}

struct NullTemplates;
impl TemplatingEngine for NullTemplates {
    fn render(&self, template: &str, _context: &Value) -> Result<String, TemplatingError> {
        Ok(template.to_string())
    }
}

struct Echo;
#[async_trait]
impl ViewHandler for Echo {
    async fn handle(&self, ctx: &mut ViewContext) -> RawResponse {
        RawResponse::Text(format!("hi {}", ctx.request().user))
    }
}

struct DaemonWaitsForInput;
#[async_trait]
impl ViewHandler for DaemonWaitsForInput {
    async fn handle(&self, ctx: &mut ViewContext) -> RawResponse {
        ctx.daemonize();
        ctx.next_input_event().await;
        RawResponse::Text("got input".to_string())
    }
}

struct RedirectAnonymous;
#[async_trait]
impl Middleware for RedirectAnonymous {
    async fn handle(
        &self,
        request: &viewloop_core::Request,
        _view_handler: &HandlerId,
    ) -> Result<Option<RawResponse>, viewloop_core::HandlerException> {
        if request.user == UserId::anonymous() {
            Ok(Some(RawResponse::Redirect("/login".to_string())))
        } else {
            Ok(None)
        }
    }
}

fn start_controller(router: Router, registry: HandlerRegistry, middleware: MiddlewarePipeline) -> viewloop_core::ControllerHandle {
    Controller::start(
        Arc::new(Settings::default()),
        Arc::new(router),
        registry,
        middleware,
        Scheduler::new(4),
        Arc::new(NullTemplates),
        Vec::new(),
        Vec::new(),
    )
}

#[tokio::test]
async fn simple_view_returns_text_response() {
    let router = Router::new(vec![Route::builder("/hello", HandlerId::new("hello_view")).build()]).unwrap();
    let registry = HandlerRegistry::builder().register(HandlerId::new("hello_view"), Arc::new(Echo)).build();

    let controller = start_controller(router, registry, MiddlewarePipeline::default());
    let connection = FakeConnection::new("alice");

    controller.handle_view(connection.clone(), 1, "/hello".to_string(), None);
    tokio::time::sleep(Duration::from_millis(30)).await;

    match connection.last().expect("a response should have been sent") {
        ServerMessage::Response { text, status, content_type, .. } => {
            assert_eq!(text, "hi alice");
            assert_eq!(status, 200);
            assert_eq!(content_type, "text/html");
        }
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn second_window_reuses_the_daemon_instead_of_starting_a_new_view() {
    let router = Router::new(vec![Route::builder("/room", HandlerId::new("room_view")).build()]).unwrap();
    let registry = HandlerRegistry::builder().register(HandlerId::new("room_view"), Arc::new(DaemonWaitsForInput)).build();

    let controller = start_controller(router, registry, MiddlewarePipeline::default());
    let connection = FakeConnection::new("bob");

    controller.handle_view(connection.clone(), 1, "/room".to_string(), None);
    tokio::time::sleep(Duration::from_millis(30)).await;

    // A second window from the same user/url attaches to the daemonized
    // runtime rather than starting a second one; it gets no response yet
    // because the handler is still awaiting input.
    controller.handle_view(connection.clone(), 2, "/room".to_string(), None);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(connection.sent.lock().len(), 0);

    controller.handle_input_event(connection.clone(), 2, "/room".to_string(), serde_json::json!({"ok": true}));
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Both windows receive the final response once the single shared
    // runtime finishes.
    assert_eq!(connection.sent.lock().len(), 2);
}

#[tokio::test]
async fn redispatching_one_window_does_not_detach_a_sibling_window_on_the_same_runtime() {
    let router = Router::new(vec![
        Route::builder("/room", HandlerId::new("room_view")).build(),
        Route::builder("/elsewhere", HandlerId::new("elsewhere_view")).build(),
    ])
    .unwrap();
    let registry = HandlerRegistry::builder()
        .register(HandlerId::new("room_view"), Arc::new(DaemonWaitsForInput))
        .register(HandlerId::new("elsewhere_view"), Arc::new(Echo))
        .build();

    let controller = start_controller(router, registry, MiddlewarePipeline::default());
    let connection = FakeConnection::new("ivy");

    // Two windows of the same connection, both on the daemonized view.
    controller.handle_view(connection.clone(), 1, "/room".to_string(), None);
    tokio::time::sleep(Duration::from_millis(30)).await;
    controller.handle_view(connection.clone(), 2, "/room".to_string(), None);
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Window 1 navigates away; it must detach from the daemon without
    // dragging window 2's attachment down with it.
    controller.handle_view(connection.clone(), 1, "/elsewhere".to_string(), None);
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Window 2 is still attached to the daemon: an input event routed to it
    // should still reach that runtime and produce its final response.
    controller.handle_input_event(connection.clone(), 2, "/room".to_string(), serde_json::json!({"ok": true}));
    tokio::time::sleep(Duration::from_millis(30)).await;

    let messages = connection.sent.lock().clone();
    let room_responses =
        messages.iter().filter(|m| matches!(m, ServerMessage::Response { window_id: 2, text, .. } if text == "got input")).count();
    assert_eq!(room_responses, 1, "window 2 should still have received the daemon's final response: {messages:?}");
}

#[tokio::test]
async fn http_pass_through_route_never_creates_a_runtime() {
    let router =
        Router::new(vec![Route::builder("/legacy", HandlerId::new("legacy_view")).http_pass_through(true).build()]).unwrap();
    let registry = HandlerRegistry::builder().register(HandlerId::new("legacy_view"), Arc::new(Echo)).build();

    let controller = start_controller(router, registry, MiddlewarePipeline::default());
    let connection = FakeConnection::new("carol");

    controller.handle_view(connection.clone(), 1, "/legacy".to_string(), None);
    tokio::time::sleep(Duration::from_millis(30)).await;

    match connection.last().expect("an http redirect should have been sent") {
        ServerMessage::HttpRedirect { target_url, .. } => assert_eq!(target_url, "/legacy"),
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn middleware_short_circuit_prevents_the_view_handler_from_running() {
    let ran = Arc::new(AtomicBool::new(false));

    struct Tracking(Arc<AtomicBool>);
    #[async_trait]
    impl ViewHandler for Tracking {
        async fn handle(&self, _ctx: &mut ViewContext) -> RawResponse {
            self.0.store(true, Ordering::SeqCst);
            RawResponse::Text("should not run".to_string())
        }
    }

    let router = Router::new(vec![Route::builder("/secret", HandlerId::new("secret_view")).build()]).unwrap();
    let registry = HandlerRegistry::builder().register(HandlerId::new("secret_view"), Arc::new(Tracking(ran.clone()))).build();
    let middleware = MiddlewarePipeline::new(vec![Arc::new(RedirectAnonymous)]);

    let controller = start_controller(router, registry, middleware);
    let connection = FakeConnection::new("anonymous");

    controller.handle_view(connection.clone(), 1, "/secret".to_string(), None);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(!ran.load(Ordering::SeqCst), "view handler must not run when middleware short-circuits");

    match connection.last().expect("a redirect response should have been sent") {
        ServerMessage::Response { redirect, .. } => assert_eq!(redirect, "/login"),
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn unmatched_route_renders_404() {
    let router = Router::new(vec![]).unwrap();
    let registry = HandlerRegistry::builder().build();

    let controller = start_controller(router, registry, MiddlewarePipeline::default());
    let connection = FakeConnection::new("dave");

    controller.handle_view(connection.clone(), 1, "/does-not-exist".to_string(), None);
    tokio::time::sleep(Duration::from_millis(30)).await;

    match connection.last().expect("a 404 response should have been sent") {
        ServerMessage::Response { status, .. } => assert_eq!(status, 500),
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn panicking_handler_and_panicking_on_500_still_finish_the_runtime_with_the_hardcoded_fallback() {
    struct Panics;
    #[async_trait]
    impl ViewHandler for Panics {
        async fn handle(&self, _ctx: &mut ViewContext) -> RawResponse {
            panic!("view handler exploded")
        }
    }

    let router = Router::new(vec![Route::builder("/boom", HandlerId::new("boom_view")).build()]).unwrap();
    let registry = HandlerRegistry::builder()
        .register(HandlerId::new("boom_view"), Arc::new(Panics))
        .register(HandlerId::new("boom_500"), Arc::new(Panics))
        .build();

    let mut settings = Settings::default();
    settings.error_500_view = Some(HandlerId::new("boom_500"));

    let controller = Controller::start(
        Arc::new(settings),
        Arc::new(router),
        registry,
        MiddlewarePipeline::default(),
        Scheduler::new(4),
        Arc::new(NullTemplates),
        Vec::new(),
        Vec::new(),
    );
    let connection = FakeConnection::new("erin");

    controller.handle_view(connection.clone(), 1, "/boom".to_string(), None);
    tokio::time::sleep(Duration::from_millis(50)).await;

    match connection.last().expect("the hardcoded fallback should still have been sent") {
        ServerMessage::Response { status, text, .. } => {
            assert_eq!(status, 500);
            assert_eq!(text, "Internal Server Error");
        }
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn multi_user_runtime_broadcasts_to_every_attached_connection() {
    struct CountsInputs(Arc<std::sync::atomic::AtomicUsize>);
    #[async_trait]
    impl ViewHandler for CountsInputs {
        async fn handle(&self, ctx: &mut ViewContext) -> RawResponse {
            ctx.daemonize();
            for _ in 0..2 {
                if ctx.next_input_event().await.is_some() {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
            RawResponse::Text("final tally".to_string())
        }
    }

    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let router =
        Router::new(vec![Route::builder("/lobby", HandlerId::new("lobby_view")).multi_user(true).build()]).unwrap();
    let registry =
        HandlerRegistry::builder().register(HandlerId::new("lobby_view"), Arc::new(CountsInputs(counter.clone()))).build();

    let controller = start_controller(router, registry, MiddlewarePipeline::default());

    // The multi-user runtime is started eagerly at `Controller::start`, before
    // any connection attaches (spec §4.6 bootstrap).
    tokio::time::sleep(Duration::from_millis(20)).await;

    let first = FakeConnection::new("fiona");
    let second = FakeConnection::new("george");

    controller.handle_view(first.clone(), 1, "/lobby".to_string(), None);
    controller.handle_view(second.clone(), 1, "/lobby".to_string(), None);
    tokio::time::sleep(Duration::from_millis(30)).await;

    controller.handle_input_event(first.clone(), 1, "/lobby".to_string(), serde_json::json!({"n": 1}));
    tokio::time::sleep(Duration::from_millis(20)).await;
    controller.handle_input_event(second.clone(), 1, "/lobby".to_string(), serde_json::json!({"n": 2}));
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 2);

    // Both connections share the one runtime, so both receive its final
    // response in FIFO order relative to their own sends.
    for connection in [&first, &second] {
        match connection.last().expect("both attached connections should receive the final response") {
            ServerMessage::Response { text, .. } => assert_eq!(text, "final tally"),
            other => panic!("unexpected message {other:?}"),
        }
    }
}

#[tokio::test]
async fn server_stop_lets_a_daemon_view_finish_before_the_pool_is_aborted() {
    struct WaitsUntilStopped;
    #[async_trait]
    impl ViewHandler for WaitsUntilStopped {
        async fn handle(&self, ctx: &mut ViewContext) -> RawResponse {
            ctx.daemonize();
            // No input ever arrives; the only way out is a stop signal,
            // which `next_input_event` races against via `stop_rx.changed()`.
            ctx.next_input_event().await;
            RawResponse::Text("stopped cleanly".to_string())
        }
    }

    let router = Router::new(vec![Route::builder("/daemon", HandlerId::new("daemon_view")).build()]).unwrap();
    let registry = HandlerRegistry::builder().register(HandlerId::new("daemon_view"), Arc::new(WaitsUntilStopped)).build();

    let controller = start_controller(router, registry, MiddlewarePipeline::default());
    let connection = FakeConnection::new("hank");

    controller.handle_view(connection.clone(), 1, "/daemon".to_string(), None);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(connection.sent.lock().len(), 0, "daemon should not have responded yet");

    // `stop()` resolves only after `shutdown()` has both signaled every
    // runtime and waited for it to actually finish, so the response should
    // already be delivered by the time this `.await` returns.
    controller.stop().await;

    match connection.last().expect("the daemon should have delivered its final response before shutdown completed") {
        ServerMessage::Response { text, .. } => assert_eq!(text, "stopped cleanly"),
        other => panic!("unexpected message {other:?}"),
    }
}
