//! The ordered request middleware chain (spec §4.4).

use std::sync::Arc;

use async_trait::async_trait;

use viewloop_router::HandlerId;

use crate::error::HandlerException;
use crate::request::Request;
use crate::response::RawResponse;
use crate::scheduler::{Priority, Scheduler, SchedulerError};

/// An ordered interceptor. Returning `Ok(Some(_))` short-circuits dispatch:
/// its value is delivered as the response and neither later middlewares nor
/// the view handler run. `Ok(None)` passes the request through unchanged.
/// `Err(HandlerException::Forbidden)` routes to the 403 handler, modeled on
/// `lona`'s authentication middlewares raising `Forbidden` (spec §4.4/§7).
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: &Request, view_handler: &HandlerId) -> Result<Option<RawResponse>, HandlerException>;
}

/// Why a middleware dispatch failed to produce a normal short-circuit or
/// pass-through result.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Handler(#[from] HandlerException),
}

#[derive(Clone, Default)]
pub struct MiddlewarePipeline {
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewarePipeline {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares: Arc::new(middlewares) }
    }

    /// Run each middleware in registration order, synchronously awaited
    /// (spec §4.4). Each runs via [`Scheduler::run_inline`] rather than
    /// [`Scheduler::schedule`]: spec §5 requires the dispatcher's
    /// synchronous middleware call not to contend with a worker pool that
    /// may be saturated by long-lived view handlers.
    pub async fn dispatch(
        &self,
        scheduler: &Scheduler,
        priority: Priority,
        request: &Request,
        view_handler: &HandlerId,
    ) -> Result<Option<RawResponse>, DispatchError> {
        for middleware in self.middlewares.iter() {
            let outcome = scheduler.run_inline(priority, middleware.handle(request, view_handler)).await?;
            let response = outcome?;

            if response.is_some() {
                return Ok(response);
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::UserId;
    use pretty_assertions::assert_eq;
    use rustc_hash::FxHashMap;

    struct PassThrough;

    #[async_trait]
    impl Middleware for PassThrough {
        async fn handle(&self, _request: &Request, _view_handler: &HandlerId) -> Result<Option<RawResponse>, HandlerException> {
            Ok(None)
        }
    }

    struct RedirectAnonymous;

    #[async_trait]
    impl Middleware for RedirectAnonymous {
        async fn handle(&self, request: &Request, _view_handler: &HandlerId) -> Result<Option<RawResponse>, HandlerException> {
            if request.user == UserId::anonymous() {
                Ok(Some(RawResponse::Redirect("/login".to_string())))
            } else {
                Ok(None)
            }
        }
    }

    struct AlwaysForbidden;

    #[async_trait]
    impl Middleware for AlwaysForbidden {
        async fn handle(&self, _request: &Request, _view_handler: &HandlerId) -> Result<Option<RawResponse>, HandlerException> {
            Err(HandlerException::Forbidden)
        }
    }

    fn request(user: UserId) -> Request {
        Request {
            user,
            url: "/secret".to_string(),
            match_info: FxHashMap::default(),
            post_data: None,
            connection: None,
            window_id: None,
            handler: HandlerId::new("secret_view"),
        }
    }

    #[tokio::test]
    async fn pass_through_lets_the_view_handler_run() {
        let scheduler = Scheduler::new(2);
        let pipeline = MiddlewarePipeline::new(vec![Arc::new(PassThrough)]);

        let result = pipeline
            .dispatch(&scheduler, Priority::High, &request(UserId::anonymous()), &HandlerId::new("secret_view"))
            .await
            .unwrap();

        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn first_short_circuit_wins() {
        let scheduler = Scheduler::new(2);
        let pipeline = MiddlewarePipeline::new(vec![Arc::new(RedirectAnonymous), Arc::new(PassThrough)]);

        let result = pipeline
            .dispatch(&scheduler, Priority::High, &request(UserId::anonymous()), &HandlerId::new("secret_view"))
            .await
            .unwrap();

        assert_eq!(result, Some(RawResponse::Redirect("/login".to_string())));
    }

    #[tokio::test]
    async fn authenticated_user_passes_through() {
        let scheduler = Scheduler::new(2);
        let pipeline = MiddlewarePipeline::new(vec![Arc::new(RedirectAnonymous)]);

        let result = pipeline
            .dispatch(&scheduler, Priority::High, &request(UserId::new("alice")), &HandlerId::new("secret_view"))
            .await
            .unwrap();

        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn forbidden_short_circuits_as_an_error_not_a_response() {
        let scheduler = Scheduler::new(2);
        let pipeline = MiddlewarePipeline::new(vec![Arc::new(AlwaysForbidden)]);

        let result = pipeline
            .dispatch(&scheduler, Priority::High, &request(UserId::anonymous()), &HandlerId::new("secret_view"))
            .await;

        assert!(matches!(result, Err(DispatchError::Handler(HandlerException::Forbidden))));
    }
}
