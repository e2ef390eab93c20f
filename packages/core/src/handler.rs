//! The static handler registry.
//!
//! Real production lona resolves a view's handler from a dotted Python
//! import string the first time it's needed, caching the resolved callable.
//! A statically typed core has no string-eval step available (spec §9): a
//! [`HandlerRegistry`] is built once at startup, mapping each [`HandlerId`]
//! a route names to a resolved, typed [`ViewHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use viewloop_router::HandlerId;

use crate::response::RawResponse;
use crate::view_runtime::ViewContext;

/// User view code, registered against a [`HandlerId`] and invoked by the
/// scheduler at the priority its route configures.
#[async_trait]
pub trait ViewHandler: Send + Sync {
    async fn handle(&self, ctx: &mut ViewContext) -> RawResponse;
}

/// A [`ViewHandler`] built from a plain async closure, for handlers that
/// don't need their own named type.
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> ViewHandler for FnHandler<F>
where
    F: Fn(&mut ViewContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = RawResponse> + Send,
{
    async fn handle(&self, ctx: &mut ViewContext) -> RawResponse {
        (self.0)(ctx).await
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<FxHashMap<HandlerId, Arc<dyn ViewHandler>>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn get(&self, id: &HandlerId) -> Option<Arc<dyn ViewHandler>> {
        self.handlers.get(id).cloned()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: FxHashMap<HandlerId, Arc<dyn ViewHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register(mut self, id: HandlerId, handler: Arc<dyn ViewHandler>) -> Self {
        self.handlers.insert(id, handler);
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry { handlers: Arc::new(self.handlers) }
    }
}
