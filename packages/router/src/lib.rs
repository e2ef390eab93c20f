//! Ordered path routing.
//!
//! A [`Router`] is an immutable, ordered sequence of [`Route`]s built once at
//! startup. `resolve` performs a first-match scan; ties are broken by
//! registration order. Path capture is limited to simple `:name` segments —
//! anything richer is the router implementation's problem, not the core's
//! (spec §4.1).

use rustc_hash::FxHashMap;
use std::fmt;

mod route;

pub use route::{HandlerId, Route, RouteBuilder};

/// Captured path parameters, keyed by segment name.
pub type MatchInfo = FxHashMap<String, String>;

/// The result of resolving a path against the router.
#[derive(Debug, Clone)]
pub struct Resolved<'a> {
    /// Stable, hashable key for this route within its owning [`Router`];
    /// lets callers (the controller's per-route tables) key off something
    /// other than a borrowed reference.
    pub route_id: usize,
    pub route: &'a Route,
    pub match_info: MatchInfo,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("a route named {0:?} is already registered")]
    DuplicateName(String),
}

/// An ordered sequence of routes plus a reverse name index.
pub struct Router {
    routes: Vec<Route>,
    by_name: FxHashMap<String, usize>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .finish()
    }
}

impl Router {
    /// Build a router from routes in registration order. Later routes with
    /// the same pattern are still reachable; only duplicate *names* are
    /// rejected, since the name index must stay unambiguous.
    pub fn new(routes: Vec<Route>) -> Result<Self, RouterError> {
        let mut by_name = FxHashMap::default();

        for (index, route) in routes.iter().enumerate() {
            if let Some(name) = route.name() {
                if by_name.insert(name.to_string(), index).is_some() {
                    return Err(RouterError::DuplicateName(name.to_string()));
                }
            }
        }

        Ok(Self { routes, by_name })
    }

    /// All registered routes, in registration order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Look a route up by its registered name, used for reverse lookups.
    pub fn by_name(&self, name: &str) -> Option<&Route> {
        self.by_name.get(name).map(|&index| &self.routes[index])
    }

    /// First-match ordered scan over the registered routes.
    pub fn resolve(&self, path: &str) -> Option<Resolved<'_>> {
        let requested: Vec<&str> = split_segments(path);

        for (route_id, route) in self.routes.iter().enumerate() {
            if let Some(match_info) = route.matches(&requested) {
                return Some(Resolved { route_id, route, match_info });
            }
        }

        None
    }
}

fn split_segments(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn router() -> Router {
        Router::new(vec![
            Route::builder("/hello", HandlerId::new("hello_view")).build(),
            Route::builder("/users/:id", HandlerId::new("user_view")).build(),
            Route::builder("/legacy", HandlerId::new("legacy_view"))
                .http_pass_through(true)
                .build(),
            Route::builder("/board", HandlerId::new("board_view"))
                .multi_user(true)
                .build(),
        ])
        .unwrap()
    }

    #[test]
    fn resolves_literal_path() {
        let router = router();
        let resolved = router.resolve("/hello").expect("should match");
        assert_eq!(resolved.route.pattern(), "/hello");
        assert!(resolved.match_info.is_empty());
    }

    #[test]
    fn captures_path_parameter() {
        let router = router();
        let resolved = router.resolve("/users/42").expect("should match");
        assert_eq!(resolved.match_info.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn first_match_wins_on_ties() {
        let router = Router::new(vec![
            Route::builder("/:anything", HandlerId::new("catch_all")).build(),
            Route::builder("/hello", HandlerId::new("hello_view")).build(),
        ])
        .unwrap();

        let resolved = router.resolve("/hello").unwrap();
        assert_eq!(resolved.route.handler().as_str(), "catch_all");
    }

    #[test]
    fn unmatched_path_resolves_to_none() {
        let router = router();
        assert!(router.resolve("/does/not/exist").is_none());
    }

    #[test]
    fn rejects_duplicate_route_names() {
        let routes = vec![
            Route::builder("/a", HandlerId::new("a")).name("dup").build(),
            Route::builder("/b", HandlerId::new("b")).name("dup").build(),
        ];

        assert!(matches!(Router::new(routes), Err(RouterError::DuplicateName(_))));
    }
}
