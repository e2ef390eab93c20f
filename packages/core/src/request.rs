use serde_json::Value;
use viewloop_protocol::WindowId;
use viewloop_router::{HandlerId, MatchInfo};

use crate::connection::{ConnectionHandle, UserId};

/// A single dispatch attempt bound to a view runtime and, for interactive
/// dispatch, a specific originating window (spec §4.3, `gen_request` /
/// `gen_multi_user_request`).
#[derive(Clone)]
pub struct Request {
    pub user: UserId,
    pub url: String,
    pub match_info: MatchInfo,
    pub post_data: Option<Value>,
    pub connection: Option<ConnectionHandle>,
    pub window_id: Option<WindowId>,
    pub handler: HandlerId,
}
