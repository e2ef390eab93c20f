use crate::MatchInfo;

/// A symbolic reference to a handler.
///
/// Real production lona resolves handlers from dotted import strings at
/// first use. A statically typed core has no such string-eval step: the
/// handler registry (owned by `viewloop-core`) maps these ids to resolved,
/// typed handler capabilities once at startup, per spec §9's design note.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize, serde::Serialize)]
pub struct HandlerId(String);

impl HandlerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single registered route. Immutable once built.
#[derive(Debug, Clone)]
pub struct Route {
    pattern: String,
    segments: Vec<Segment>,
    name: Option<String>,
    handler: HandlerId,
    interactive: bool,
    http_pass_through: bool,
    multi_user: bool,
    frontend_view: Option<HandlerId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Capture(String),
}

impl Route {
    pub fn builder(pattern: impl Into<String>, handler: HandlerId) -> RouteBuilder {
        RouteBuilder::new(pattern, handler)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn handler(&self) -> &HandlerId {
        &self.handler
    }

    pub fn interactive(&self) -> bool {
        self.interactive
    }

    pub fn http_pass_through(&self) -> bool {
        self.http_pass_through
    }

    pub fn multi_user(&self) -> bool {
        self.multi_user
    }

    pub fn frontend_view(&self) -> Option<&HandlerId> {
        self.frontend_view.as_ref()
    }

    /// Match an already path-split request against this route's pattern.
    pub(crate) fn matches(&self, requested: &[&str]) -> Option<MatchInfo> {
        if self.segments.len() != requested.len() {
            return None;
        }

        let mut match_info = MatchInfo::default();

        for (segment, value) in self.segments.iter().zip(requested) {
            match segment {
                Segment::Literal(literal) => {
                    if literal != value {
                        return None;
                    }
                }
                Segment::Capture(name) => {
                    match_info.insert(name.clone(), value.to_string());
                }
            }
        }

        Some(match_info)
    }
}

/// Builder for [`Route`]; all flags default the way spec §3 specifies.
pub struct RouteBuilder {
    pattern: String,
    name: Option<String>,
    handler: HandlerId,
    interactive: bool,
    http_pass_through: bool,
    multi_user: bool,
    frontend_view: Option<HandlerId>,
}

impl RouteBuilder {
    fn new(pattern: impl Into<String>, handler: HandlerId) -> Self {
        Self {
            pattern: pattern.into(),
            name: None,
            handler,
            interactive: true,
            http_pass_through: false,
            multi_user: false,
            frontend_view: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn http_pass_through(mut self, http_pass_through: bool) -> Self {
        self.http_pass_through = http_pass_through;
        self
    }

    pub fn multi_user(mut self, multi_user: bool) -> Self {
        self.multi_user = multi_user;
        self
    }

    pub fn frontend_view(mut self, handler: HandlerId) -> Self {
        self.frontend_view = Some(handler);
        self
    }

    pub fn build(self) -> Route {
        let segments = self
            .pattern
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|segment| {
                if let Some(name) = segment.strip_prefix(':') {
                    Segment::Capture(name.to_string())
                } else {
                    Segment::Literal(segment.to_string())
                }
            })
            .collect();

        Route {
            pattern: self.pattern,
            segments,
            name: self.name,
            handler: self.handler,
            interactive: self.interactive,
            http_pass_through: self.http_pass_through,
            multi_user: self.multi_user,
            frontend_view: self.frontend_view,
        }
    }
}
