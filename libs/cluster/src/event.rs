//! Cluster events consumed by the control loop.

use std::fmt;

/// Entity an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Service,
    Node,
    Other(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "service" => Self::Service,
            "node" => Self::Node,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service => f.write_str("service"),
            Self::Node => f.write_str("node"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

/// What happened to the entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Update,
    Remove,
    Other(String),
}

impl EventAction {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "create" => Self::Create,
            "update" => Self::Update,
            "remove" => Self::Remove,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update => f.write_str("update"),
            Self::Remove => f.write_str("remove"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

/// One entry of the ordered, cluster-scoped event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub kind: EventKind,
    pub action: EventAction,

    /// ID of the entity the event is about.
    pub actor_id: String,

    /// Entity name, when the orchestrator attaches one.
    ///
    /// Removed services can no longer be fetched, so their name is only
    /// available here.
    pub actor_name: Option<String>,
}

impl ClusterEvent {
    pub fn service(action: EventAction, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Service,
            action,
            actor_id: id.into(),
            actor_name: Some(name.into()),
        }
    }

    pub fn node(action: EventAction, id: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Node,
            action,
            actor_id: id.into(),
            actor_name: None,
        }
    }
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} {}", self.kind, self.action, self.actor_id)
    }
}
