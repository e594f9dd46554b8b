//! Lifecycle events and the patterns hooks subscribe with.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// When a hook runs relative to the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPhase {
    /// Before dispatch; a failure aborts the operation.
    Before,
    /// After a successful dispatch; failures are logged only.
    After,
}

impl HookPhase {
    /// Both phases.
    pub const ALL: [HookPhase; 2] = [HookPhase::Before, HookPhase::After];

    fn as_str(&self) -> &'static str {
        match self {
            HookPhase::Before => "before",
            HookPhase::After => "after",
        }
    }
}

/// The operation a hook observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookAction {
    /// Row query.
    Find,
    /// Row count.
    Count,
    /// Grouped aggregate.
    Aggregate,
    /// Insert.
    Create,
    /// Update.
    Update,
    /// Delete.
    Delete,
}

impl HookAction {
    /// Every action.
    pub const ALL: [HookAction; 6] = [
        HookAction::Find,
        HookAction::Count,
        HookAction::Aggregate,
        HookAction::Create,
        HookAction::Update,
        HookAction::Delete,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            HookAction::Find => "find",
            HookAction::Count => "count",
            HookAction::Aggregate => "aggregate",
            HookAction::Create => "create",
            HookAction::Update => "update",
            HookAction::Delete => "delete",
        }
    }
}

impl FromStr for HookPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        HookPhase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::InvalidDefinition(format!("unknown hook phase '{}'", s)))
    }
}

impl FromStr for HookAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        HookAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| Error::InvalidDefinition(format!("unknown hook action '{}'", s)))
    }
}

/// A concrete lifecycle event, written `phase:action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookEvent {
    /// Phase.
    pub phase: HookPhase,
    /// Action.
    pub action: HookAction,
}

impl HookEvent {
    /// Create an event.
    pub fn new(phase: HookPhase, action: HookAction) -> Self {
        Self { phase, action }
    }

    /// `before:<action>`.
    pub fn before(action: HookAction) -> Self {
        Self::new(HookPhase::Before, action)
    }

    /// `after:<action>`.
    pub fn after(action: HookAction) -> Self {
        Self::new(HookPhase::After, action)
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.phase.as_str(), self.action.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (phase, action) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidDefinition(format!("hook event '{}' is not phase:action", s)))?;
        Ok(HookEvent::new(phase.parse()?, action.parse()?))
    }
}

/// Events a hook subscribes to. `*` in either position matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventPattern {
    /// Phase, `None` for any.
    pub phase: Option<HookPhase>,
    /// Action, `None` for any.
    pub action: Option<HookAction>,
}

impl EventPattern {
    /// Matches every event.
    pub fn any() -> Self {
        Self::default()
    }

    /// Whether `event` matches.
    pub fn matches(&self, event: HookEvent) -> bool {
        self.phase.map_or(true, |p| p == event.phase) && self.action.map_or(true, |a| a == event.action)
    }

    /// Concrete events covered by the pattern.
    pub fn expand(&self) -> Vec<HookEvent> {
        HookPhase::ALL
            .into_iter()
            .flat_map(|phase| HookAction::ALL.into_iter().map(move |action| HookEvent::new(phase, action)))
            .filter(|e| self.matches(*e))
            .collect()
    }
}

impl From<HookEvent> for EventPattern {
    fn from(event: HookEvent) -> Self {
        Self {
            phase: Some(event.phase),
            action: Some(event.action),
        }
    }
}

impl FromStr for EventPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "*" {
            return Ok(Self::any());
        }
        let (phase, action) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidDefinition(format!("event pattern '{}' is not phase:action", s)))?;
        Ok(Self {
            phase: if phase == "*" { None } else { Some(phase.parse()?) },
            action: if action == "*" { None } else { Some(action.parse()?) },
        })
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.phase, self.action) {
            (None, None) => f.write_str("*"),
            (phase, action) => write!(
                f,
                "{}:{}",
                phase.map_or("*", |p| p.as_str()),
                action.map_or("*", |a| a.as_str())
            ),
        }
    }
}

/// Objects a hook subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectPattern {
    /// Every object.
    Any,
    /// One object.
    Exact(String),
    /// Objects whose name starts with the prefix (`sales_*`).
    Prefix(String),
    /// Objects whose name ends with the suffix (`*_line`).
    Suffix(String),
}

impl ObjectPattern {
    /// Parse `*`, `prefix*`, `*suffix` or an exact name.
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(Error::InvalidDefinition("empty object pattern".into()));
        }
        if pattern == "*" {
            return Ok(ObjectPattern::Any);
        }
        let parsed = match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
            (Some(suffix), None) => ObjectPattern::Suffix(suffix.to_string()),
            (None, Some(prefix)) => ObjectPattern::Prefix(prefix.to_string()),
            (None, None) => ObjectPattern::Exact(pattern.to_string()),
            (Some(_), Some(_)) => {
                return Err(Error::InvalidDefinition(format!(
                    "object pattern '{}' may use one wildcard",
                    pattern
                )))
            }
        };
        if let ObjectPattern::Prefix(p) | ObjectPattern::Suffix(p) = &parsed {
            if p.contains('*') {
                return Err(Error::InvalidDefinition(format!(
                    "object pattern '{}' may use one wildcard",
                    pattern
                )));
            }
        }
        Ok(parsed)
    }

    /// Whether `object` matches.
    pub fn matches(&self, object: &str) -> bool {
        match self {
            ObjectPattern::Any => true,
            ObjectPattern::Exact(name) => name == object,
            ObjectPattern::Prefix(prefix) => object.starts_with(prefix.as_str()),
            ObjectPattern::Suffix(suffix) => object.ends_with(suffix.as_str()),
        }
    }

    /// Whether objects registered later may match.
    pub fn is_wildcard(&self) -> bool {
        !matches!(self, ObjectPattern::Exact(_))
    }
}

impl fmt::Display for ObjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectPattern::Any => f.write_str("*"),
            ObjectPattern::Exact(name) => f.write_str(name),
            ObjectPattern::Prefix(prefix) => write!(f, "{}*", prefix),
            ObjectPattern::Suffix(suffix) => write!(f, "*{}", suffix),
        }
    }
}
