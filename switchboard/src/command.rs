//! The command model shared by adapters, built-ins and plugins.

use crate::events::{SourceType, UserIdentity};
use crate::util::generate_id;
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

/// Who caused a command to exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TriggeredBy {
    /// A chat user typed it.
    #[default]
    User,
    /// A plugin schedule fired.
    Timer,
}

/// Reply address of a command within its own network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Source {
    /// Channel, group or user identifier.
    pub identifier: String,
    /// What kind of target the identifier names.
    pub source_type: SourceType,
}

impl Source {
    /// Create a source.
    pub fn new(identifier: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            identifier: identifier.into(),
            source_type,
        }
    }

    /// A source with no reply target.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }
}

/// Anything that can deliver a finished command back to its network.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Name of the connection behind this sink.
    fn name(&self) -> &str;

    /// Deliver `cmd.response` to `cmd.source`. Empty responses are dropped.
    async fn queue_response(&self, cmd: Command);
}

/// A single command invocation.
#[derive(Clone)]
pub struct Command {
    /// Unique id for log correlation.
    pub id: String,
    /// Request text with the command token already stripped.
    pub request: String,
    /// Response text, once a handler has produced it.
    pub response: Option<String>,
    /// Where to send the response.
    pub source: Source,
    /// What triggered the command.
    pub triggered_by: TriggeredBy,
    /// Who typed the command, for user-triggered commands.
    pub sender: Option<UserIdentity>,
    /// Creation time.
    pub created_at: SystemTime,
    origin: Option<Weak<dyn ResponseSink>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("response", &self.response)
            .field("source", &self.source)
            .field("triggered_by", &self.triggered_by)
            .field("has_origin", &self.origin.is_some())
            .finish_non_exhaustive()
    }
}

impl Command {
    /// A command typed by a user on some network.
    pub fn from_user(
        request: impl Into<String>,
        source: Source,
        sender: UserIdentity,
        origin: &Arc<dyn ResponseSink>,
    ) -> Self {
        Self {
            id: generate_id(),
            request: request.into(),
            response: None,
            source,
            triggered_by: TriggeredBy::User,
            sender: Some(sender),
            created_at: SystemTime::now(),
            origin: Some(Arc::downgrade(origin)),
        }
    }

    /// A synthetic command created by a schedule tick; it has no origin.
    pub fn timer(request: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            request: request.into(),
            response: None,
            source: Source::none(),
            triggered_by: TriggeredBy::Timer,
            sender: None,
            created_at: SystemTime::now(),
            origin: None,
        }
    }

    /// A bare command with an explicit source and no origin.
    pub fn detached(request: impl Into<String>, source: Source) -> Self {
        Self {
            source,
            triggered_by: TriggeredBy::User,
            ..Self::timer(request)
        }
    }

    /// Set the response text.
    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    /// Case-folded first whitespace-delimited token of the request.
    #[must_use]
    pub fn name(&self) -> String {
        self.request
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }

    /// Everything after the command name, without leading whitespace.
    #[must_use]
    pub fn args(&self) -> &str {
        let trimmed = self.request.trim_start();
        trimmed
            .find(char::is_whitespace)
            .map_or("", |idx| trimmed[idx..].trim_start())
    }

    /// The adapter that produced this command, if it is still alive.
    #[must_use]
    pub fn origin(&self) -> Option<Arc<dyn ResponseSink>> {
        self.origin.as_ref().and_then(Weak::upgrade)
    }

    /// Weak handle to the origin, for plugins that keep subscriptions.
    #[must_use]
    pub fn origin_weak(&self) -> Option<Weak<dyn ResponseSink>> {
        self.origin.clone()
    }

    /// Whether a non-empty response is set.
    #[must_use]
    pub fn has_response(&self) -> bool {
        self.response.as_deref().is_some_and(|r| !r.is_empty())
    }
}
