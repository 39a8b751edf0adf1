//! Hourly time announcement.
//!
//! `chime on` subscribes the channel or user the command came from,
//! `chime off` removes it, bare `chime` reports the subscription count. At
//! minute 0 the plugin posts the local time to every subscriber whose
//! adapter is still alive.

use crate::command::{Command, ResponseSink, Source, TriggeredBy};
use crate::error::{HandlerError, HandlerResult};
use crate::plugin::{DispatcherFacade, Plugin};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError, Weak};
use tracing::debug;

struct Subscription {
    origin: Weak<dyn ResponseSink>,
    network: String,
    source: Source,
}

impl Subscription {
    fn matches(&self, network: &str, source: &Source) -> bool {
        self.network == network && self.source.identifier == source.identifier
    }
}

/// The chime plugin.
#[derive(Default)]
pub struct Chime {
    subscribers: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for Chime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chime")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Chime {
    /// Create a plugin with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|s| s.origin.strong_count() > 0);
        subs.len()
    }

    fn subscribe(&self, cmd: &Command) -> HandlerResult<String> {
        let (Some(origin), Some(sink)) = (cmd.origin_weak(), cmd.origin()) else {
            return Err(HandlerError::failed("nowhere to deliver chimes"));
        };
        let network = sink.name().to_string();
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if subs.iter().any(|s| s.matches(&network, &cmd.source)) {
            return Ok(format!("{} already hears the chime", cmd.source.identifier));
        }
        subs.push(Subscription {
            origin,
            network,
            source: cmd.source.clone(),
        });
        Ok(format!("chime on for {}", cmd.source.identifier))
    }

    fn unsubscribe(&self, cmd: &Command) -> String {
        let network = cmd.origin().map(|s| s.name().to_string()).unwrap_or_default();
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| !s.matches(&network, &cmd.source));
        if subs.len() < before {
            format!("chime off for {}", cmd.source.identifier)
        } else {
            format!("{} was not subscribed", cmd.source.identifier)
        }
    }

    async fn ring(&self) {
        let text = format!("The time is {}", chrono::Local::now().format("%H:%M"));
        let targets: Vec<(std::sync::Arc<dyn ResponseSink>, Source)> = {
            let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            subs.retain(|s| s.origin.strong_count() > 0);
            subs.iter()
                .filter_map(|s| s.origin.upgrade().map(|o| (o, s.source.clone())))
                .collect()
        };
        debug!(subscribers = targets.len(), "chime");
        for (sink, source) in targets {
            let cmd = Command::detached("chime", source).with_response(text.clone());
            sink.queue_response(cmd).await;
        }
    }
}

#[async_trait]
impl Plugin for Chime {
    fn name(&self) -> &str {
        "chime"
    }

    fn schedule(&self) -> BTreeSet<u32> {
        BTreeSet::from([0])
    }

    async fn execute(&self, cmd: Command, _facade: &DispatcherFacade) -> HandlerResult<Command> {
        if cmd.triggered_by == TriggeredBy::Timer {
            self.ring().await;
            return Ok(cmd);
        }
        let response = match cmd.args() {
            "on" => self.subscribe(&cmd)?,
            "off" => self.unsubscribe(&cmd),
            "" => format!("{} subscriber(s)", self.subscriber_count()),
            _ => return Err(HandlerError::usage("chime [on|off]")),
        };
        Ok(cmd.with_response(response))
    }
}
