//! Command handler contract and alias-resolving lookup table.

use crate::command::Command;
use crate::error::HandlerResult;
use crate::plugin::DispatcherFacade;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A built-in command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Canonical command name.
    fn name(&self) -> &str;

    /// Additional names resolving to this handler.
    fn aliases(&self) -> &[&str] {
        &[]
    }

    /// One-line usage text.
    fn description(&self) -> &str {
        ""
    }

    /// Produce the response text for `cmd`.
    async fn handle(&self, cmd: &Command, facade: &DispatcherFacade) -> HandlerResult<String>;
}

/// Anything that can sit in an [`AliasTable`].
pub trait Named {
    /// Canonical name.
    fn canonical(&self) -> &str;
    /// Alternate names.
    fn alternates(&self) -> Vec<String>;
}

impl Named for dyn CommandHandler {
    fn canonical(&self) -> &str {
        self.name()
    }

    fn alternates(&self) -> Vec<String> {
        self.aliases().iter().map(ToString::to_string).collect()
    }
}

/// Canonical-name table with aliases resolved once, at registration.
pub struct AliasTable<T: ?Sized> {
    entries: HashMap<String, Arc<T>>,
    aliases: HashMap<String, String>,
}

impl<T: ?Sized> Default for AliasTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            aliases: HashMap::new(),
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for AliasTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliasTable")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .field("aliases", &self.aliases)
            .finish()
    }
}

impl<T: Named + ?Sized> AliasTable<T> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `entry`. Returns `false` and keeps the existing entry when the
    /// canonical name is taken; clashing aliases are skipped.
    pub fn register(&mut self, entry: Arc<T>) -> bool {
        let name = entry.canonical().to_lowercase();
        if self.resolves(&name) {
            warn!(%name, "command name already registered");
            return false;
        }
        for alias in entry.alternates() {
            let alias = alias.to_lowercase();
            if alias == name || self.resolves(&alias) {
                warn!(%name, %alias, "alias already taken");
                continue;
            }
            self.aliases.insert(alias, name.clone());
        }
        debug!(%name, "command registered");
        self.entries.insert(name, entry);
        true
    }

    fn resolves(&self, name: &str) -> bool {
        self.entries.contains_key(name) || self.aliases.contains_key(name)
    }

    /// Look up a case-folded name or alias.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        let name = name.to_lowercase();
        let canonical = self.aliases.get(&name).unwrap_or(&name);
        self.entries.get(canonical).cloned()
    }

    /// Canonical names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every entry.
    pub fn values(&self) -> impl Iterator<Item = &Arc<T>> {
        self.entries.values()
    }

    /// Number of canonical entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Built-in handler table.
pub type HandlerTable = AliasTable<dyn CommandHandler>;

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str, &'static [&'static str]);

    #[async_trait]
    impl CommandHandler for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn aliases(&self) -> &[&str] {
            self.1
        }

        async fn handle(&self, _cmd: &Command, _facade: &DispatcherFacade) -> HandlerResult<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_aliases_resolve_to_canonical() {
        let mut table = HandlerTable::new();
        assert!(table.register(Arc::new(Fixed("help", &["commands", "?"]))));
        assert_eq!(table.get("COMMANDS").unwrap().name(), "help");
        assert_eq!(table.get("?").unwrap().name(), "help");
        assert_eq!(table.names(), vec!["help"]);
        assert!(table.get("nope").is_none());
    }

    #[test]
    fn test_conflicts_keep_first() {
        let mut table = HandlerTable::new();
        table.register(Arc::new(Fixed("echo", &["say"])));
        assert!(!table.register(Arc::new(Fixed("say", &[]))));
        assert!(table.register(Arc::new(Fixed("shout", &["say", "yell"]))));
        assert_eq!(table.get("say").unwrap().name(), "echo");
        assert_eq!(table.get("yell").unwrap().name(), "shout");
        assert_eq!(table.len(), 2);
    }
}
