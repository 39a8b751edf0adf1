//! Built-in commands.

use crate::command::Command;
use crate::error::{HandlerError, HandlerResult};
use crate::handler::{CommandHandler, HandlerTable};
use crate::plugin::DispatcherFacade;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Repeats its arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "echo <text>: repeat text"
    }

    async fn handle(&self, cmd: &Command, _facade: &DispatcherFacade) -> HandlerResult<String> {
        let text = cmd.args();
        if text.is_empty() {
            return Err(HandlerError::usage(self.description()));
        }
        Ok(text.to_string())
    }
}

/// Liveness check.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

#[async_trait]
impl CommandHandler for Ping {
    fn name(&self) -> &str {
        "ping"
    }

    fn description(&self) -> &str {
        "ping: check the bot is alive"
    }

    async fn handle(&self, _cmd: &Command, _facade: &DispatcherFacade) -> HandlerResult<String> {
        Ok("pong".to_string())
    }
}

/// Lists the available commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct Help;

#[async_trait]
impl CommandHandler for Help {
    fn name(&self) -> &str {
        "help"
    }

    fn aliases(&self) -> &[&str] {
        &["commands"]
    }

    fn description(&self) -> &str {
        "help: list commands"
    }

    async fn handle(&self, _cmd: &Command, facade: &DispatcherFacade) -> HandlerResult<String> {
        Ok(format!("commands: {}", facade.command_names().join(", ")))
    }
}

/// Time since startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uptime;

#[async_trait]
impl CommandHandler for Uptime {
    fn name(&self) -> &str {
        "uptime"
    }

    fn description(&self) -> &str {
        "uptime: time since startup"
    }

    async fn handle(&self, _cmd: &Command, facade: &DispatcherFacade) -> HandlerResult<String> {
        Ok(format!("up {}", format_duration(facade.uptime())))
    }
}

/// Package name and version.
#[derive(Debug, Clone, Copy, Default)]
pub struct Version;

#[async_trait]
impl CommandHandler for Version {
    fn name(&self) -> &str {
        "version"
    }

    fn description(&self) -> &str {
        "version: show the bot version"
    }

    async fn handle(&self, _cmd: &Command, _facade: &DispatcherFacade) -> HandlerResult<String> {
        Ok(format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
    }
}

/// Render a duration as `1d 2h 3m 4s`, omitting leading zero units.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (days, hours, minutes, seconds) = (secs / 86_400, secs / 3600 % 24, secs / 60 % 60, secs % 60);
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if days > 0 || hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if days > 0 || hours > 0 || minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{seconds}s"));
    parts.join(" ")
}

/// Table holding every built-in command.
#[must_use]
pub fn builtin_table() -> HandlerTable {
    let mut table = HandlerTable::new();
    table.register(Arc::new(Echo));
    table.register(Arc::new(Ping));
    table.register(Arc::new(Help));
    table.register(Arc::new(Uptime));
    table.register(Arc::new(Version));
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::CommandQueue;

    fn facade() -> DispatcherFacade {
        DispatcherFacade::new(Arc::new(CommandQueue::new()), vec!["echo".into(), "ping".into()])
    }

    #[tokio::test]
    async fn test_echo() {
        let out = Echo.handle(&Command::timer("echo hi there"), &facade()).await.unwrap();
        assert_eq!(out, "hi there");
        assert!(matches!(
            Echo.handle(&Command::timer("echo"), &facade()).await,
            Err(HandlerError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn test_help_lists_names() {
        let out = Help.handle(&Command::timer("help"), &facade()).await.unwrap();
        assert_eq!(out, "commands: echo, ping");
    }

    #[test]
    fn test_builtin_table_aliases() {
        let table = builtin_table();
        assert_eq!(table.len(), 5);
        assert_eq!(table.get("commands").unwrap().name(), "help");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
        assert_eq!(format_duration(Duration::from_secs(90_061)), "1d 1h 1m 1s");
    }
}
