//! The command event contract.
//!
//! Every compiled-and-executed command emits one event, successful or not.
//! The hub is shared by reference across a context lineage; sharing one hub
//! across several root contexts observes every operation on the executor.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use trellis_core::SqlValue;

use crate::executor::{Command, CommandKind};

/// A record of one executed command.
#[derive(Debug, Clone)]
pub struct CommandEvent {
    /// When the command finished.
    pub at: DateTime<Utc>,
    /// Command kind.
    pub kind: CommandKind,
    /// Main table of the issuing context.
    pub table: String,
    /// Command with arguments interpolated for human-readable output only, never
    /// executed.
    pub raw: String,
    /// Parameterized command text as executed.
    pub sanitized: String,
    /// Positional arguments.
    pub args: Vec<SqlValue>,
    /// Affected or returned row count, when the command succeeded.
    pub affected: Option<u64>,
    /// Error description, when the command failed.
    pub error: Option<String>,
}

impl CommandEvent {
    pub(crate) fn finished(cmd: &Command, affected: Option<u64>, error: Option<String>) -> Self {
        Self {
            at: Utc::now(),
            kind: cmd.kind,
            table: cmd.table.clone(),
            raw: cmd.interpolated(),
            sanitized: cmd.text.clone(),
            args: cmd.args.clone(),
            affected,
            error,
        }
    }
}

type Callback = Arc<dyn Fn(&CommandEvent) + Send + Sync>;

struct Subscriber {
    kind: Option<CommandKind>,
    callback: Callback,
}

/// Fan-out of command events to subscribers.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a callback; `kind` of `None` receives every event.
    pub fn subscribe(
        &self,
        kind: Option<CommandKind>,
        callback: impl Fn(&CommandEvent) + Send + Sync + 'static,
    ) {
        self.subscribers
            .lock()
            .expect("event hub lock poisoned")
            .push(Subscriber {
                kind,
                callback: Arc::new(callback),
            });
    }

    /// Delivers an event to every matching subscriber.
    pub fn emit(&self, event: &CommandEvent) {
        let callbacks: Vec<Callback> = {
            let subscribers = self.subscribers.lock().expect("event hub lock poisoned");
            subscribers
                .iter()
                .filter(|s| s.kind.is_none() || s.kind == Some(event.kind))
                .map(|s| Arc::clone(&s.callback))
                .collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .subscribers
            .lock()
            .map(|s| s.len())
            .unwrap_or_default();
        f.debug_struct("EventHub")
            .field("subscribers", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: CommandKind) -> CommandEvent {
        CommandEvent::finished(
            &Command {
                kind,
                table: String::from("t"),
                text: String::from("DELETE FROM t WHERE a = ?"),
                args: vec![SqlValue::Int(1)],
            },
            Some(1),
            None,
        )
    }

    #[test]
    fn kind_filter_applies() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let all = Arc::clone(&seen);
        hub.subscribe(None, move |e| all.lock().unwrap().push(("all", e.kind)));
        let deletes = Arc::clone(&seen);
        hub.subscribe(Some(CommandKind::Delete), move |e| {
            deletes.lock().unwrap().push(("del", e.kind));
        });

        hub.emit(&sample(CommandKind::Query));
        hub.emit(&sample(CommandKind::Delete));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("all", CommandKind::Query),
                ("all", CommandKind::Delete),
                ("del", CommandKind::Delete),
            ]
        );
    }

    #[test]
    fn event_carries_raw_and_sanitized_forms() {
        let event = sample(CommandKind::Delete);
        assert_eq!(event.sanitized, "DELETE FROM t WHERE a = ?");
        assert_eq!(event.raw, "DELETE FROM t WHERE a = 1");
        assert_eq!(event.affected, Some(1));
        assert!(event.error.is_none());
    }
}
