//! Script hook points.
//!
//! The core exposes a table of named events; whatever scripting frontend
//! the build carries registers hooks here. Hooks receive structured
//! arguments and may claim the event, suppressing the default handling
//! (that is how custom /commands get implemented out of core).

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScriptAction {
    ClientLogin,
    ClientLogout,
    TeamCreate,
    TeamDestroy,
    TeamJoin,
    TeamLeave,
    QuestLoad,
    UnknownCommand,
    ShipgateData,
}

/// Arguments handed to a hook. Strings and integers cover what the event
/// sites produce; opaque ids stand in for object references.
#[derive(Debug, Clone)]
pub enum ScriptArg {
    Int(i64),
    Uint(u64),
    Str(String),
    /// A client's guildcard, as a stable handle.
    Client(u32),
    /// A lobby id on some block.
    Lobby(u32),
}

/// What a hook did with the event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HookResult {
    /// Continue with default handling.
    Pass,
    /// The hook consumed the event.
    Handled,
}

pub type Hook = Box<dyn Fn(&[ScriptArg]) -> HookResult + Send + Sync>;

#[derive(Default)]
pub struct HookTable {
    hooks: RwLock<HashMap<ScriptAction, Vec<Hook>>>,
}

impl HookTable {
    pub fn register(&self, action: ScriptAction, hook: Hook) {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(action)
            .or_default()
            .push(hook);
    }

    /// Run the hooks for an event in registration order. The first one to
    /// claim the event wins.
    pub fn execute(&self, action: ScriptAction, args: &[ScriptArg]) -> HookResult {
        let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());

        if let Some(list) = hooks.get(&action) {
            for hook in list {
                if hook(args) == HookResult::Handled {
                    return HookResult::Handled;
                }
            }
        }

        HookResult::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn unregistered_events_pass() {
        let table = HookTable::default();
        assert_eq!(table.execute(ScriptAction::TeamCreate, &[]), HookResult::Pass);
    }

    #[test]
    fn a_handling_hook_stops_the_chain() {
        let table = HookTable::default();
        let calls = Arc::new(AtomicU32::new(0));

        let c1 = calls.clone();
        table.register(
            ScriptAction::UnknownCommand,
            Box::new(move |_| {
                c1.fetch_add(1, Ordering::SeqCst);
                HookResult::Handled
            }),
        );

        let c2 = calls.clone();
        table.register(
            ScriptAction::UnknownCommand,
            Box::new(move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
                HookResult::Pass
            }),
        );

        let args = [ScriptArg::Str("/frobnicate".into()), ScriptArg::Client(99)];
        assert_eq!(
            table.execute(ScriptAction::UnknownCommand, &args),
            HookResult::Handled
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hooks_see_their_arguments() {
        let table = HookTable::default();

        table.register(
            ScriptAction::TeamJoin,
            Box::new(|args| {
                match (&args[0], &args[1]) {
                    (ScriptArg::Client(gc), ScriptArg::Lobby(id)) => {
                        assert_eq!(*gc, 1234);
                        assert_eq!(*id, 0x20);
                    }
                    _ => panic!("wrong argument shapes"),
                }
                HookResult::Pass
            }),
        );

        table.execute(
            ScriptAction::TeamJoin,
            &[ScriptArg::Client(1234), ScriptArg::Lobby(0x20)],
        );
    }
}
