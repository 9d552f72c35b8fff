//! Coarse timed work on the ship task: deferred shutdown/restart with
//! user-visible warnings, shipgate pings and ban pruning.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShutdownKind {
    Shutdown,
    Restart,
}

#[derive(Debug, Copy, Clone)]
struct PendingShutdown {
    kind: ShutdownKind,
    at: Instant,
    /// Next multiple-of-warning boundary we have not yet announced.
    next_warning: Option<Instant>,
}

/// What the ship loop should do after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// Tell everyone the ship goes down in about `minutes`.
    Warn { kind: ShutdownKind, minutes: u64 },
    /// Disconnect everyone and stop (or exec ourselves again).
    Execute(ShutdownKind),
}

const WARN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct Scheduler {
    pending: Mutex<Option<PendingShutdown>>,
}

impl Scheduler {
    /// Schedule a shutdown or restart `minutes` from now. Replaces any
    /// previously scheduled action. Zero minutes executes on the next
    /// tick.
    pub fn schedule(&self, kind: ShutdownKind, minutes: u64) {
        let now = Instant::now();
        let at = now + Duration::from_secs(minutes * 60);

        let next_warning = if minutes > 0 { Some(now) } else { None };

        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(PendingShutdown {
            kind,
            at,
            next_warning,
        });
    }

    pub fn cancel(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
    }

    pub fn is_scheduled(&self) -> Option<ShutdownKind> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|p| p.kind)
    }

    /// Advance the schedule; called periodically from the ship loop.
    pub fn tick(&self, now: Instant) -> Option<TickAction> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let p = pending.as_mut()?;

        if now >= p.at {
            let kind = p.kind;
            *pending = None;
            return Some(TickAction::Execute(kind));
        }

        if let Some(warn_at) = p.next_warning {
            if now >= warn_at {
                let remaining = p.at - now;
                let minutes = (remaining.as_secs() + 59) / 60;
                p.next_warning = Some(warn_at + WARN_INTERVAL);

                return Some(TickAction::Warn {
                    kind: p.kind,
                    minutes,
                });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_shutdown_executes_on_first_tick() {
        let s = Scheduler::default();
        s.schedule(ShutdownKind::Shutdown, 0);

        assert_eq!(
            s.tick(Instant::now()),
            Some(TickAction::Execute(ShutdownKind::Shutdown))
        );
        assert!(s.is_scheduled().is_none());
    }

    #[test]
    fn warnings_come_before_the_restart() {
        let s = Scheduler::default();
        s.schedule(ShutdownKind::Restart, 2);

        let now = Instant::now();
        match s.tick(now) {
            Some(TickAction::Warn { kind, minutes }) => {
                assert_eq!(kind, ShutdownKind::Restart);
                assert_eq!(minutes, 2);
            }
            other => panic!("expected a warning, got {:?}", other),
        }

        // Within the same warning window nothing new fires.
        assert_eq!(s.tick(now + Duration::from_secs(1)), None);

        // After the window, a fresh warning with less time left.
        match s.tick(now + Duration::from_secs(61)) {
            Some(TickAction::Warn { minutes, .. }) => assert_eq!(minutes, 1),
            other => panic!("expected a warning, got {:?}", other),
        }

        // Past the deadline, the action executes exactly once.
        assert_eq!(
            s.tick(now + Duration::from_secs(121)),
            Some(TickAction::Execute(ShutdownKind::Restart))
        );
        assert_eq!(s.tick(now + Duration::from_secs(122)), None);
    }

    #[test]
    fn cancel_clears_the_schedule() {
        let s = Scheduler::default();
        s.schedule(ShutdownKind::Shutdown, 5);
        assert!(s.cancel());
        assert!(!s.cancel());
        assert_eq!(s.tick(Instant::now()), None);
    }
}
