//! Connection monitor: per-bundle health checks and the reconnect loop.
//!
//! Runs entirely as state-loop timer events, so every tick re-reads current
//! registry state and exits quietly if the bundle was unloaded mid-cycle.
//! Sequence on loss: broadcast `disconnected`, connect, settle, re-check;
//! on success wait (bounded) for remote-origin traffic on the root before
//! broadcasting `reconnected`; on failure back off exponentially.

use spacedock_daemon::RetryDecision;
use spacedock_surface::ipc::Notification;

use super::core::Daemon;
use super::registry::LinkPhase;
use super::server::ServerEvent;
use super::{LauncherBundleId, TimerKey, WatchSignal, WatchSink};
use crate::store::{ChangeEvent, ChangeOrigin};

impl Daemon {
    pub(crate) fn handle_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::HealthTick(id) => self.health_tick(id),
            TimerKey::SettleCheck(id) => self.settle_check(id),
            TimerKey::ReconnectProbe(id) => self.reconnect_probe(id),
            TimerKey::ResyncDeadline(id) => self.resync_deadline(id),
            TimerKey::LoadSyncDeadline(id) => self.activate_bundle(id),
        }
    }

    /// Periodic `is_connected` poll.
    fn health_tick(&mut self, id: LauncherBundleId) {
        let Ok(active) = self.registry.active(&id) else {
            return;
        };
        if !matches!(active.link, LinkPhase::Healthy) {
            // Reconnect machinery owns the timers in the other phases.
            return;
        }

        if active.store.is_connected() {
            let interval = self.config.connection.health_check_interval();
            self.schedule_in(TimerKey::HealthTick(id), interval);
            return;
        }

        tracing::warn!(bundle = %id, "connection lost");
        self.begin_reconnect(id);
    }

    /// First (or next) reconnect attempt: connect, then settle-check.
    fn begin_reconnect(&mut self, id: LauncherBundleId) {
        let (was_healthy, attempt) = {
            let Ok(active) = self.registry.active_mut(&id) else {
                return;
            };
            let was_healthy = active.health.note_lost();
            active.link = LinkPhase::Reconnecting;
            let attempt = active.health.start_attempt();
            let ws_url = active.ws_url.clone();
            if let Err(err) = active.store.connect_websocket(&ws_url) {
                tracing::debug!(bundle = %id, attempt, "connect attempt failed: {err}");
            }
            (was_healthy, attempt)
        };

        if was_healthy {
            self.broadcast(Notification::Disconnected {
                launcher_bundle_id: id.to_string(),
            });
        }
        self.broadcast(Notification::Reconnecting {
            launcher_bundle_id: id.to_string(),
            attempt,
        });
        let settle = self.config.connection.settle_delay();
        self.schedule_in(TimerKey::SettleCheck(id), settle);
    }

    /// Re-check the link after the settle delay.
    fn settle_check(&mut self, id: LauncherBundleId) {
        let connected = {
            let Ok(active) = self.registry.active(&id) else {
                return;
            };
            if !matches!(active.link, LinkPhase::Reconnecting) {
                return;
            }
            active.store.is_connected()
        };

        if connected {
            self.begin_resync(id);
            return;
        }

        let decision = {
            let Ok(active) = self.registry.active_mut(&id) else {
                return;
            };
            active.health.attempt_failed()
        };
        match decision {
            RetryDecision::RetryAfter(delay) => {
                tracing::debug!(bundle = %id, ?delay, "reconnect backoff");
                self.schedule_in(TimerKey::ReconnectProbe(id), delay);
            }
            RetryDecision::GiveUp => {
                let attempts = self.config.connection.max_reconnect_attempts;
                tracing::warn!(bundle = %id, attempts, "reconnection abandoned");
                if let Ok(active) = self.registry.active_mut(&id) {
                    active.link = LinkPhase::Failed;
                }
                self.broadcast(Notification::ReconnectionFailed {
                    launcher_bundle_id: id.to_string(),
                    attempts,
                });
            }
        }
    }

    /// Backoff expired; try again.
    fn reconnect_probe(&mut self, id: LauncherBundleId) {
        let attempt = {
            let Ok(active) = self.registry.active_mut(&id) else {
                return;
            };
            if !matches!(active.link, LinkPhase::Reconnecting) {
                return;
            }
            let attempt = active.health.start_attempt();
            let ws_url = active.ws_url.clone();
            if let Err(err) = active.store.connect_websocket(&ws_url) {
                tracing::debug!(bundle = %id, attempt, "connect attempt failed: {err}");
            }
            attempt
        };

        self.broadcast(Notification::Reconnecting {
            launcher_bundle_id: id.to_string(),
            attempt,
        });
        let settle = self.config.connection.settle_delay();
        self.schedule_in(TimerKey::SettleCheck(id), settle);
    }

    /// Link is back: wait for at least one remote-origin change on the root
    /// before trusting listings again. Bounded by the resync deadline.
    fn begin_resync(&mut self, id: LauncherBundleId) {
        let probe_result = {
            let Ok(active) = self.registry.active_mut(&id) else {
                return;
            };
            let tx = self.event_tx.clone();
            let bundle = id.clone();
            let callback: crate::store::WatchCallback = Box::new(move |event| {
                let _ = tx.send(ServerEvent::Watch(WatchSignal {
                    bundle: bundle.clone(),
                    sink: WatchSink::SyncProbe,
                    event,
                }));
            });
            match active.store.watch_directory("/", callback) {
                Ok(probe) => {
                    active.link = LinkPhase::Resync { probe: Some(probe) };
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };

        match probe_result {
            Ok(()) => {
                let timeout = self.config.connection.pathindex_sync_timeout();
                self.schedule_in(TimerKey::ResyncDeadline(id), timeout);
            }
            Err(err) => {
                // Cannot observe the path index; declare recovery anyway
                // rather than wedging the monitor.
                tracing::warn!(bundle = %id, "resync probe unavailable: {err}");
                if let Ok(active) = self.registry.active_mut(&id) {
                    active.link = LinkPhase::Resync { probe: None };
                }
                self.complete_recovery(id);
            }
        }
    }

    /// Resync window closed without remote traffic; proceed regardless.
    fn resync_deadline(&mut self, id: LauncherBundleId) {
        let in_resync = self
            .registry
            .active(&id)
            .map(|active| matches!(active.link, LinkPhase::Resync { .. }))
            .unwrap_or(false);
        if in_resync {
            tracing::debug!(bundle = %id, "resync window closed without remote traffic");
            self.complete_recovery(id);
        }
    }

    /// A sync-probe change event: activation for Loading bundles, resync
    /// completion for reconnecting ones. Local echoes don't count.
    pub(crate) fn handle_sync_probe(&mut self, id: LauncherBundleId, event: ChangeEvent) {
        if event.origin != ChangeOrigin::Remote {
            return;
        }
        enum ProbeAction {
            Activate,
            Recover,
            Ignore,
        }
        let action = match self.registry.get(&id) {
            Some(super::registry::BundleState::Loading(_)) => ProbeAction::Activate,
            Some(super::registry::BundleState::Active(active))
                if matches!(active.link, LinkPhase::Resync { .. }) =>
            {
                ProbeAction::Recover
            }
            _ => ProbeAction::Ignore,
        };
        match action {
            ProbeAction::Activate => self.activate_bundle(id),
            ProbeAction::Recover => self.complete_recovery(id),
            ProbeAction::Ignore => {}
        }
    }

    fn complete_recovery(&mut self, id: LauncherBundleId) {
        self.timers.cancel(&TimerKey::ResyncDeadline(id.clone()));
        {
            let Ok(active) = self.registry.active_mut(&id) else {
                return;
            };
            let link = std::mem::replace(&mut active.link, LinkPhase::Healthy);
            if let LinkPhase::Resync { probe: Some(probe) } = link
                && let Err(err) = probe.stop()
            {
                tracing::warn!(bundle = %id, "resync probe stop failed: {err}");
            }
            active.health.note_recovered();
        }

        tracing::info!(bundle = %id, "connection recovered");
        self.broadcast(Notification::Reconnected {
            launcher_bundle_id: id.to_string(),
        });
        let interval = self.config.connection.health_check_interval();
        self.schedule_in(TimerKey::HealthTick(id), interval);
    }
}
