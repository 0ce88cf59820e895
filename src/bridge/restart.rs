//! Restart decisions on subprocess death.
//!
//! When the connector exhausts its retry ceiling it asks the
//! [`RestartCoordinator`] what to do. The coordinator checks whether the
//! subprocess is still alive, spends restart credit if it is not, and hands
//! the connector the epoch of the replacement incarnation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{info, warn};

use super::connector::Connector;
use super::protocol::AuthEpoch;
use super::subprocess::SubprocessSupervisor;
use crate::error::{BridgeError, BridgeResult};

/// What the coordinator did about an exhausted retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// A fresh incarnation was spawned with this epoch
    Restarted(AuthEpoch),
    /// Another caller already replaced the incarnation the failure was observed on
    AlreadyReplaced,
    /// The subprocess is alive (or unsupervised); the failure is transport-level
    StillAlive,
}

/// Decides whether and how to restart the resolver subprocess.
pub struct RestartCoordinator {
    budget: u32,
    restarts: AtomicU32,
    supervisor: Option<Arc<dyn SubprocessSupervisor>>,
    /// Serializes restart decisions so concurrent failures spend credit once
    restart_lock: tokio::sync::Mutex<()>,
}

impl RestartCoordinator {
    pub fn new(budget: u32, supervisor: Option<Arc<dyn SubprocessSupervisor>>) -> Self {
        Self {
            budget,
            restarts: AtomicU32::new(0),
            supervisor,
            restart_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Coordinator that never restarts and treats the peer as always alive.
    pub fn unsupervised() -> Self {
        Self::new(0, None)
    }

    pub fn supervisor(&self) -> Option<&Arc<dyn SubprocessSupervisor>> {
        self.supervisor.as_ref()
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Restarts spent since the last successful exchange.
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Acquire)
    }

    /// A successful exchange restores the full restart budget.
    pub fn record_success(&self) {
        self.restarts.store(0, Ordering::Release);
    }

    /// Handle an exhausted retry loop observed while `observed` was the live epoch.
    pub(crate) async fn recover(
        &self,
        connector: &Connector,
        observed: Option<AuthEpoch>,
    ) -> BridgeResult<Recovery> {
        let _guard = self.restart_lock.lock().await;

        if connector.live_epoch() != observed {
            return Ok(Recovery::AlreadyReplaced);
        }

        let Some(supervisor) = self.supervisor.as_ref() else {
            return Ok(Recovery::StillAlive);
        };
        if supervisor.is_alive() {
            return Ok(Recovery::StillAlive);
        }

        let restarts = self.restarts();
        if restarts >= self.budget {
            warn!(
                target: "resolver_bridge::restart",
                "Resolver subprocess died; restart budget {} exhausted",
                self.budget
            );
            return Err(BridgeError::SubprocessDeath {
                restarts,
                budget: self.budget,
            });
        }

        let epoch = AuthEpoch::generate();
        connector.expect_auth(epoch);
        supervisor.respawn(connector.port(), epoch)?;
        let used = self.restarts.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            target: "resolver_bridge::restart",
            "Restarted resolver subprocess with epoch {} ({} of {} restarts)",
            epoch,
            used,
            self.budget
        );
        Ok(Recovery::Restarted(epoch))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;

    /// Supervisor double that records respawns.
    #[derive(Default)]
    pub(crate) struct FakeSupervisor {
        pub(crate) alive: AtomicBool,
        pub(crate) spawned: Mutex<Vec<(u16, AuthEpoch)>>,
    }

    impl SubprocessSupervisor for FakeSupervisor {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn respawn(&self, port: u16, auth: AuthEpoch) -> BridgeResult<()> {
            self.spawned.lock().unwrap().push((port, auth));
            self.alive.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn terminate(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn record_success_restores_budget() {
        let coordinator = RestartCoordinator::new(2, None);
        coordinator.restarts.store(2, Ordering::SeqCst);
        coordinator.record_success();
        assert_eq!(coordinator.restarts(), 0);
    }

    #[test]
    fn unsupervised_coordinator_has_no_budget() {
        let coordinator = RestartCoordinator::unsupervised();
        assert_eq!(coordinator.budget(), 0);
        assert!(coordinator.supervisor().is_none());
    }
}
