//! Resolver subprocess supervision.
//!
//! The bridge does not care how the resolver is launched, only whether it is
//! still alive and how to start a fresh incarnation that will connect back
//! with a given authentication value. [`SubprocessSupervisor`] captures that
//! contract; [`ProcessSupervisor`] implements it on top of `tokio::process`.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::process::{Child, Command};

use super::protocol::AuthEpoch;
use crate::config::SubprocessSettings;
use crate::error::{BridgeError, BridgeResult, LockResultExt};

/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Liveness and (re)spawn control over the resolver subprocess.
pub trait SubprocessSupervisor: Send + Sync {
    /// Whether the current incarnation is still running.
    fn is_alive(&self) -> bool;

    /// Start a new incarnation that connects to `port` and authenticates with `auth`.
    ///
    /// Any previous incarnation is terminated first.
    fn respawn(&self, port: u16, auth: AuthEpoch) -> BridgeResult<()>;

    /// Stop the current incarnation, if any.
    fn terminate(&self);
}

/// Supervises a resolver launched from a command template.
///
/// `{port}` and `{auth}` in the argument template are replaced with the
/// listening port and the decimal authentication value.
pub struct ProcessSupervisor {
    program: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl ProcessSupervisor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: Mutex::new(None),
        }
    }

    /// Build from settings; fails if no program is configured.
    pub fn from_settings(settings: &SubprocessSettings) -> BridgeResult<Self> {
        let program = settings
            .program
            .clone()
            .ok_or_else(|| BridgeError::config("subprocess.program is not set"))?;
        Ok(Self::new(program, settings.args.clone()))
    }

    fn render_args(&self, port: u16, auth: AuthEpoch) -> Vec<String> {
        let port = port.to_string();
        let auth = auth.as_u64().to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{port}", &port).replace("{auth}", &auth))
            .collect()
    }

    /// Process id of the current incarnation.
    pub fn pid(&self) -> Option<u32> {
        self.child
            .lock()
            .recover_poison("ProcessSupervisor::pid")
            .as_ref()
            .and_then(Child::id)
    }
}

impl SubprocessSupervisor for ProcessSupervisor {
    fn is_alive(&self) -> bool {
        let mut child = self.child.lock().recover_poison("ProcessSupervisor::is_alive");
        match child.as_mut() {
            Some(process) => matches!(process.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn respawn(&self, port: u16, auth: AuthEpoch) -> BridgeResult<()> {
        self.terminate();

        let args = self.render_args(port, auth);
        let process = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        info!(
            target: "resolver_bridge::restart",
            "Spawned resolver {} (pid {:?}) for port {}",
            self.program,
            process.id(),
            port
        );
        *self.child.lock().recover_poison("ProcessSupervisor::respawn") = Some(process);
        Ok(())
    }

    fn terminate(&self) {
        let Some(process) = self
            .child
            .lock()
            .recover_poison("ProcessSupervisor::terminate")
            .take()
        else {
            return;
        };
        terminate_with_escalation(process);
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// SIGTERM, then SIGKILL after the grace period (Unix); immediate kill elsewhere.
fn terminate_with_escalation(mut process: Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = process.id() {
            debug!(
                target: "resolver_bridge::restart",
                "Sending SIGTERM to resolver pid {}",
                pid
            );
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!(
                    target: "resolver_bridge::restart",
                    "Failed to send SIGTERM to {}: {}",
                    pid,
                    e
                ),
            }

            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if tokio::time::timeout(TERMINATE_GRACE, process.wait())
                        .await
                        .is_err()
                    {
                        debug!(
                            target: "resolver_bridge::restart",
                            "Resolver pid {} ignored SIGTERM, killing",
                            pid
                        );
                        let _ = process.kill().await;
                    }
                });
                return;
            }
        }
    }

    if let Err(e) = process.start_kill() {
        debug!(
            target: "resolver_bridge::restart",
            "Failed to kill resolver: {}",
            e
        );
    }
}
