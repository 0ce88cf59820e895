//! Detached shutdown of the live connection.
//!
//! [`super::Connector::detach`] hands the live connection to a
//! [`ShutdownHelper`] so the owner can abandon the connector without waiting
//! for the peer to acknowledge the close.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;

use super::LiveConnection;

/// Handle to the task closing a detached connection.
///
/// The task runs to completion whether or not the handle is joined.
pub struct ShutdownHelper {
    join_handle: JoinHandle<bool>,
}

impl ShutdownHelper {
    pub(super) fn spawn(live: Option<Arc<LiveConnection>>, timeout: Duration) -> Self {
        let join_handle = tokio::spawn(async move {
            let Some(connection) = live else {
                return true;
            };
            let closing = async {
                let mut writer = connection.writer.lock().await;
                writer.shutdown().await
            };
            match tokio::time::timeout(timeout, closing).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "resolver_bridge::connector",
                        "Connection {} shut down",
                        connection.generation
                    );
                    true
                }
                Ok(Err(e)) => {
                    debug!(
                        target: "resolver_bridge::connector",
                        "Connection {} shutdown failed: {}",
                        connection.generation,
                        e
                    );
                    false
                }
                Err(_) => {
                    warn!(
                        target: "resolver_bridge::connector",
                        "Connection {} shutdown timed out after {:?}",
                        connection.generation,
                        timeout
                    );
                    false
                }
            }
        });
        Self { join_handle }
    }

    /// Wait for the close to finish; `true` if the write half shut down cleanly.
    pub async fn join(self) -> bool {
        self.join_handle.await.unwrap_or(false)
    }
}
