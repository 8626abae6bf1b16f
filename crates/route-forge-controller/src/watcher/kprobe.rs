//! Kernel-probe backend placeholder

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use route_forge_common::{Error, Result, VmKey};

use super::Watcher;

/// Watcher that would observe `fib_table_insert`/`fib_table_delete` probes
///
/// Selecting it aborts startup.
#[derive(Debug, Default)]
pub struct KprobeWatcher;

impl KprobeWatcher {
    /// Create the backend
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Watcher for KprobeWatcher {
    fn name(&self) -> &'static str {
        "kprobe"
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<mpsc::Receiver<VmKey>> {
        error!(watcher = self.name(), "Kernel probe route watcher is not available in this build");
        Err(Error::not_implemented("kprobe route watcher"))
    }
}
