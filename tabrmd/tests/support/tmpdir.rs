use std::path::Path;

use anyhow::Context;
use tempfile::TempDir;

/// RAII scratch directory, removed on drop unless `TABRMD_LEAVE_TEST_LOGS` is
/// set (handy for inspecting a failed test's socket/log files afterward).
pub struct Dir {
    inner: Option<TempDir>,
}

impl Dir {
    pub fn new<P: AsRef<Path>>(parent: P) -> anyhow::Result<Self> {
        let inner = tempfile::Builder::new()
            .prefix("tabrmd-test-")
            .tempdir_in(parent)
            .context("creating scratch dir")?;
        Ok(Dir { inner: Some(inner) })
    }

    pub fn path(&self) -> &Path {
        self.inner.as_ref().expect("Dir used after drop").path()
    }
}

impl Drop for Dir {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if std::env::var("TABRMD_LEAVE_TEST_LOGS").unwrap_or_default() == "true" {
                let _ = inner.keep();
            }
        }
    }
}
