//! Self-update: compare the published build with the running executable.
//!
//! The version of the daemon is its exact byte content.  When the published
//! bytes differ, they are written next to the install path and renamed over
//! it; the caller then re-executes the installed file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::host;

/// Result of one update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    Current,
    /// A new build was installed at the given path.
    Available(PathBuf),
}

pub struct SelfUpdater {
    url: String,
    install_path: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    running: Vec<u8>,
}

impl SelfUpdater {
    /// `running_exe` is read once; on Linux `/proc/self/exe` stays readable
    /// even after the file on disk has been replaced.
    pub fn new(
        url: impl Into<String>,
        install_path: impl Into<PathBuf>,
        running_exe: &Path,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        let running = std::fs::read(running_exe).map_err(|e| Error::io(running_exe, e))?;
        info!("Running build {}", short_digest(&running));
        Ok(Self {
            url: url.into(),
            install_path: install_path.into(),
            fetcher,
            running,
        })
    }

    pub fn running_bytes(&self) -> &[u8] {
        &self.running
    }

    pub async fn check(&self) -> Result<UpdateCheck> {
        let latest = match self.fetcher.fetch(&self.url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Self-update check failed, keeping current build: {}", e);
                return Ok(UpdateCheck::Current);
            }
        };

        if latest.is_empty() {
            warn!("Self-update source {} returned an empty body, ignoring", self.url);
            return Ok(UpdateCheck::Current);
        }
        if latest == self.running {
            debug!("Build {} is current", short_digest(&self.running));
            return Ok(UpdateCheck::Current);
        }

        info!(
            "New build available: {} -> {}",
            short_digest(&self.running),
            short_digest(&latest)
        );
        host::write_if_changed(&self.install_path, &latest, 0o755)?;
        Ok(UpdateCheck::Available(self.install_path.clone()))
    }
}

fn short_digest(bytes: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    format!("sha256:{}", &digest[..12])
}
