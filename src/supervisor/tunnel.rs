use std::fs;
use std::path::PathBuf;

use super::LaunchSource;
use crate::error::{Error, Result};
use crate::types::{LaunchExtras, Secret};

/// Reads the tunnel token from its secret file on every start.
pub struct TunnelToken {
    path: PathBuf,
    env_var: String,
}

impl TunnelToken {
    pub fn new(path: impl Into<PathBuf>, env_var: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            env_var: env_var.into(),
        }
    }

    pub fn read(&self) -> Result<Secret> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingSecret(self.path.clone()))
            }
            Err(e) => return Err(Error::io(&self.path, e)),
        };
        let token = raw.trim();
        if token.is_empty() {
            return Err(Error::MissingSecret(self.path.clone()));
        }
        Ok(Secret::new(token))
    }
}

impl LaunchSource for TunnelToken {
    fn launch_extras(&self) -> Result<LaunchExtras> {
        Ok(LaunchExtras {
            ports: Vec::new(),
            secret_env: Some((self.env_var.clone(), self.read()?)),
        })
    }
}
