//! Parsing of the remote port-mapping document.
//!
//! The document is plain UTF-8 text, one entry per line:
//!
//! ```text
//! # comment
//! 8080:80
//! 9090:9090
//! ```
//!
//! Blank lines and `#` comments are ignored.  Each remaining line must be
//! exactly `<host>:<container>` in decimal; anything else is reported and
//! skipped without failing the rest of the document.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use log::warn;
use regex::Regex;

use crate::error::Result;
use crate::supervisor::LaunchSource;
use crate::types::{LaunchExtras, PortMapping};

static MAPPING_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+):([0-9]+)$").expect("static regex"));

/// A line that was neither blank, a comment, nor a valid mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidLine {
    /// 1-based line number in the source document.
    pub number: usize,
    pub text: String,
}

/// The ordered mappings of one fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMappingSet {
    mappings: Vec<PortMapping>,
    invalid: Vec<InvalidLine>,
}

impl PortMappingSet {
    /// Parse a whole document.
    ///
    /// Lines are trimmed before matching, so indented comments and entries
    /// with surrounding whitespace are accepted.
    pub fn parse(document: &str) -> Self {
        let mut set = PortMappingSet::default();

        for (idx, raw) in document.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some(mapping) => set.mappings.push(mapping),
                None => {
                    let invalid = InvalidLine {
                        number: idx + 1,
                        text: line.to_string(),
                    };
                    warn!(
                        "Ignoring invalid port mapping on line {}: {:?}",
                        invalid.number, invalid.text
                    );
                    set.invalid.push(invalid);
                }
            }
        }

        set
    }

    /// Publish arguments in document order.
    pub fn mappings(&self) -> &[PortMapping] {
        &self.mappings
    }

    /// Host ports that must be held by the broker.
    pub fn host_ports(&self) -> BTreeSet<u16> {
        self.mappings.iter().map(|m| m.host_port).collect()
    }

    pub fn invalid_lines(&self) -> &[InvalidLine] {
        &self.invalid
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl LaunchSource for PortMappingSet {
    fn launch_extras(&self) -> Result<LaunchExtras> {
        Ok(LaunchExtras {
            ports: self.mappings.clone(),
            secret_env: None,
        })
    }
}

fn parse_line(line: &str) -> Option<PortMapping> {
    let caps = MAPPING_LINE.captures(line)?;
    Some(PortMapping {
        host_port: caps[1].parse().ok()?,
        container_port: caps[2].parse().ok()?,
    })
}
