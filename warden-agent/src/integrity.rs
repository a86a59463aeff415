//! Configuration file integrity
//!
//! The config is hashed (SHA-256) when the agent starts. Each cycle re-hashes
//! it; every new digest that differs from the baseline is reported once.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityViolation {
    pub path: PathBuf,
    pub expected: String,
    /// `None` when the file can no longer be read
    pub actual: Option<String>,
}

impl IntegrityViolation {
    pub fn reason(&self) -> String {
        match &self.actual {
            Some(actual) => format!("sha256 changed from {} to {}", self.expected, actual),
            None => format!("file unreadable, expected sha256 {}", self.expected),
        }
    }
}

pub struct IntegrityMonitor {
    path: PathBuf,
    baseline: String,
    reported: HashSet<Option<String>>,
}

impl IntegrityMonitor {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            baseline: sha256_file(path)?,
            reported: HashSet::new(),
        })
    }

    pub fn baseline(&self) -> &str {
        &self.baseline
    }

    /// A violation the first time each distinct changed digest is seen
    pub fn check(&mut self) -> Option<IntegrityViolation> {
        let actual = sha256_file(&self.path).ok();
        if actual.as_deref() == Some(self.baseline.as_str()) {
            return None;
        }
        if !self.reported.insert(actual.clone()) {
            return None;
        }
        warn!(path = %self.path.display(), "configuration file changed since startup");
        Some(IntegrityViolation {
            path: self.path.clone(),
            expected: self.baseline.clone(),
            actual,
        })
    }
}
