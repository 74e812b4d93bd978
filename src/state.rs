//! The PID file: the only thing a `stop` invocation knows about the services a `start`
//! invocation launched.
//!
//! The file holds a JSON array of `[name, pid]` pairs in launch order. Its mere existence
//! means a session is active. Nothing locks it, so two starts racing each other can both see
//! it absent; the existence check is a best-effort guard only.

use anyhow::{Context, Result};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use slog_scope::warn;
use std::convert::TryFrom;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A launched service, identified by the PID of its process group leader.
#[derive(Serialize, Deserialize)]
#[serde(try_from = "(String, i32)", into = "(String, i32)")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub name: String,
    pub pid: Pid,
}

impl ProcessRecord {
    pub fn new(name: impl Into<String>, pid: Pid) -> Self {
        ProcessRecord {
            name: name.into(),
            pid,
        }
    }
}

/// PIDs 0, 1 and negative ones address process groups or init rather than a service.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("service {name:?} has unusable PID {pid}")]
pub struct UnusablePid {
    pub name: String,
    pub pid: i32,
}

impl TryFrom<(String, i32)> for ProcessRecord {
    type Error = UnusablePid;

    fn try_from((name, pid): (String, i32)) -> Result<Self, Self::Error> {
        if pid <= 1 {
            return Err(UnusablePid { name, pid });
        }
        Ok(ProcessRecord::new(name, Pid::from_raw(pid)))
    }
}

impl From<ProcessRecord> for (String, i32) {
    fn from(record: ProcessRecord) -> Self {
        (record.name, record.pid.as_raw())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StateStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Replaces the file's contents with `records`. The document goes to a sibling file
    /// first and is then renamed into place, so readers never see half of it.
    pub fn write(&self, records: &[ProcessRecord]) -> Result<()> {
        let document = serde_json::to_vec(records).context("Could not serialize PID records")?;
        let staging = self.staging_path();
        fs::write(&staging, &document)
            .with_context(|| format!("Could not write PID file {:?}", &staging))?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("Could not move PID file into place at {:?}", &self.path))?;
        Ok(())
    }

    /// Returns the recorded processes. An absent, unreadable or malformed file all mean
    /// "no active session".
    pub fn read(&self) -> Vec<ProcessRecord> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return vec![],
            Err(e) => {
                warn!("could not read PID file"; "path" => ?self.path, "error" => %e);
                return vec![];
            }
        };
        match serde_json::from_slice(&contents) {
            Ok(records) => records,
            Err(e) => {
                warn!("ignoring malformed PID file"; "path" => ?self.path, "error" => %e);
                vec![]
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                Err(e).with_context(|| format!("Could not remove PID file {:?}", &self.path))
            }
            _ => Ok(()),
        }
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| OsString::from("pids"));
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
