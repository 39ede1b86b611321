//! Access log management and the outlier event log.
//!
//! The [AccessLogManager] hands out shared append handles by path, reusing a
//! handle when the same path is opened twice. The outlier event logger writes
//! ejection state changes as JSON lines through one of those handles.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use trellis_api::Name;

use crate::{Error, Result};

/// A shared append-only log file handle.
#[derive(Clone, Debug)]
pub struct AccessLogHandle {
    file: Arc<Mutex<File>>,
}

impl AccessLogHandle {
    /// Append one line. The trailing newline is added here.
    pub fn write_line(&self, line: &str) {
        let mut file = self.file.lock().unwrap();
        if let Err(e) = writeln!(file, "{line}") {
            tracing::warn!(err = %e, "access log write failed");
        }
    }
}

/// Opens and caches access log files by path.
#[derive(Clone, Debug, Default)]
pub struct AccessLogManager {
    logs: Arc<Mutex<HashMap<String, AccessLogHandle>>>,
}

impl AccessLogManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_access_log(&self, path: &str) -> Result<AccessLogHandle> {
        let mut logs = self.logs.lock().unwrap();
        if let Some(handle) = logs.get(path) {
            return Ok(handle.clone());
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(Error::Io)?;
        let handle = AccessLogHandle {
            file: Arc::new(Mutex::new(file)),
        };
        logs.insert(path.to_string(), handle.clone());
        Ok(handle)
    }
}

/// The kind of outlier state change being logged.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierEventKind {
    Eject,
    Uneject,
}

#[derive(Debug, Serialize)]
struct OutlierEvent<'a> {
    cluster: &'a str,
    host: SocketAddr,
    event: OutlierEventKind,
}

/// Writes outlier ejection events to an access log as JSON lines.
#[derive(Clone, Debug)]
pub struct OutlierEventLogger {
    log: AccessLogHandle,
}

impl OutlierEventLogger {
    pub fn new(log: AccessLogHandle) -> Self {
        Self { log }
    }

    pub fn log_event(&self, cluster: &Name, host: SocketAddr, event: OutlierEventKind) {
        let event = OutlierEvent {
            cluster: cluster.as_str(),
            host,
            event,
        };
        match serde_json::to_string(&event) {
            Ok(line) => self.log.write_line(&line),
            Err(e) => tracing::warn!(err = %e, "failed to encode outlier event"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_create_access_log_reuses_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let path = path.to_str().unwrap();

        let manager = AccessLogManager::new();
        let a = manager.create_access_log(path).unwrap();
        let b = manager.create_access_log(path).unwrap();

        a.write_line("one");
        b.write_line("two");

        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents, "one\ntwo\n");
    }

    #[test]
    fn test_outlier_event_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outliers.log");
        let path = path.to_str().unwrap();

        let manager = AccessLogManager::new();
        let logger = OutlierEventLogger::new(manager.create_access_log(path).unwrap());
        logger.log_event(
            &Name::from_static("cluster_1"),
            "127.0.0.1:8080".parse().unwrap(),
            OutlierEventKind::Eject,
        );

        let contents = std::fs::read_to_string(path).unwrap();
        let event: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(event["cluster"], "cluster_1");
        assert_eq!(event["event"], "eject");
    }
}
