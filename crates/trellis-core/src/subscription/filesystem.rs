//! Filesystem subscriptions.
//!
//! Watches a path whose contents are a single discovery document holding the
//! full resource list. The file is expected to be atomically replaced;
//! replacement shows up as a metadata change, which triggers a re-read.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;

use super::{
    DiscoveryDocument, Resource, SubscriptionCallbacks, SubscriptionError, SubscriptionStats,
};

pub struct FilesystemSubscription<R> {
    path: PathBuf,
    poll_interval: Duration,
    stats: SubscriptionStats,
    task: Option<JoinHandle<()>>,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Resource> FilesystemSubscription<R> {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration, stats: SubscriptionStats) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            stats,
            task: None,
            _marker: PhantomData,
        }
    }

    pub(super) fn start(
        &mut self,
        _initial_resources: Vec<String>,
        mut callbacks: Box<dyn SubscriptionCallbacks<R>>,
    ) {
        let path = self.path.clone();
        let stats = self.stats.clone();
        let poll_interval = self.poll_interval;

        self.task = Some(tokio::spawn(async move {
            // read immediately in case the file is already there
            refresh(&path, &stats, callbacks.as_mut());
            let mut last_stamp = file_stamp(&path);

            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let stamp = file_stamp(&path);
                if stamp != last_stamp {
                    last_stamp = stamp;
                    refresh(&path, &stats, callbacks.as_mut());
                }
            }
        }));
    }

    // the watched file always reports all resources
    pub(super) fn update_resources(&mut self, _resources: Vec<String>) {}
}

impl<R> Drop for FilesystemSubscription<R> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The (mtime, len) pair used to notice atomic replacement of the watched
/// file. `None` while the file doesn't exist.
fn file_stamp(path: &Path) -> Option<(SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

/// Re-read the watched file and push its contents at the consumer, counting
/// the outcome.
pub(crate) fn refresh<R: Resource>(
    path: &Path,
    stats: &SubscriptionStats,
    callbacks: &mut dyn SubscriptionCallbacks<R>,
) {
    tracing::debug!(path = %path.display(), "filesystem config refresh");
    stats.update_attempt.inc();

    let (_version, resources) = match read_document(path) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::warn!(path = %path.display(), err = %e, "filesystem config update failure");
            stats.update_failure.inc();
            callbacks.on_config_update_failed(&e);
            return;
        }
    };

    match callbacks.on_config_update(resources) {
        Ok(()) => {
            stats.update_success.inc();
        }
        Err(rejection) => {
            tracing::warn!(path = %path.display(), reason = %rejection, "filesystem config update rejected");
            stats.update_rejected.inc();
            let error = SubscriptionError::Rejected(rejection.to_string());
            callbacks.on_config_update_failed(&error);
        }
    }
}

fn read_document<R: Resource>(path: &Path) -> Result<(String, Vec<R>), SubscriptionError> {
    let data = std::fs::read_to_string(path)?;
    let document: DiscoveryDocument =
        serde_json::from_str(&data).map_err(|e| SubscriptionError::Decode(e.to_string()))?;
    document.decode()
}

#[cfg(test)]
mod test {
    use super::super::test_util::RecordingCallbacks;
    use super::*;
    use crate::stats::Store;
    use trellis_api::ClusterSpec;

    fn stats() -> (Store, SubscriptionStats) {
        let store = Store::new();
        let stats = SubscriptionStats::new(&store.scope("cluster_manager.cds."));
        (store, stats)
    }

    fn write_document(path: &Path, resources: serde_json::Value) {
        let doc = serde_json::json!({"version_info": "1", "resources": resources});
        std::fs::write(path, serde_json::to_string(&doc).unwrap()).unwrap();
    }

    #[test]
    fn test_refresh_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cds.json");
        write_document(
            &path,
            serde_json::json!([
                {"name": "cluster_1", "type": "static", "hosts": [{"url": "tcp://127.0.0.1:80"}]},
            ]),
        );

        let (_store, stats) = stats();
        let mut callbacks = RecordingCallbacks::default();
        refresh::<ClusterSpec>(&path, &stats, &mut callbacks);

        assert_eq!(stats.update_attempt.value(), 1);
        assert_eq!(stats.update_success.value(), 1);
        assert_eq!(stats.update_failure.value(), 0);
        assert_eq!(
            *callbacks.updates.lock().unwrap(),
            vec![vec!["cluster_1".to_string()]],
        );
    }

    #[test]
    fn test_refresh_missing_file_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");

        let (_store, stats) = stats();
        let mut callbacks = RecordingCallbacks::default();
        refresh::<ClusterSpec>(&path, &stats, &mut callbacks);

        assert_eq!(stats.update_failure.value(), 1);
        assert_eq!(stats.update_rejected.value(), 0);
        assert_eq!(callbacks.failure_count(), 1);
    }

    #[test]
    fn test_refresh_bad_json_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cds.json");
        std::fs::write(&path, "not json at all").unwrap();

        let (_store, stats) = stats();
        let mut callbacks = RecordingCallbacks::default();
        refresh::<ClusterSpec>(&path, &stats, &mut callbacks);

        assert_eq!(stats.update_failure.value(), 1);
        assert_eq!(stats.update_rejected.value(), 0);
    }

    #[test]
    fn test_refresh_consumer_rejection_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cds.json");
        write_document(
            &path,
            serde_json::json!([
                {"name": "cluster_1", "type": "static", "hosts": [{"url": "tcp://127.0.0.1:80"}]},
            ]),
        );

        let (_store, stats) = stats();
        let mut callbacks = RecordingCallbacks::default();
        *callbacks.reject_with.lock().unwrap() = Some("collides with a static cluster".to_string());
        refresh::<ClusterSpec>(&path, &stats, &mut callbacks);

        assert_eq!(stats.update_rejected.value(), 1);
        assert_eq!(stats.update_failure.value(), 0);
        assert_eq!(callbacks.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_watch_picks_up_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cds.json");
        write_document(&path, serde_json::json!([]));

        let (_store, stats) = stats();
        let callbacks = RecordingCallbacks::default();

        let mut subscription = FilesystemSubscription::<ClusterSpec>::new(
            &path,
            Duration::from_millis(10),
            stats.clone(),
        );
        subscription.start(Vec::new(), Box::new(callbacks.clone()));

        // wait for the initial read
        for _ in 0..100 {
            if callbacks.update_count() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(callbacks.update_count(), 1);

        // atomic replace: write to a temp name and rename over the target
        let staged = dir.path().join("cds.json.tmp");
        let doc = serde_json::json!({"version_info": "2", "resources": [
            {"name": "cluster_1", "type": "static", "hosts": [{"url": "tcp://127.0.0.1:80"}]},
        ]});
        std::fs::write(&staged, serde_json::to_string(&doc).unwrap()).unwrap();
        std::fs::rename(&staged, &path).unwrap();

        for _ in 0..100 {
            if callbacks.update_count() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            callbacks.updates.lock().unwrap().last().unwrap(),
            &vec!["cluster_1".to_string()],
        );
    }
}
