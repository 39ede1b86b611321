//! The CDS consumer.
//!
//! A thin glue object that owns the cluster-discovery subscription and turns
//! each delivered cluster list into add/update/remove calls on the manager.
//! The manager registers it with init ordering as a secondary-phase target,
//! so the subscription doesn't start until every primary cluster (including
//! whatever cluster hosts the management server) is warm.

use std::sync::{Arc, Mutex, Weak};

use trellis_api::{ClusterSpec, Name};

use crate::init::{InitPhase, InitTarget};
use crate::manager::ClusterManager;
use crate::subscription::{
    Subscription, SubscriptionCallbacks, SubscriptionError, UpdateRejection,
};

/// A label for init-ordering logs; CDS is tracked by id, not by this name,
/// so it can't collide with a real cluster.
const CDS_NAME: &str = "cds";

struct CdsInner {
    name: Name,
    subscription: Mutex<Option<Subscription<ClusterSpec>>>,
    initialized_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// When set, a failed update no longer counts as "initialized": startup
    /// stays blocked until the management server delivers a good update.
    block_on_first_update: bool,
}

impl CdsInner {
    fn run_initialized_cb(&self) {
        if let Some(cb) = self.initialized_cb.lock().unwrap().take() {
            cb();
        }
    }
}

/// The CDS API provider. Cloning shares the underlying subscription.
#[derive(Clone)]
pub struct CdsApi {
    inner: Arc<CdsInner>,
    manager: Weak<crate::manager::ManagerInner>,
}

impl CdsApi {
    pub(crate) fn new(
        manager: &ClusterManager,
        subscription: Subscription<ClusterSpec>,
        block_on_first_update: bool,
    ) -> CdsApi {
        CdsApi {
            inner: Arc::new(CdsInner {
                name: Name::from_static(CDS_NAME),
                subscription: Mutex::new(Some(subscription)),
                initialized_cb: Mutex::new(None),
                block_on_first_update,
            }),
            manager: manager.downgrade(),
        }
    }

    /// Start the first fetch of cluster data.
    pub fn start(&self) {
        let callbacks = CdsCallbacks {
            inner: Arc::downgrade(&self.inner),
            manager: self.manager.clone(),
        };

        let mut subscription = self.inner.subscription.lock().unwrap();
        if let Some(subscription) = subscription.as_mut() {
            subscription.start(Vec::new(), Box::new(callbacks));
        }
    }

    /// Stop the subscription. Dropping the stream cancels any in-flight
    /// fetch.
    pub(crate) fn shutdown(&self) {
        *self.inner.subscription.lock().unwrap() = None;
    }
}

impl InitTarget for CdsApi {
    fn name(&self) -> &Name {
        &self.inner.name
    }

    fn init_phase(&self) -> InitPhase {
        InitPhase::Secondary
    }

    fn initialize(&self, done: Box<dyn FnOnce() + Send>) {
        *self.inner.initialized_cb.lock().unwrap() = Some(done);
        self.start();
    }
}

struct CdsCallbacks {
    inner: Weak<CdsInner>,
    manager: Weak<crate::manager::ManagerInner>,
}

impl SubscriptionCallbacks<ClusterSpec> for CdsCallbacks {
    fn on_config_update(
        &mut self,
        resources: Vec<ClusterSpec>,
    ) -> Result<(), UpdateRejection> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let Some(manager) = ClusterManager::upgrade(&self.manager) else {
            return Ok(());
        };

        // everything currently known is a removal candidate until the update
        // names it; remove() refuses static clusters on its own
        let mut to_remove = manager.cluster_names();
        for spec in resources {
            let name = spec.name.clone();
            to_remove.retain(|n| *n != name);

            match manager.add_or_update_cluster(spec) {
                Ok(true) => tracing::info!(cluster = %name, "cds: add/update cluster"),
                Ok(false) => {}
                Err(e) => {
                    // prior state stays; the source NACKs with this reason
                    tracing::warn!(cluster = %name, err = %e, "cds: rejecting cluster update");
                    return Err(UpdateRejection::new(e.to_string()));
                }
            }
        }

        for name in to_remove {
            if manager.remove_cluster(&name) {
                tracing::info!(cluster = %name, "cds: remove cluster");
            }
        }

        inner.run_initialized_cb();
        Ok(())
    }

    fn on_config_update_failed(&mut self, error: &SubscriptionError) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        if inner.block_on_first_update {
            tracing::error!(err = %error, "cds: update failed; startup remains blocked on cds");
            return;
        }

        // server startup continues on a bad or unreachable management
        // server; the manager runs on last-known-good state
        tracing::warn!(err = %error, "cds: update failed");
        inner.run_initialized_cb();
    }
}
