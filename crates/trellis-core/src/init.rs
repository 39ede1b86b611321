//! Cluster warm-up ordering.
//!
//! Clusters initialize in two phases: primary clusters (anything a discovery
//! subscription might need to connect through) warm in parallel first, and
//! only when every primary cluster is ready do secondary clusters start. A
//! single manager-level initialized callback fires exactly once, after the
//! last secondary cluster reports ready.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use trellis_api::Name;

/// When a cluster is allowed to warm up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InitPhase {
    /// Warmed during static load, before any discovery subscription starts.
    Primary,
    /// Warmed only after every primary cluster is ready; may depend on a
    /// running subscription.
    Secondary,
}

/// Something the helper can warm up. The `done` callback must be invoked
/// exactly once, when the target reaches steady state.
pub(crate) trait InitTarget: Send + Sync {
    fn name(&self) -> &Name;
    fn init_phase(&self) -> InitPhase;
    fn initialize(&self, done: Box<dyn FnOnce() + Send>);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Loading,
    WaitingForStaticInitialize,
    WaitingForSecondaryInitialize,
    AllClustersInitialized,
}

/// Tracking is keyed by a per-add id rather than cluster name: when a
/// warming cluster is replaced under the same name, the old entity's late
/// done-callback must not clear the new entity's pending state.
type TargetId = u64;

struct HelperState {
    state: State,
    next_id: TargetId,
    pending_primary: HashSet<TargetId>,
    pending_secondary: HashSet<TargetId>,
    /// Secondary targets waiting for kickoff, in insertion order.
    secondary_queue: Vec<(TargetId, Arc<dyn InitTarget>)>,
    initialized_cb: Option<Box<dyn FnOnce() + Send>>,
}

/// Work to do after releasing the state lock. `initialize` and user
/// callbacks are never invoked while the lock is held, so targets are free
/// to call back into the helper synchronously.
enum Action {
    None,
    StartSecondaries(Vec<(TargetId, Arc<dyn InitTarget>)>),
    FireInitialized(Option<Box<dyn FnOnce() + Send>>),
}

/// The cluster manager's init ordering state machine. Cloning shares state.
#[derive(Clone)]
pub(crate) struct InitHelper {
    inner: Arc<Mutex<HelperState>>,
}

impl InitHelper {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HelperState {
                state: State::Loading,
                next_id: 0,
                pending_primary: HashSet::new(),
                pending_secondary: HashSet::new(),
                secondary_queue: Vec::new(),
                initialized_cb: None,
            })),
        }
    }

    /// Track a target. Primary targets start warming immediately; secondary
    /// targets are queued until the secondary phase begins. After everything
    /// has initialized, late additions start immediately and their
    /// completion is a per-target event only.
    ///
    /// The returned id can be passed to [remove_cluster][Self::remove_cluster]
    /// to drop the target from tracking.
    pub(crate) fn add_cluster(&self, target: Arc<dyn InitTarget>) -> TargetId {
        let (id, start_now) = {
            let mut state = self.inner.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;

            let start_now = match (state.state, target.init_phase()) {
                (State::AllClustersInitialized, _) => true,
                (_, InitPhase::Primary) => {
                    state.pending_primary.insert(id);
                    true
                }
                (State::WaitingForSecondaryInitialize, InitPhase::Secondary) => {
                    state.pending_secondary.insert(id);
                    true
                }
                (_, InitPhase::Secondary) => {
                    state.pending_secondary.insert(id);
                    state.secondary_queue.push((id, Arc::clone(&target)));
                    false
                }
            };
            (id, start_now)
        };

        if start_now {
            self.start(id, target);
        }
        id
    }

    /// Forget a target entirely. Safe to call at any point, including while
    /// the secondary kickoff is in flight.
    pub(crate) fn remove_cluster(&self, id: TargetId) {
        let action = {
            let mut state = self.inner.lock().unwrap();
            state.pending_primary.remove(&id);
            state.pending_secondary.remove(&id);
            state.secondary_queue.retain(|(queued, _)| *queued != id);
            maybe_finish(&mut state)
        };
        self.execute(action);
    }

    /// Every static cluster has been added; start driving the primary phase.
    pub(crate) fn on_static_load_complete(&self) {
        let action = {
            let mut state = self.inner.lock().unwrap();
            debug_assert_eq!(state.state, State::Loading);
            state.state = State::WaitingForStaticInitialize;
            maybe_finish(&mut state)
        };
        self.execute(action);
    }

    /// Register the callback fired when every tracked target has warmed. If
    /// that already happened, fires synchronously.
    pub(crate) fn set_initialized_cb(&self, cb: Box<dyn FnOnce() + Send>) {
        {
            let mut state = self.inner.lock().unwrap();
            if state.state != State::AllClustersInitialized {
                state.initialized_cb = Some(cb);
                return;
            }
        }
        cb();
    }

    fn on_target_initialized(&self, id: TargetId, name: &Name) {
        tracing::debug!(cluster = %name, "cluster initialization complete");
        let action = {
            let mut state = self.inner.lock().unwrap();
            state.pending_primary.remove(&id);
            state.pending_secondary.remove(&id);
            maybe_finish(&mut state)
        };
        self.execute(action);
    }

    fn start(&self, id: TargetId, target: Arc<dyn InitTarget>) {
        let helper = self.clone();
        let name = target.name().clone();
        target.initialize(Box::new(move || helper.on_target_initialized(id, &name)));
    }

    fn execute(&self, action: Action) {
        match action {
            Action::None => {}
            Action::FireInitialized(cb) => {
                tracing::info!("all clusters initialized");
                if let Some(cb) = cb {
                    cb();
                }
            }
            Action::StartSecondaries(targets) => {
                tracing::info!(
                    count = targets.len(),
                    "primary clusters initialized, starting secondary clusters"
                );
                for (id, target) in targets {
                    // a target started earlier in this loop may have removed
                    // this one, so re-check membership before starting it
                    let still_pending = {
                        let state = self.inner.lock().unwrap();
                        state.pending_secondary.contains(&id)
                    };
                    if still_pending {
                        self.start(id, target);
                    }
                }
            }
        }
    }
}

/// Advance the state machine as far as the pending sets allow. Must be
/// called with the lock held; returns the work to do after unlocking.
fn maybe_finish(state: &mut HelperState) -> Action {
    match state.state {
        State::WaitingForStaticInitialize if state.pending_primary.is_empty() => {
            state.state = State::WaitingForSecondaryInitialize;
            let to_start = std::mem::take(&mut state.secondary_queue);
            if to_start.is_empty() && state.pending_secondary.is_empty() {
                state.state = State::AllClustersInitialized;
                Action::FireInitialized(state.initialized_cb.take())
            } else {
                Action::StartSecondaries(to_start)
            }
        }
        // a primary target can still be pending here: a cluster added while
        // secondaries warm (a cds-delivered dns cluster, say) starts
        // immediately and must gate completion like any other primary
        State::WaitingForSecondaryInitialize
            if state.pending_primary.is_empty()
                && state.pending_secondary.is_empty()
                && state.secondary_queue.is_empty() =>
        {
            state.state = State::AllClustersInitialized;
            Action::FireInitialized(state.initialized_cb.take())
        }
        _ => Action::None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type InitHook = Box<dyn FnMut() + Send>;

    struct MockCluster {
        name: Name,
        phase: InitPhase,
        init_calls: AtomicUsize,
        done: Mutex<Option<Box<dyn FnOnce() + Send>>>,
        on_initialize: Mutex<Option<InitHook>>,
    }

    impl MockCluster {
        fn new(name: &str, phase: InitPhase) -> Arc<Self> {
            Arc::new(Self {
                name: Name::new(name).unwrap(),
                phase,
                init_calls: AtomicUsize::new(0),
                done: Mutex::new(None),
                on_initialize: Mutex::new(None),
            })
        }

        fn init_calls(&self) -> usize {
            self.init_calls.load(Ordering::SeqCst)
        }

        /// Fire the pending done callback, as if warm-up completed.
        fn finish(&self) {
            let cb = self.done.lock().unwrap().take();
            cb.expect("no pending initialize callback")();
        }
    }

    impl InitTarget for MockCluster {
        fn name(&self) -> &Name {
            &self.name
        }

        fn init_phase(&self) -> InitPhase {
            self.phase
        }

        fn initialize(&self, done: Box<dyn FnOnce() + Send>) {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            *self.done.lock().unwrap() = Some(done);
            if let Some(hook) = self.on_initialize.lock().unwrap().as_mut() {
                hook();
            }
        }
    }

    fn counting_cb(counter: &Arc<AtomicUsize>) -> Box<dyn FnOnce() + Send> {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_primary_then_secondary_order() {
        let helper = InitHelper::new();
        let initialized = Arc::new(AtomicUsize::new(0));
        helper.set_initialized_cb(counting_cb(&initialized));

        let primary = MockCluster::new("primary", InitPhase::Primary);
        let secondary = MockCluster::new("secondary", InitPhase::Secondary);
        helper.add_cluster(primary.clone());
        helper.add_cluster(secondary.clone());

        // primary starts immediately, secondary is held back
        assert_eq!(primary.init_calls(), 1);
        assert_eq!(secondary.init_calls(), 0);

        helper.on_static_load_complete();
        assert_eq!(secondary.init_calls(), 0);

        primary.finish();
        assert_eq!(secondary.init_calls(), 1);
        assert_eq!(initialized.load(Ordering::SeqCst), 0);

        secondary.finish();
        assert_eq!(initialized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_initialized_fires_exactly_once() {
        let helper = InitHelper::new();
        let initialized = Arc::new(AtomicUsize::new(0));
        helper.set_initialized_cb(counting_cb(&initialized));

        let a = MockCluster::new("a", InitPhase::Primary);
        let b = MockCluster::new("b", InitPhase::Primary);
        helper.add_cluster(a.clone());
        helper.add_cluster(b.clone());
        helper.on_static_load_complete();

        a.finish();
        assert_eq!(initialized.load(Ordering::SeqCst), 0);
        b.finish();
        assert_eq!(initialized.load(Ordering::SeqCst), 1);

        // a late add is a per-cluster event only
        let late = MockCluster::new("late", InitPhase::Secondary);
        helper.add_cluster(late.clone());
        assert_eq!(late.init_calls(), 1);
        late.finish();
        assert_eq!(initialized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_clusters_initializes_immediately() {
        let helper = InitHelper::new();
        let initialized = Arc::new(AtomicUsize::new(0));
        helper.set_initialized_cb(counting_cb(&initialized));

        helper.on_static_load_complete();
        assert_eq!(initialized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_initialized_cb_after_complete_fires_synchronously() {
        let helper = InitHelper::new();
        helper.on_static_load_complete();

        let initialized = Arc::new(AtomicUsize::new(0));
        helper.set_initialized_cb(counting_cb(&initialized));
        assert_eq!(initialized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_secondaries_start_in_insertion_order() {
        let helper = InitHelper::new();

        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut clusters = Vec::new();
        for name in ["s1", "s2", "s3"] {
            let cluster = MockCluster::new(name, InitPhase::Secondary);
            let order = Arc::clone(&order);
            let label = name.to_string();
            *cluster.on_initialize.lock().unwrap() = Some(Box::new(move || {
                order.lock().unwrap().push(label.clone());
            }));
            helper.add_cluster(cluster.clone());
            clusters.push(cluster);
        }

        helper.on_static_load_complete();
        assert_eq!(*order.lock().unwrap(), vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn test_remove_cluster_mid_secondary_traversal() {
        // a secondary cluster whose initialize() synchronously removes
        // itself from the helper: kickoff must survive and the initialized
        // callback must still fire
        let helper = InitHelper::new();
        let initialized = Arc::new(AtomicUsize::new(0));
        helper.set_initialized_cb(counting_cb(&initialized));

        let cluster = MockCluster::new("self_removing", InitPhase::Secondary);
        let id = Arc::new(Mutex::new(None));
        {
            let helper = helper.clone();
            let id = Arc::clone(&id);
            *cluster.on_initialize.lock().unwrap() = Some(Box::new(move || {
                let id = id.lock().unwrap().expect("id recorded before kickoff");
                helper.remove_cluster(id);
            }));
        }
        *id.lock().unwrap() = Some(helper.add_cluster(cluster.clone()));

        helper.on_static_load_complete();
        assert_eq!(cluster.init_calls(), 1);
        assert_eq!(initialized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_one_secondary_does_not_start_it() {
        let helper = InitHelper::new();
        let initialized = Arc::new(AtomicUsize::new(0));
        helper.set_initialized_cb(counting_cb(&initialized));

        let s1 = MockCluster::new("s1", InitPhase::Secondary);
        let s2 = MockCluster::new("s2", InitPhase::Secondary);
        let s1_id = helper.add_cluster(s1.clone());
        let s2_id = helper.add_cluster(s2.clone());
        assert_ne!(s1_id, s2_id);

        // s1's initialize removes s2 before the loop reaches it
        {
            let helper = helper.clone();
            *s1.on_initialize.lock().unwrap() = Some(Box::new(move || {
                helper.remove_cluster(s2_id);
            }));
        }

        helper.on_static_load_complete();
        assert_eq!(s1.init_calls(), 1);
        assert_eq!(s2.init_calls(), 0);

        s1.finish();
        assert_eq!(initialized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_primary_blocks_initialized() {
        // a primary cluster added during the secondary phase starts
        // immediately, and the initialized callback waits for it
        let helper = InitHelper::new();
        let initialized = Arc::new(AtomicUsize::new(0));
        helper.set_initialized_cb(counting_cb(&initialized));

        let secondary = MockCluster::new("secondary", InitPhase::Secondary);
        helper.add_cluster(secondary.clone());
        helper.on_static_load_complete();
        assert_eq!(secondary.init_calls(), 1);

        let late_primary = MockCluster::new("late_primary", InitPhase::Primary);
        helper.add_cluster(late_primary.clone());
        assert_eq!(late_primary.init_calls(), 1);

        // the last secondary finishing is not enough while the primary's
        // warm-up is still outstanding
        secondary.finish();
        assert_eq!(initialized.load(Ordering::SeqCst), 0);

        late_primary.finish();
        assert_eq!(initialized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_pending_primary_unblocks_transition() {
        let helper = InitHelper::new();
        let initialized = Arc::new(AtomicUsize::new(0));
        helper.set_initialized_cb(counting_cb(&initialized));

        let stuck = MockCluster::new("stuck", InitPhase::Primary);
        let id = helper.add_cluster(stuck.clone());
        helper.on_static_load_complete();
        assert_eq!(initialized.load(Ordering::SeqCst), 0);

        helper.remove_cluster(id);
        assert_eq!(initialized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replaced_cluster_old_done_does_not_satisfy_new() {
        // same name, two entities: the old entity's done callback must not
        // clear the replacement's pending state
        let helper = InitHelper::new();
        let initialized = Arc::new(AtomicUsize::new(0));
        helper.set_initialized_cb(counting_cb(&initialized));

        let old = MockCluster::new("api_cluster", InitPhase::Primary);
        let old_id = helper.add_cluster(old.clone());

        let replacement = MockCluster::new("api_cluster", InitPhase::Primary);
        helper.remove_cluster(old_id);
        helper.add_cluster(replacement.clone());

        helper.on_static_load_complete();

        // the stale done callback from the removed entity changes nothing
        old.finish();
        assert_eq!(initialized.load(Ordering::SeqCst), 0);

        replacement.finish();
        assert_eq!(initialized.load(Ordering::SeqCst), 1);
    }
}
