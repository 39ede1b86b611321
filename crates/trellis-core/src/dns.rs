//! DNS resolution for dns-discovered clusters.
//!
//! Clusters register a [watch][DnsResolver::watch] per configured hostname.
//! The resolver re-resolves watched names in the background and invokes the
//! watch callback whenever the answer changes; every resolution's answer is
//! the *entire* address set for that name. Dropping (or cancelling) the
//! returned [DnsWatch] stops further callbacks, which is how in-flight
//! queries die when their owning cluster is removed.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// The address family to resolve.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IpFamily {
    #[default]
    V4,
    V6,
}

/// Invoked with the full address set each time resolution produces a changed
/// answer. May be invoked zero or more times over the watch's life.
pub type WatchCallback = Box<dyn FnMut(Vec<SocketAddr>) + Send>;

pub trait DnsResolver: Send + Sync + std::fmt::Debug {
    /// Start watching `hostname`, delivering `port`-qualified addresses to
    /// `callback`. The returned handle cancels the watch when dropped.
    fn watch(&self, hostname: &str, port: u16, family: IpFamily, callback: WatchCallback)
        -> DnsWatch;
}

/// A cancel handle for an active DNS watch.
pub struct DnsWatch {
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for DnsWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsWatch")
            .field("active", &self.canceller.is_some())
            .finish()
    }
}

impl DnsWatch {
    pub fn new(canceller: impl FnOnce() + Send + 'static) -> Self {
        Self {
            canceller: Some(Box::new(canceller)),
        }
    }

    /// A watch that was never started, for resolvers that answer nothing.
    pub fn noop() -> Self {
        Self { canceller: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.canceller.take() {
            cancel();
        }
    }
}

impl Drop for DnsWatch {
    fn drop(&mut self) {
        if let Some(cancel) = self.canceller.take() {
            cancel();
        }
    }
}

/// A blocking resolver that uses the stdlib to resolve hostnames.
///
/// A fixed pool of background threads periodically re-resolves every watched
/// name. On every resolution the returned address set overwrites the previous
/// one, which matches strict-dns cluster semantics. Threads exit when the
/// resolver is dropped.
#[derive(Clone, Debug)]
pub struct StdlibResolver {
    inner: Arc<StdlibResolverInner>,
}

#[derive(Debug)]
struct StdlibResolverInner {
    lookup_interval: Duration,

    cond: Condvar,
    tasks: Mutex<ResolverState>,
    next_watch_id: AtomicU64,
    shutdown: AtomicBool,
}

#[derive(Debug, Default)]
struct ResolverState {
    watches: BTreeMap<u64, WatchEntry>,
}

struct WatchEntry {
    hostname: String,
    port: u16,
    family: IpFamily,
    callback: WatchCallback,
    next_lookup: Instant,
    last_answer: Option<Vec<SocketAddr>>,
    resolving: bool,
}

impl std::fmt::Debug for WatchEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchEntry")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("next_lookup", &self.next_lookup)
            .finish()
    }
}

macro_rules! no_poison {
    ($guard:expr) => {
        $guard.expect("StdlibResolver lock was poisoned: this is a bug in trellis")
    };
}

impl StdlibResolver {
    pub fn new_with(lookup_interval: Duration, threads: usize) -> Self {
        let resolver = StdlibResolver {
            inner: Arc::new(StdlibResolverInner {
                lookup_interval,
                cond: Condvar::new(),
                tasks: Mutex::new(ResolverState::default()),
                next_watch_id: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        };

        for _ in 0..threads.max(1) {
            let resolver = resolver.clone();
            std::thread::spawn(move || resolver.run());
        }

        resolver
    }

    fn run(&self) {
        loop {
            let Some((id, hostname, port, family)) = self.next_due() else {
                return;
            };

            tracing::trace!(%hostname, "starting dns lookup");
            let answer = resolve_blocking(&hostname, port, family);

            let mut tasks = no_poison!(self.inner.tasks.lock());
            let Some(entry) = tasks.watches.get_mut(&id) else {
                // watch was cancelled while we were resolving
                continue;
            };
            entry.resolving = false;
            entry.next_lookup = Instant::now() + self.inner.lookup_interval;
            // other workers may be parked waiting on this entry's schedule
            self.inner.cond.notify_all();

            match answer {
                Ok(addrs) => {
                    if entry.last_answer.as_ref() != Some(&addrs) {
                        entry.last_answer = Some(addrs.clone());
                        // invoked under the state lock: callbacks post host
                        // updates and must not call back into the resolver
                        (entry.callback)(addrs);
                    }
                }
                Err(e) => {
                    tracing::debug!(%hostname, err = %e, "dns lookup failed");
                    if entry.last_answer.is_none() {
                        entry.last_answer = Some(Vec::new());
                        (entry.callback)(Vec::new());
                    }
                }
            }
        }
    }

    /// Block until a watch is due for resolution, or the resolver shuts down.
    fn next_due(&self) -> Option<(u64, String, u16, IpFamily)> {
        let mut tasks = no_poison!(self.inner.tasks.lock());
        loop {
            if self.inner.shutdown.load(Ordering::Acquire) {
                return None;
            }

            let now = Instant::now();
            let due = tasks
                .watches
                .iter_mut()
                .filter(|(_, e)| !e.resolving)
                .min_by_key(|(_, e)| e.next_lookup);

            match due {
                Some((&id, entry)) if entry.next_lookup <= now => {
                    entry.resolving = true;
                    return Some((id, entry.hostname.clone(), entry.port, entry.family));
                }
                Some((_, entry)) => {
                    let wait = entry.next_lookup - now;
                    let (guard, _) = no_poison!(self.inner.cond.wait_timeout(tasks, wait));
                    tasks = guard;
                }
                None => {
                    tasks = no_poison!(self.inner.cond.wait(tasks));
                }
            }
        }
    }

    fn cancel_watch(inner: &Weak<StdlibResolverInner>, id: u64) {
        if let Some(inner) = inner.upgrade() {
            let mut tasks = no_poison!(inner.tasks.lock());
            tasks.watches.remove(&id);
            inner.cond.notify_all();
        }
    }
}

impl Drop for StdlibResolverInner {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.cond.notify_all();
    }
}

impl DnsResolver for StdlibResolver {
    fn watch(
        &self,
        hostname: &str,
        port: u16,
        family: IpFamily,
        callback: WatchCallback,
    ) -> DnsWatch {
        let id = self.inner.next_watch_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut tasks = no_poison!(self.inner.tasks.lock());
            tasks.watches.insert(
                id,
                WatchEntry {
                    hostname: hostname.to_string(),
                    port,
                    family,
                    callback,
                    next_lookup: Instant::now(),
                    last_answer: None,
                    resolving: false,
                },
            );
        }
        self.inner.cond.notify_all();

        let inner = Arc::downgrade(&self.inner);
        DnsWatch::new(move || StdlibResolver::cancel_watch(&inner, id))
    }
}

fn resolve_blocking(
    hostname: &str,
    port: u16,
    family: IpFamily,
) -> std::io::Result<Vec<SocketAddr>> {
    let answer = std::net::ToSocketAddrs::to_socket_addrs(&(hostname, port))?;
    let mut addrs: Vec<_> = answer
        .filter(|a| match family {
            IpFamily::V4 => a.is_ipv4(),
            IpFamily::V6 => a.is_ipv6(),
        })
        .collect();
    addrs.sort();
    addrs.dedup();
    Ok(addrs)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_resolve_localhost() {
        let resolver = StdlibResolver::new_with(Duration::from_secs(5), 1);
        let (tx, rx) = mpsc::channel();

        let _watch = resolver.watch(
            "localhost",
            8080,
            IpFamily::V4,
            Box::new(move |addrs| {
                let _ = tx.send(addrs);
            }),
        );

        let addrs = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(addrs.iter().all(|a| a.port() == 8080));
    }

    #[test]
    fn test_cancelled_watch_stops_callbacks() {
        let resolver = StdlibResolver::new_with(Duration::from_millis(10), 1);
        let (tx, rx) = mpsc::channel();

        let watch = resolver.watch(
            "localhost",
            80,
            IpFamily::V4,
            Box::new(move |addrs| {
                let _ = tx.send(addrs);
            }),
        );

        // wait for the first answer, then cancel and drain
        let _ = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        watch.cancel();
        while rx.try_recv().is_ok() {}

        // after cancellation no further answers arrive, even across several
        // lookup intervals
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
