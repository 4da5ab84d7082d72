//! Priority-timed work dispatcher: the queue, worker pool, discovery loop,
//! and exclusion refresher — spec.md §4.1.
//!
//! Grounded on `balancer::dispatchq`'s single-queue/many-waiter shape, reworked
//! from its futures-0.1 `Task`-parking design onto `tokio::sync::Notify` so a
//! worker waiting for the next due-time never busy-spins (invariant A4).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::exclusions::ExclusionCache;
use crate::master_list::MasterListClient;
use crate::model::{coerce_int, now_truncated, Address};
use crate::querier::{GameSpyClient, Querier};
use crate::store::Store;

const EXCLUSION_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const MATERIALIZED_VIEW_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PollEntry {
    due: DateTime<Utc>,
    addr: Address,
}

impl Ord for PollEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Ties broken by address so ordering is deterministic (spec.md §3:
        // "ties broken arbitrarily but stably").
        self.due.cmp(&other.due).then_with(|| self.addr.cmp(&other.addr))
    }
}

impl PartialOrd for PollEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Owns Q, the Known-Set, and the Parked-Set (spec.md §4.1 "State").
/// Workers, the discovery loop, and the exclusion refresher all hold the
/// same `Arc<Scheduler<C>>` and mutate this state directly rather than
/// through a message channel back to a single owning task — matching §9's
/// note that the multi-threaded contract only needs Q concurrent, E
/// pointer-swapped, and per-address serialization preserved.
pub struct Scheduler<C> {
    config: Config,
    store: Arc<Store>,
    exclusions: Arc<ExclusionCache>,
    master_list: MasterListClient,
    querier: Querier<C>,
    queue: Mutex<BinaryHeap<Reverse<PollEntry>>>,
    notify: Notify,
    known: Mutex<HashSet<Address>>,
    parked: Mutex<HashSet<Address>>,
}

impl<C: GameSpyClient + 'static> Scheduler<C> {
    pub fn new(
        config: Config,
        store: Arc<Store>,
        exclusions: Arc<ExclusionCache>,
        master_list: MasterListClient,
        client: C,
    ) -> Self {
        Scheduler {
            config,
            store,
            exclusions,
            master_list,
            querier: Querier::new(client),
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            known: Mutex::new(HashSet::new()),
            parked: Mutex::new(HashSet::new()),
        }
    }

    /// Startup seeding (spec.md §4.1 "Seeding"): refresh E, load every known
    /// address from the store, and either park or enqueue each one.
    pub async fn seed(&self) -> Result<(), crate::store::StoreError> {
        let fresh = self.store.load_exclusions().await?;
        self.exclusions.replace(fresh);
        let snapshot = self.exclusions.snapshot();

        let addresses = self.store.known_addresses().await?;
        let now = Utc::now();
        let mut admitted = 0usize;
        let mut parked_count = 0usize;
        for addr in addresses {
            self.known.lock().await.insert(addr);
            if snapshot.is_server_excluded(addr) {
                self.parked.lock().await.insert(addr);
                parked_count += 1;
            } else {
                self.enqueue_at(addr, now).await;
                admitted += 1;
            }
        }
        info!("seeded scheduler with {admitted} active and {parked_count} parked addresses");
        Ok(())
    }

    async fn enqueue_at(&self, addr: Address, due: DateTime<Utc>) {
        self.queue.lock().await.push(Reverse(PollEntry { due, addr }));
        self.notify.notify_waiters();
    }

    /// Admits an address not yet in the Known-Set (discovery path, spec.md
    /// §4.1). Returns `true` if it was newly admitted.
    async fn admit_if_new(&self, addr: Address, exclusions: &crate::model::Exclusions) -> bool {
        let newly_known = self.known.lock().await.insert(addr);
        if !newly_known {
            return false;
        }
        if exclusions.is_server_excluded(addr) {
            self.parked.lock().await.insert(addr);
        } else {
            self.enqueue_at(addr, Utc::now()).await;
        }
        true
    }

    /// Blocks until Q's head is due, popping and returning it. Never
    /// busy-spins (A4): waits on either the sleep until the head's due-time
    /// or a `Notify` wakeup from a fresher enqueue, whichever comes first.
    async fn dequeue(&self) -> Address {
        loop {
            // Register for the next notification *before* releasing the
            // queue lock (and before peeking it on the non-empty path, for
            // the same reason): `Notify::notify_waiters` only wakes waiters
            // already registered at the time it's called, so an enqueue
            // landing between a lock release and the `notified().await`
            // below would otherwise be a lost wakeup (spec.md §8 P2).
            // `enable()` marks this future as a registered waiter right
            // away, before it is ever polled, closing that gap.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let due = {
                let queue = self.queue.lock().await;
                queue.peek().map(|Reverse(entry)| entry.due)
            };

            match due {
                None => notified.await,
                Some(due) => {
                    let now = Utc::now();
                    if due <= now {
                        let mut queue = self.queue.lock().await;
                        match queue.peek() {
                            Some(Reverse(entry)) if entry.due <= now => {
                                let Reverse(entry) = queue.pop().expect("peeked Some above");
                                return entry.addr;
                            }
                            _ => continue,
                        }
                    } else {
                        let wait = (due - now).to_std().unwrap_or(Duration::ZERO);
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = notified => {}
                        }
                    }
                }
            }
        }
    }

    async fn park(&self, addr: Address) {
        self.parked.lock().await.insert(addr);
    }

    /// One worker's handling of a single dequeued address — spec.md §4.1
    /// "Worker loop".
    async fn process(&self, addr: Address) {
        let exclusions = self.exclusions.snapshot();
        if exclusions.is_server_excluded(addr) {
            debug!("parking {addr}: excluded at dequeue time");
            self.park(addr).await;
            return;
        }

        match self.querier.query(addr, self.config.server_query_timeout).await {
            Some(raw) => {
                let delay = next_delay(&raw.info, &self.config);
                let timestamp = now_truncated();
                if let Err(e) = self.store.record_success(addr, raw, &exclusions, timestamp).await {
                    warn!("store error recording success for {addr}: {e}");
                }
                self.enqueue_at(addr, timestamp + chrono_duration(delay)).await;
            }
            None => {
                let timestamp = now_truncated();
                if let Err(e) = self
                    .store
                    .record_failure(addr, timestamp, self.config.offline_failure_threshold)
                    .await
                {
                    warn!("store error recording failure for {addr}: {e}");
                }
                self.enqueue_at(addr, timestamp + chrono_duration(self.config.poll_interval_offline))
                    .await;
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                addr = self.dequeue() => {
                    self.process(addr).await;
                }
            }
        }
    }

    /// Discovery loop (spec.md §4.1): periodically fetches the master list,
    /// exponentially backing off on fetch failure and resetting to the base
    /// interval on success.
    async fn discovery_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = self.config.master_list_poll_interval;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    match self.master_list.fetch_servers().await {
                        Ok(addresses) => {
                            interval = self.config.master_list_poll_interval;
                            let snapshot = self.exclusions.snapshot();
                            let mut admitted = 0usize;
                            for addr in addresses {
                                if self.admit_if_new(addr, &snapshot).await {
                                    admitted += 1;
                                }
                            }
                            if admitted > 0 {
                                info!("discovery admitted {admitted} new addresses");
                            }
                        }
                        Err(e) => {
                            warn!("master list fetch failed: {e}; backing off to {interval:?}");
                            interval = (interval * 2).min(self.config.master_list_max_backoff);
                        }
                    }
                }
            }
        }
    }

    /// Exclusion refresh loop (spec.md §4.1): every 300 s, reloads
    /// exclusions and releases any now-admissible parked address.
    async fn exclusion_refresh_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(EXCLUSION_REFRESH_INTERVAL) => {
                    match self.store.load_exclusions().await {
                        Ok(fresh) => {
                            self.exclusions.replace(fresh);
                            let snapshot = self.exclusions.snapshot();
                            let released: Vec<Address> = {
                                let parked = self.parked.lock().await;
                                parked.iter().copied().filter(|a| !snapshot.is_server_excluded(*a)).collect()
                            };
                            if !released.is_empty() {
                                let mut parked = self.parked.lock().await;
                                for addr in &released {
                                    parked.remove(addr);
                                }
                                drop(parked);
                                let now = Utc::now();
                                for addr in released {
                                    self.enqueue_at(addr, now).await;
                                }
                            }
                        }
                        Err(e) => warn!("exclusion refresh failed: {e}"),
                    }
                }
            }
        }
    }

    /// Materialized-view refresh loop (spec.md §5 "three singleton tasks";
    /// §6 "the scheduler's only interaction is an optional periodic
    /// `REFRESH MATERIALIZED VIEW` call"), mirroring
    /// `original_source/engine/scheduler.py`'s `_refresh_materialized_views`.
    async fn materialized_view_refresh_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(MATERIALIZED_VIEW_REFRESH_INTERVAL) => {
                    info!("refreshing materialized views for stats");
                    match self.store.refresh_materialized_views().await {
                        Ok(()) => info!("materialized views refreshed"),
                        Err(e) => warn!("error refreshing materialized views: {e}"),
                    }
                }
            }
        }
    }

    /// Spawns the worker pool plus the three singleton loops, returning
    /// their join handles so the Supervisor can await them after signalling
    /// `shutdown`.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.worker_count + 3);
        for _ in 0..self.config.worker_count {
            handles.push(tokio::spawn(Arc::clone(&self).worker_loop(shutdown.clone())));
        }
        handles.push(tokio::spawn(Arc::clone(&self).discovery_loop(shutdown.clone())));
        handles.push(tokio::spawn(Arc::clone(&self).exclusion_refresh_loop(shutdown.clone())));
        handles.push(tokio::spawn(self.materialized_view_refresh_loop(shutdown)));
        handles
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

/// The next-delay policy table of spec.md §4.1.
fn next_delay(info: &std::collections::HashMap<String, String>, config: &Config) -> Duration {
    let numplayers = coerce_int(info.get("numplayers"));
    if numplayers == 0 {
        return config.poll_interval_empty;
    }

    let roundtimeremain = info.get("roundtimeremain").or_else(|| info.get("roundtime"));
    let roundtimeremain = coerce_int(roundtimeremain);
    let active_s = config.poll_interval_active.as_secs() as i64;
    if roundtimeremain > 0 && roundtimeremain < active_s + 5 {
        return Duration::from_secs((roundtimeremain + 3) as u64);
    }

    config.poll_interval_active
}
