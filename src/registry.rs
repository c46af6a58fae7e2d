use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

/// Bookkeeping entry for one live connection. The activity stamp is touched
/// by the session task on every read; the sweeper only reads it.
pub struct LiveSession {
    pub id: u64,
    pub peer: SocketAddr,
    epoch: Instant,
    last_activity: AtomicU64,
    evicted: AtomicBool,
    notify: Notify,
}

impl LiveSession {
    fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
            evicted: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn touch(&self) {
        self.last_activity
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn idle(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_activity.load(Ordering::Relaxed)))
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Resolves once the sweeper decides this session has to go.
    pub async fn wait_evicted(&self) {
        if self.is_evicted() {
            return;
        }
        self.notify.notified().await;
    }

    fn evict(&self) {
        self.evicted.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

/// Outcome of the admission check, decided before any state is touched.
pub enum Admission {
    Granted(Arc<LiveSession>),
    ServerFull,
    SourceFull,
}

struct Inner {
    next_id: u64,
    sessions: HashMap<u64, Arc<LiveSession>>,
    per_source: HashMap<IpAddr, usize>,
}

/// Process-wide view of live connections: the global and per-source-IP
/// ceilings, and the entries the eviction sweep walks. All read-modify-write
/// goes through one lock so admission and reclamation never race.
pub struct ConnectionRegistry {
    max_total: usize,
    max_per_source: usize,
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new(max_total: usize, max_per_source: usize) -> Self {
        Self {
            max_total,
            max_per_source,
            inner: Mutex::new(Inner {
                next_id: 0,
                sessions: HashMap::new(),
                per_source: HashMap::new(),
            }),
        }
    }

    /// Checks both ceilings; a refusal leaves the registry untouched.
    pub async fn admit(&self, peer: SocketAddr) -> Admission {
        let mut inner = self.inner.lock().await;

        if inner.sessions.len() >= self.max_total {
            return Admission::ServerFull;
        }
        if inner.per_source.get(&peer.ip()).copied().unwrap_or(0) >= self.max_per_source {
            return Admission::SourceFull;
        }

        inner.next_id += 1;
        let entry = Arc::new(LiveSession::new(inner.next_id, peer));
        entry.touch();
        inner.sessions.insert(entry.id, entry.clone());
        *inner.per_source.entry(peer.ip()).or_insert(0) += 1;
        Admission::Granted(entry)
    }

    /// Removes the entry and drops the source count, floored at zero.
    /// Safe to call more than once for the same entry.
    pub async fn release(&self, entry: &LiveSession) {
        let mut inner = self.inner.lock().await;
        if inner.sessions.remove(&entry.id).is_none() {
            return;
        }
        match inner.per_source.get_mut(&entry.peer.ip()) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.per_source.remove(&entry.peer.ip());
            }
            None => {}
        }
    }

    /// Flags every session idle beyond `timeout`; their tasks observe the
    /// flag, notify the peer and release themselves. Returns how many were
    /// flagged this pass.
    pub async fn sweep(&self, timeout: Duration) -> usize {
        let inner = self.inner.lock().await;
        let mut evicted = 0;
        for entry in inner.sessions.values() {
            if !entry.is_evicted() && entry.idle() > timeout {
                entry.evict();
                evicted += 1;
            }
        }
        evicted
    }

    pub async fn live_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn source_count(&self, ip: IpAddr) -> usize {
        self.inner
            .lock()
            .await
            .per_source
            .get(&ip)
            .copied()
            .unwrap_or(0)
    }
}
