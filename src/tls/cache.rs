//! In-memory leaf certificate cache with per-hostname request coalescing

use crate::error::Result;
use crate::tls::authority::LeafCertificate;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::OnceCell;
use tracing::debug;

type Cell = Arc<OnceCell<Arc<LeafCertificate>>>;

struct Slot {
    cell: Cell,
    // insertion order, oldest evicted first
    seq: u64,
}

/// Hostname-keyed leaf cache.
///
/// The map lock is only held to find or create a hostname's slot. Issuance
/// runs outside it, so unrelated hostnames never wait on each other while
/// callers for the same hostname share one in-flight issuance.
pub struct LeafCache {
    slots: Mutex<HashMap<String, Slot>>,
    max_entries: usize,
    renew_before: Duration,
    next_seq: AtomicU64,
}

impl LeafCache {
    pub fn new(max_entries: usize, renew_before: Duration) -> Self {
        debug!("Creating leaf certificate cache (max_entries: {})", max_entries);
        Self {
            slots: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            renew_before,
            next_seq: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_fresh(&self, leaf: &LeafCertificate) -> bool {
        leaf.not_after()
            .checked_sub(self.renew_before)
            .map_or(false, |renew_at| SystemTime::now() < renew_at)
    }

    /// Return the cached leaf for `hostname`, or run `issue` to create it.
    ///
    /// Concurrent callers for the same hostname await a single `issue`. A
    /// failed issuance is not cached; the next caller tries again.
    pub async fn get_or_issue<F, Fut>(&self, hostname: &str, issue: F) -> Result<Arc<LeafCertificate>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<LeafCertificate>>,
    {
        let cell = self.slot_for(hostname);
        let leaf = cell
            .get_or_try_init(|| async { issue().await.map(Arc::new) })
            .await?;
        Ok(leaf.clone())
    }

    fn slot_for(&self, hostname: &str) -> Cell {
        let mut slots = self.lock();

        if let Some(slot) = slots.get(hostname) {
            match slot.cell.get() {
                Some(leaf) if self.is_fresh(leaf) => {
                    debug!("Cache HIT for {}", hostname);
                    return slot.cell.clone();
                }
                Some(_) => debug!("Cached leaf for {} is due for renewal", hostname),
                None => {
                    debug!("Joining in-flight issuance for {}", hostname);
                    return slot.cell.clone();
                }
            }
        } else {
            debug!("Cache MISS for {}", hostname);
        }

        let cell: Cell = Arc::new(OnceCell::new());
        slots.insert(
            hostname.to_string(),
            Slot {
                cell: cell.clone(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
        Self::enforce_size_limit(&mut slots, self.max_entries, hostname);
        cell
    }

    fn enforce_size_limit(slots: &mut HashMap<String, Slot>, max_entries: usize, keep: &str) {
        if slots.len() <= max_entries {
            return;
        }

        // Slots with an issuance still in flight are never evicted
        let mut entries: Vec<(String, u64)> = slots
            .iter()
            .filter(|(hostname, slot)| hostname.as_str() != keep && slot.cell.initialized())
            .map(|(hostname, slot)| (hostname.clone(), slot.seq))
            .collect();
        entries.sort_by_key(|(_, seq)| *seq);

        let to_remove = slots.len() - max_entries;
        for (hostname, _) in entries.iter().take(to_remove) {
            slots.remove(hostname);
            debug!("Evicted cached leaf for {}", hostname);
        }
    }

    /// Number of issued leaves currently cached
    pub fn len(&self) -> usize {
        self.lock().values().filter(|slot| slot.cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn leaf(hostname: &str, lifetime: Duration) -> LeafCertificate {
        let now = SystemTime::now();
        LeafCertificate::new(
            hostname.to_string(),
            Vec::new(),
            rustls::PrivateKey(Vec::new()),
            now,
            now + lifetime,
        )
    }

    const YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);
    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    #[tokio::test]
    async fn test_hit_reuses_entry() {
        let cache = LeafCache::new(10, WEEK);
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_issue("a.test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(leaf("a.test", YEAR))
            })
            .await
            .unwrap();
        let second = cache
            .get_or_issue("a.test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(leaf("a.test", YEAR))
            })
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache = LeafCache::new(10, WEEK);
        let failed = cache
            .get_or_issue("b.test", || async {
                Err(Error::issuance("b.test", "signer unavailable"))
            })
            .await;
        assert!(matches!(failed, Err(Error::CertificateIssuance { .. })));
        assert!(cache.is_empty());

        let ok = cache
            .get_or_issue("b.test", || async { Ok(leaf("b.test", YEAR)) })
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_near_expiry_is_reissued() {
        let cache = LeafCache::new(10, WEEK);
        let stale = cache
            .get_or_issue("c.test", || async { Ok(leaf("c.test", Duration::from_secs(60))) })
            .await
            .unwrap();
        let fresh = cache
            .get_or_issue("c.test", || async { Ok(leaf("c.test", YEAR)) })
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
    }

    #[tokio::test]
    async fn test_oldest_entries_evicted() {
        let cache = LeafCache::new(2, WEEK);
        for host in ["one.test", "two.test", "three.test"] {
            cache
                .get_or_issue(host, || async move { Ok(leaf(host, YEAR)) })
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 2);

        let calls = AtomicUsize::new(0);
        cache
            .get_or_issue("one.test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(leaf("one.test", YEAR))
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_flight_issuance_survives_eviction() {
        let cache = Arc::new(LeafCache::new(1, WEEK));
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let first = {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                cache
                    .get_or_issue("slow.test", || async move {
                        started.notify_one();
                        release.notified().await;
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(leaf("slow.test", YEAR))
                    })
                    .await
                    .unwrap()
            })
        };
        started.notified().await;

        // Fills the single entry while slow.test is still issuing
        cache
            .get_or_issue("fast.test", || async { Ok(leaf("fast.test", YEAR)) })
            .await
            .unwrap();

        let (second, _) = tokio::join!(
            cache.get_or_issue("slow.test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(leaf("slow.test", YEAR))
            }),
            async { release.notify_one() },
        );
        let first = first.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second.unwrap()));
    }
}
