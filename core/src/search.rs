use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::store::{ClipboardEntry, ClipboardStore};
use crate::{DECODED_CACHE_SIZE, SEARCH_DEBOUNCE_MS};

/// Live filtered view over the store. With an empty query the entries are
/// the full store in store order.
#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub query: String,
    pub entries: Vec<Arc<ClipboardEntry>>,
}

enum WorkerEvent {
    Query(String),
    StoreChanged,
}

/// Handle to the search worker. Dropping it shuts the worker down.
pub struct SearchHandle {
    tx: mpsc::UnboundedSender<WorkerEvent>,
    results: watch::Receiver<SearchResults>,
}

impl SearchHandle {
    pub fn set_query(&self, query: impl Into<String>) {
        let _ = self.tx.send(WorkerEvent::Query(query.into()));
    }

    /// Tells the worker the store mutated. The published view follows the
    /// store only while no filter is active; an in-progress non-empty
    /// search is left alone until the next query change.
    pub fn notify_store_changed(&self) {
        let _ = self.tx.send(WorkerEvent::StoreChanged);
    }

    pub fn results(&self) -> watch::Receiver<SearchResults> {
        self.results.clone()
    }

    pub fn current(&self) -> SearchResults {
        self.results.borrow().clone()
    }
}

pub fn spawn(store: Arc<RwLock<ClipboardStore>>) -> SearchHandle {
    spawn_with_debounce(store, Duration::from_millis(SEARCH_DEBOUNCE_MS))
}

/// Starts the search worker: timer-coalesce, dedupe by equality against
/// the previously evaluated query, evaluate off the interactive path,
/// publish on a watch channel.
pub fn spawn_with_debounce(
    store: Arc<RwLock<ClipboardStore>>,
    debounce: Duration,
) -> SearchHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let initial = SearchResults {
        query: String::new(),
        entries: store.read().entries().to_vec(),
    };
    let (results_tx, results_rx) = watch::channel(initial);

    tokio::spawn(worker(store, rx, results_tx, debounce));

    SearchHandle {
        tx,
        results: results_rx,
    }
}

async fn worker(
    store: Arc<RwLock<ClipboardStore>>,
    mut rx: mpsc::UnboundedReceiver<WorkerEvent>,
    results_tx: watch::Sender<SearchResults>,
    debounce: Duration,
) {
    let cache_size = NonZeroUsize::new(DECODED_CACHE_SIZE)
        .unwrap_or(NonZeroUsize::MIN);
    let mut cache: LruCache<blake3::Hash, Arc<String>> = LruCache::new(cache_size);
    let mut last_evaluated = String::new();

    while let Some(event) = rx.recv().await {
        let mut pending = match event {
            WorkerEvent::StoreChanged => {
                if last_evaluated.is_empty() {
                    results_tx.send_replace(SearchResults {
                        query: String::new(),
                        entries: store.read().entries().to_vec(),
                    });
                }
                continue;
            }
            WorkerEvent::Query(query) => query,
        };

        // quiet period: newer queries replace the pending one and restart
        // the window; store-change notices are moot, evaluation below sees
        // the latest store anyway
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(WorkerEvent::Query(newer))) => pending = newer,
                Ok(Some(WorkerEvent::StoreChanged)) => {}
                Ok(None) => return,
                Err(_) => break,
            }
        }

        if pending == last_evaluated {
            continue;
        }

        let entries = evaluate(&store, &pending, &mut cache);
        last_evaluated = pending.clone();
        results_tx.send_replace(SearchResults {
            query: pending,
            entries,
        });
    }
}

fn evaluate(
    store: &RwLock<ClipboardStore>,
    query: &str,
    cache: &mut LruCache<blake3::Hash, Arc<String>>,
) -> Vec<Arc<ClipboardEntry>> {
    // snapshot under the read lock; the substring scan runs without it
    let entries = store.read().entries().to_vec();
    if query.is_empty() {
        return entries;
    }

    let needle = query.to_lowercase();
    entries
        .into_iter()
        .filter(|entry| {
            let decoded = match cache.get(&entry.hash()) {
                Some(decoded) => Arc::clone(decoded),
                None => {
                    let decoded =
                        Arc::new(entry.decoded_text().unwrap_or_default().to_lowercase());
                    cache.put(entry.hash(), Arc::clone(&decoded));
                    decoded
                }
            };
            decoded.contains(&needle)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RawItem;
    use crate::Config;
    use tempfile::TempDir;
    use tokio::task::yield_now;
    use tokio::time::advance;

    fn shared_store(dir: &TempDir) -> Arc<RwLock<ClipboardStore>> {
        let config = Config {
            history_path: dir.path().join("history.json"),
            ..Config::default()
        };
        Arc::new(RwLock::new(ClipboardStore::open(&config).unwrap()))
    }

    async fn settle() {
        for _ in 0..8 {
            yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_query_yields_store_order() {
        let dir = TempDir::new().unwrap();
        let store = shared_store(&dir);
        store.write().capture(&RawItem::text("alpha"));
        store.write().capture(&RawItem::text("beta"));

        let handle = spawn_with_debounce(Arc::clone(&store), Duration::from_millis(300));
        let texts: Vec<_> = handle
            .current()
            .entries
            .iter()
            .map(|e| e.decoded_text().unwrap())
            .collect();
        assert_eq!(texts, ["beta", "alpha"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unique_substring_selects_one_entry() {
        let dir = TempDir::new().unwrap();
        let store = shared_store(&dir);
        store.write().capture(&RawItem::text("alpha"));
        store.write().capture(&RawItem::text("beta"));

        let handle = spawn_with_debounce(Arc::clone(&store), Duration::from_millis(300));
        handle.set_query("BET");
        settle().await;
        advance(Duration::from_millis(350)).await;
        settle().await;

        let results = handle.current();
        assert_eq!(results.query, "BET");
        assert_eq!(results.entries.len(), 1);
        assert_eq!(results.entries[0].decoded_text().unwrap(), "beta");
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_identical_queries_evaluate_once() {
        let dir = TempDir::new().unwrap();
        let store = shared_store(&dir);
        store.write().capture(&RawItem::text("alpha"));

        let handle = spawn_with_debounce(Arc::clone(&store), Duration::from_millis(300));
        let mut rx = handle.results();
        rx.borrow_and_update();

        handle.set_query("al");
        handle.set_query("al");
        handle.set_query("al");
        settle().await;
        advance(Duration::from_millis(350)).await;
        settle().await;

        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        // the same query again is suppressed without a publication
        handle.set_query("al");
        settle().await;
        advance(Duration::from_millis(350)).await;
        settle().await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn captures_do_not_disturb_an_active_filter() {
        let dir = TempDir::new().unwrap();
        let store = shared_store(&dir);
        store.write().capture(&RawItem::text("needle one"));

        let handle = spawn_with_debounce(Arc::clone(&store), Duration::from_millis(300));
        handle.set_query("needle");
        settle().await;
        advance(Duration::from_millis(350)).await;
        settle().await;
        assert_eq!(handle.current().entries.len(), 1);

        let mut rx = handle.results();
        rx.borrow_and_update();

        store.write().capture(&RawItem::text("needle two"));
        handle.notify_store_changed();
        settle().await;
        assert!(!rx.has_changed().unwrap());
        assert_eq!(handle.current().entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_query_view_tracks_the_store() {
        let dir = TempDir::new().unwrap();
        let store = shared_store(&dir);

        let handle = spawn_with_debounce(Arc::clone(&store), Duration::from_millis(300));
        assert!(handle.current().entries.is_empty());

        store.write().capture(&RawItem::text("fresh"));
        handle.notify_store_changed();
        settle().await;

        let results = handle.current();
        assert!(results.query.is_empty());
        assert_eq!(results.entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_the_query_restores_the_full_view() {
        let dir = TempDir::new().unwrap();
        let store = shared_store(&dir);
        store.write().capture(&RawItem::text("alpha"));
        store.write().capture(&RawItem::text("beta"));

        let handle = spawn_with_debounce(Arc::clone(&store), Duration::from_millis(300));
        handle.set_query("alp");
        settle().await;
        advance(Duration::from_millis(350)).await;
        settle().await;
        assert_eq!(handle.current().entries.len(), 1);

        handle.set_query("");
        settle().await;
        advance(Duration::from_millis(350)).await;
        settle().await;
        assert_eq!(handle.current().entries.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn image_entries_do_not_match_text_queries() {
        let dir = TempDir::new().unwrap();
        let store = shared_store(&dir);
        let png = crate::store::rgba_to_png(1, 1, &[0u8; 4]).unwrap();
        store
            .write()
            .capture(&RawItem::new().with(crate::store::ContentKind::ImagePng.tag(), png));
        store.write().capture(&RawItem::text("text entry"));

        let handle = spawn_with_debounce(Arc::clone(&store), Duration::from_millis(300));
        handle.set_query("entry");
        settle().await;
        advance(Duration::from_millis(350)).await;
        settle().await;

        let results = handle.current();
        assert_eq!(results.entries.len(), 1);
        assert_eq!(results.entries[0].kind(), crate::store::ContentKind::Text);
    }
}
