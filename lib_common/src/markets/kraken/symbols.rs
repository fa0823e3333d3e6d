//! # Symbol Resolver
//!
//! Maps any user spelling of a pair (`BTC/USD`, `btc-usd`, `XRP`) to the
//! provider's canonical pair name (`XBTUSD`, `XRPUSD`). Resolution never
//! fails: an alias nothing recognizes comes back normalized but otherwise
//! unchanged.
//!
//! Lookup order:
//! 1. the static override table,
//! 2. exact match against the catalog-derived alias map,
//! 3. base-currency index, picking the first quote in [`QUOTE_PREFERENCE`],
//! 4. the normalized alias itself.
//!
//! The catalog is fetched lazily on first use and persisted to disk. A
//! catalog file counts as present when it carries the `pairs` field; it has
//! no expiry. A miss against a disk-loaded catalog triggers one refresh.
//!
//! Every fetch is bounded by a timeout. After a failed fetch, lookups against
//! a cold catalog skip the provider for a short back-off window and resolve
//! heuristically instead.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Envelope;
use crate::retrieve::ApiClient;

/// Aliases whose provider name differs from the common ticker.
pub const OVERRIDES: &[(&str, &str)] = &[
    ("BTC", "XBTUSD"),
    ("BTCUSD", "XBTUSD"),
    ("BTCUSDT", "XBTUSDT"),
    ("BTCEUR", "XBTEUR"),
    ("BTCUSDC", "XBTUSDC"),
    ("DOGE", "XDGUSD"),
    ("DOGEUSD", "XDGUSD"),
];

/// Upper bound on one catalog fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a cold resolver waits after a failed fetch before trying again.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Quote currencies tried, in order, when an alias names only a base.
pub const QUOTE_PREFERENCE: &[&str] = &["USD", "USDT", "EUR", "XBT", "USDC"];

/// Strips everything but ASCII alphanumerics and upper-cases the rest.
pub fn normalize_alias(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn override_for(normalized: &str) -> Option<&'static str> {
    OVERRIDES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, canonical)| *canonical)
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog fetch failed: {0}")]
    Fetch(String),
    #[error("catalog fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("catalog fetch failed recently, next attempt in {0:?}")]
    Backoff(Duration),
    #[error("catalog decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("catalog cache io: {0}")]
    Io(#[from] std::io::Error),
}

/// One tradable pair from the provider catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairInfo {
    /// Canonical symbol, the provider's `altname` (`XBTUSD`).
    pub canonical: String,
    /// Name used on the WebSocket feed (`XBT/USD`).
    pub wsname: String,
    pub base: String,
    pub quote: String,
}

/// Where the pair catalog comes from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_pairs(&self) -> Result<Vec<PairInfo>, CatalogError>;
}

#[derive(Debug, Deserialize)]
struct AssetPairEntry {
    altname: String,
    wsname: Option<String>,
    base: String,
    quote: String,
}

/// Legacy asset codes carry an `X`/`Z` class prefix (`XXBT`, `ZUSD`).
fn strip_asset_class(code: &str) -> &str {
    if code.len() == 4 && (code.starts_with('X') || code.starts_with('Z')) {
        &code[1..]
    } else {
        code
    }
}

/// Reads `AssetPairs` from the public REST API.
pub struct KrakenCatalogSource {
    client: ApiClient,
}

impl KrakenCatalogSource {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    fn pairs_from_result(result: BTreeMap<String, AssetPairEntry>) -> Vec<PairInfo> {
        result
            .into_values()
            // Dark-pool pairs (`.d`) have no feed name.
            .filter_map(|entry| {
                let wsname = entry.wsname?;
                let (base, quote) = match wsname.split_once('/') {
                    Some((b, q)) => (b.to_string(), q.to_string()),
                    None => (
                        strip_asset_class(&entry.base).to_string(),
                        strip_asset_class(&entry.quote).to_string(),
                    ),
                };
                Some(PairInfo {
                    canonical: entry.altname,
                    wsname,
                    base,
                    quote,
                })
            })
            .collect()
    }
}

#[async_trait]
impl CatalogSource for KrakenCatalogSource {
    async fn fetch_pairs(&self) -> Result<Vec<PairInfo>, CatalogError> {
        let resp = self
            .client
            .get_json::<Envelope<BTreeMap<String, AssetPairEntry>>>("AssetPairs", &[])
            .await
            .map_err(|e| CatalogError::Fetch(e.to_string()))?;
        if !resp.success {
            return Err(CatalogError::Fetch(format!(
                "AssetPairs returned HTTP {}",
                resp.status
            )));
        }
        let envelope = resp
            .data
            .ok_or_else(|| CatalogError::Fetch("empty AssetPairs body".to_string()))?;
        let result = envelope
            .into_result()
            .map_err(|errors| CatalogError::Fetch(errors.join("; ")))?;
        Ok(Self::pairs_from_result(result))
    }
}

/// Lookup indexes built from one catalog snapshot.
#[derive(Debug, Default)]
struct SymbolTable {
    by_alias: HashMap<String, String>,
    by_base: HashMap<String, Vec<(String, String)>>,
    wire_names: HashMap<String, String>,
    by_wire: HashMap<String, String>,
    pair_count: usize,
}

impl SymbolTable {
    fn build(pairs: &[PairInfo]) -> Self {
        let mut sorted: Vec<&PairInfo> = pairs.iter().collect();
        sorted.sort_by(|a, b| a.canonical.cmp(&b.canonical));

        let mut table = SymbolTable {
            pair_count: sorted.len(),
            ..Default::default()
        };
        // Canonical names win over derived aliases.
        for pair in &sorted {
            table
                .by_alias
                .insert(normalize_alias(&pair.canonical), pair.canonical.clone());
        }
        for pair in &sorted {
            let derived = [
                normalize_alias(&pair.wsname),
                normalize_alias(&format!("{}{}", pair.base, pair.quote)),
            ];
            for alias in derived {
                table.by_alias.entry(alias).or_insert_with(|| pair.canonical.clone());
            }
            table
                .by_base
                .entry(normalize_alias(&pair.base))
                .or_default()
                .push((pair.quote.clone(), pair.canonical.clone()));
            table
                .wire_names
                .insert(pair.canonical.clone(), pair.wsname.clone());
            table
                .by_wire
                .insert(pair.wsname.clone(), pair.canonical.clone());
        }
        table
    }

    fn lookup(&self, normalized: &str) -> Option<String> {
        if let Some(canonical) = self.by_alias.get(normalized) {
            return Some(canonical.clone());
        }
        let candidates = self.by_base.get(normalized)?;
        QUOTE_PREFERENCE
            .iter()
            .find_map(|quote| {
                candidates
                    .iter()
                    .find(|(q, _)| q == quote)
                    .map(|(_, canonical)| canonical.clone())
            })
            .or_else(|| candidates.first().map(|(_, canonical)| canonical.clone()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogCacheFile {
    #[serde(default)]
    fetched_at: i64,
    /// Presence marker: a file without it is treated as cold.
    pairs: Option<Vec<PairInfo>>,
}

/// Alias to canonical symbol resolution backed by a refreshable catalog.
pub struct SymbolResolver {
    source: Arc<dyn CatalogSource>,
    cache_path: Option<PathBuf>,
    table: RwLock<Option<Arc<SymbolTable>>>,
    from_disk: AtomicBool,
    load_lock: tokio::sync::Mutex<()>,
    fetch_timeout: Duration,
    retry_after: Duration,
    last_failure: Mutex<Option<Instant>>,
}

impl SymbolResolver {
    pub fn new(source: Arc<dyn CatalogSource>, cache_path: Option<PathBuf>) -> Self {
        Self {
            source,
            cache_path,
            table: RwLock::new(None),
            from_disk: AtomicBool::new(false),
            load_lock: tokio::sync::Mutex::new(()),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            retry_after: DEFAULT_RETRY_AFTER,
            last_failure: Mutex::new(None),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    fn note_fetch(&self, failed: bool) {
        *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) = failed.then(Instant::now);
    }

    /// Time left in the back-off window opened by the last failed fetch.
    fn backoff_remaining(&self) -> Option<Duration> {
        let failed_at = (*self.last_failure.lock().unwrap_or_else(PoisonError::into_inner))?;
        self.retry_after
            .checked_sub(failed_at.elapsed())
            .filter(|left| !left.is_zero())
    }

    fn current(&self) -> Option<Arc<SymbolTable>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install(&self, table: SymbolTable) -> usize {
        let count = table.pair_count;
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(table));
        count
    }

    pub fn is_loaded(&self) -> bool {
        self.current().is_some()
    }

    /// Pairs in the loaded catalog, 0 when cold.
    pub fn pair_count(&self) -> usize {
        self.current().map(|t| t.pair_count).unwrap_or(0)
    }

    fn lookup(&self, normalized: &str) -> Option<String> {
        if let Some(canonical) = override_for(normalized) {
            return Some(canonical.to_string());
        }
        self.current()?.lookup(normalized)
    }

    /// Resolves against whatever catalog is loaded right now, without I/O.
    pub fn resolve_cached(&self, alias: &str) -> String {
        let normalized = normalize_alias(alias);
        self.lookup(&normalized).unwrap_or(normalized)
    }

    /// Resolves `alias`, loading the catalog first if needed.
    pub async fn resolve(&self, alias: &str) -> String {
        if let Err(e) = self.ensure_loaded().await {
            log::warn!("Symbol catalog unavailable, resolving {:?} heuristically: {}", alias, e);
        }
        let normalized = normalize_alias(alias);
        if let Some(canonical) = self.lookup(&normalized) {
            return canonical;
        }

        // A disk catalog may predate the pair; verify once against the provider.
        if self.from_disk.swap(false, Ordering::SeqCst) {
            log::info!("{:?} not in cached catalog, refreshing", normalized);
            if let Err(e) = self.refresh().await {
                log::warn!("Symbol catalog refresh failed: {}", e);
            }
            if let Some(canonical) = self.lookup(&normalized) {
                return canonical;
            }
        }
        normalized
    }

    /// Loads the catalog from disk, or from the provider when the disk cache
    /// is cold. A no-op once loaded.
    ///
    /// # Errors
    /// `Backoff` inside the window after a failed fetch, otherwise whatever
    /// the fetch itself failed with.
    pub async fn ensure_loaded(&self) -> Result<(), CatalogError> {
        if self.is_loaded() {
            return Ok(());
        }
        if let Some(left) = self.backoff_remaining() {
            return Err(CatalogError::Backoff(left));
        }
        let _guard = self.load_lock.lock().await;
        if self.is_loaded() {
            return Ok(());
        }
        // Whoever held the lock may have just failed.
        if let Some(left) = self.backoff_remaining() {
            return Err(CatalogError::Backoff(left));
        }

        if let Some(path) = &self.cache_path {
            if let Some(pairs) = read_cache_file(path).await {
                let count = self.install(SymbolTable::build(&pairs));
                self.from_disk.store(true, Ordering::SeqCst);
                log::info!("Loaded {} pairs from {}", count, path.display());
                return Ok(());
            }
        }
        self.fetch_and_install().await.map(|_| ())
    }

    /// Rebuilds the catalog from the provider and persists it.
    pub async fn refresh(&self) -> Result<usize, CatalogError> {
        let _guard = self.load_lock.lock().await;
        self.fetch_and_install().await
    }

    async fn fetch_and_install(&self) -> Result<usize, CatalogError> {
        let fetched = tokio::time::timeout(self.fetch_timeout, self.source.fetch_pairs())
            .await
            .map_err(|_| CatalogError::Timeout(self.fetch_timeout))
            .and_then(|result| result);
        self.note_fetch(fetched.is_err());
        let pairs = fetched?;
        let count = self.install(SymbolTable::build(&pairs));
        self.from_disk.store(false, Ordering::SeqCst);
        log::info!("Symbol catalog built with {} pairs", count);

        if let Some(path) = &self.cache_path {
            if let Err(e) = write_cache_file(path, pairs).await {
                log::warn!("Could not persist symbol catalog to {}: {}", path.display(), e);
            }
        }
        Ok(count)
    }

    /// Feed name for a canonical pair, or the canonical name when unknown.
    pub fn wire_name(&self, canonical: &str) -> String {
        self.current()
            .and_then(|t| t.wire_names.get(canonical).cloned())
            .unwrap_or_else(|| canonical.to_string())
    }

    /// Canonical symbol for a feed name such as `XBT/USD`.
    pub fn canonical_for_wire(&self, wire: &str) -> String {
        self.current()
            .and_then(|t| t.by_wire.get(wire).cloned())
            .unwrap_or_else(|| self.resolve_cached(wire))
    }
}

async fn read_cache_file(path: &Path) -> Option<Vec<PairInfo>> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice::<CatalogCacheFile>(&bytes) {
        Ok(file) => file.pairs,
        Err(e) => {
            log::warn!("Ignoring unreadable catalog cache {}: {}", path.display(), e);
            None
        }
    }
}

async fn write_cache_file(path: &Path, pairs: Vec<PairInfo>) -> Result<(), CatalogError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file = CatalogCacheFile {
        fetched_at: chrono::Utc::now().timestamp_millis(),
        pairs: Some(pairs),
    };
    tokio::fs::write(path, serde_json::to_vec_pretty(&file)?).await?;
    Ok(())
}
