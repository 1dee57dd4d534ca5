//! # LRU+TTL Cache
//!
//! A bounded-entry, bounded-memory, expiring cache sitting in front of the
//! backend. Reads that hit here never touch the disk.
//!
//! ## Data Structure: Arena + Indices
//!
//! The classic LRU shape is a hash map pointing into a doubly-linked list.
//! In an ownership language the clean materialization is an arena: the node
//! slab owns every node, the map stores indices into the slab, and list
//! linkage is plain `usize` back/forward indices. Two sentinel nodes bracket
//! the list so splicing never branches on the ends:
//!
//! ```text
//!   map: key → slab index
//!
//!   [HEAD] ⇄ mru ⇄ ... ⇄ lru ⇄ [TAIL]
//!    idx 0                      idx 1
//! ```
//!
//! Every position update (hit promotion, insert, evict) is O(1).
//!
//! ## Expiry
//!
//! Entries expire lazily on access and eagerly via a periodic sweep. The
//! sweep runs as a background tokio task holding only a `Weak` reference, so
//! it neither keeps the cache alive nor holds the process open; it scans from
//! the LRU end in small chunks, yielding between chunks so it never starves
//! foreground operations.
//!
//! ## Memory Accounting
//!
//! Each node carries an estimated byte size computed by a deterministic,
//! traversal-bounded procedure (depth ≤ 10, ≤ 100 array elements sampled,
//! ≤ 50 object fields with a per-missed-field overhead added back). The
//! estimate is intentionally cheap and stable rather than exact.
//!
//! ## Invariants
//!
//! - After any `set` returns: `size ≤ max_size`, and `memory_bytes ≤
//!   max_memory_bytes` unless the single just-inserted entry alone exceeds
//!   the budget (it is never self-evicted; the entry count bound still holds).
//! - At most 1000 evictions per `set` call.
//! - An expired entry is never returned; touching one removes it and counts
//!   toward `expirations`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::value::Value;

/// Sentinel index meaning "no node".
const NIL: usize = usize::MAX;

/// Slab index of the MRU-side sentinel.
const HEAD: usize = 0;

/// Slab index of the LRU-side sentinel.
const TAIL: usize = 1;

/// Eviction cap per `set`, so one oversized value cannot loop the evictor.
const MAX_EVICTIONS_PER_SET: usize = 1000;

/// Fixed per-node bookkeeping overhead added to every size estimate.
const NODE_OVERHEAD: usize = 80;

/// Nodes examined per sweep chunk before yielding.
const SWEEP_CHUNK: usize = 64;

// =============================================================================
// Size Estimation
// =============================================================================

/// Traversal depth bound for the size estimator.
const ESTIMATE_MAX_DEPTH: usize = 10;

/// Array/set/map elements sampled before extrapolating.
const ESTIMATE_MAX_SAMPLE: usize = 100;

/// Object fields walked before charging flat overhead per remaining field.
const ESTIMATE_MAX_FIELDS: usize = 50;

/// Flat charge for each object field beyond the walk bound.
const MISSED_FIELD_OVERHEAD: usize = 64;

/// Estimates the in-memory footprint of a value, in bytes.
///
/// Deterministic and bounded: the same value always yields the same number,
/// and the traversal visits at most `ESTIMATE_MAX_DEPTH` levels,
/// `ESTIMATE_MAX_SAMPLE` sequence elements, and `ESTIMATE_MAX_FIELDS` object
/// fields per node. Beyond those bounds it extrapolates (sequences) or adds
/// flat overhead (objects).
pub(crate) fn estimate_value_size(value: &Value) -> usize {
    estimate_at_depth(value, 0)
}

fn estimate_at_depth(value: &Value, depth: usize) -> usize {
    if depth >= ESTIMATE_MAX_DEPTH {
        return MISSED_FIELD_OVERHEAD;
    }

    match value {
        Value::Null | Value::Undefined | Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::BigInt(digits) => 16 + digits.len(),
        Value::String(s) => 24 + s.len(),
        Value::Date(_) => 32,
        Value::Regex { source, flags } => 24 + source.len() + flags.len(),
        Value::Bytes(b) | Value::DataView(b) => 24 + b.len(),
        Value::TypedArray { elements, .. } => 24 + elements.len() * 8,
        Value::ErrorValue {
            name,
            message,
            stack,
        } => 24 + name.len() + message.len() + stack.as_ref().map_or(0, String::len),
        Value::Array(items) | Value::Set(items) => estimate_sequence(items, depth),
        Value::Map(entries) => {
            let sampled: usize = entries
                .iter()
                .take(ESTIMATE_MAX_SAMPLE)
                .map(|(k, v)| estimate_at_depth(k, depth + 1) + estimate_at_depth(v, depth + 1))
                .sum();
            24 + extrapolate(sampled, entries.len())
        }
        Value::Object(fields) => {
            let mut total = 24;
            for (key, field) in fields.iter().take(ESTIMATE_MAX_FIELDS) {
                total += key.len() + estimate_at_depth(field, depth + 1);
            }
            if fields.len() > ESTIMATE_MAX_FIELDS {
                total += (fields.len() - ESTIMATE_MAX_FIELDS) * MISSED_FIELD_OVERHEAD;
            }
            total
        }
    }
}

fn estimate_sequence(items: &[Value], depth: usize) -> usize {
    let sampled: usize = items
        .iter()
        .take(ESTIMATE_MAX_SAMPLE)
        .map(|v| estimate_at_depth(v, depth + 1))
        .sum();
    24 + extrapolate(sampled, items.len())
}

/// Scales a sampled total up to the full length, deterministically.
fn extrapolate(sampled: usize, len: usize) -> usize {
    if len <= ESTIMATE_MAX_SAMPLE {
        sampled
    } else {
        sampled + (len - ESTIMATE_MAX_SAMPLE) * (sampled / ESTIMATE_MAX_SAMPLE.max(1))
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// A point-in-time snapshot of cache statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that fell through to the backend.
    pub misses: u64,
    /// Entries removed to satisfy the size or memory bound.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
    /// Current entry count.
    pub size: usize,
    /// Current estimated memory footprint.
    pub memory_bytes: usize,
    /// `hits / (hits + misses)`, or 0 when there were no lookups.
    pub hit_rate: f64,
}

// =============================================================================
// Nodes and Arena
// =============================================================================

struct Node {
    key: String,
    value: Value,
    expires_at: Option<Instant>,
    size_bytes: usize,
    prev: usize,
    next: usize,
}

impl Node {
    fn sentinel() -> Self {
        Node {
            key: String::new(),
            value: Value::Undefined,
            expires_at: None,
            size_bytes: 0,
            prev: NIL,
            next: NIL,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct CacheInner {
    map: HashMap<String, usize>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    memory_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheInner {
    fn new() -> Self {
        let mut head = Node::sentinel();
        let mut tail = Node::sentinel();
        head.next = TAIL;
        tail.prev = HEAD;
        CacheInner {
            map: HashMap::new(),
            nodes: vec![Some(head), Some(tail)],
            free: Vec::new(),
            memory_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("live node")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("live node")
    }

    /// Splices a node out of the list. The node stays in the slab.
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        self.node_mut(prev).next = next;
        self.node_mut(next).prev = prev;
    }

    /// Inserts a node right after the MRU sentinel.
    fn link_front(&mut self, idx: usize) {
        let old_first = self.node(HEAD).next;
        {
            let node = self.node_mut(idx);
            node.prev = HEAD;
            node.next = old_first;
        }
        self.node_mut(HEAD).next = idx;
        self.node_mut(old_first).prev = idx;
    }

    fn touch(&mut self, idx: usize) {
        self.unlink(idx);
        self.link_front(idx);
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    /// Removes a node entirely: list, map, slab, and memory accounting.
    fn remove(&mut self, idx: usize) -> Node {
        self.unlink(idx);
        let node = self.nodes[idx].take().expect("live node");
        self.map.remove(&node.key);
        self.memory_bytes = self.memory_bytes.saturating_sub(node.size_bytes);
        self.free.push(idx);
        node
    }

    /// Index of the least-recently-used live node, if any.
    fn lru_index(&self) -> Option<usize> {
        let idx = self.node(TAIL).prev;
        (idx != HEAD).then_some(idx)
    }

    fn reset(&mut self) {
        *self = CacheInner::new();
    }
}

// =============================================================================
// Cache
// =============================================================================

/// The LRU+TTL cache.
///
/// Interior-mutable and cheap to share: every operation takes `&self` and
/// completes under one short mutex hold, so it is safe to call between the
/// façade's suspension points without ever blocking across an `.await`.
pub struct Cache {
    inner: Mutex<CacheInner>,
    max_size: usize,
    max_memory_bytes: usize,
    default_ttl: Option<Duration>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    /// Creates a cache with the given entry bound, memory bound, and default
    /// TTL (`None` disables expiry).
    ///
    /// The periodic sweep is not started here; call [`Cache::spawn_sweeper`]
    /// on the shared handle once a runtime is available.
    pub fn new(max_size: usize, max_memory_bytes: usize, default_ttl: Option<Duration>) -> Self {
        Cache {
            inner: Mutex::new(CacheInner::new()),
            max_size,
            max_memory_bytes,
            default_ttl,
            sweeper: Mutex::new(None),
        }
    }

    /// Looks up a key, promoting it to MRU on a hit.
    ///
    /// Counts a hit or a miss; an expired entry is removed and counts toward
    /// both `misses` and `expirations`.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cache lock");

        let Some(&idx) = inner.map.get(key) else {
            inner.misses += 1;
            return None;
        };

        if inner.node(idx).is_expired(now) {
            inner.remove(idx);
            inner.misses += 1;
            inner.expirations += 1;
            return None;
        }

        inner.touch(idx);
        inner.hits += 1;
        Some(inner.node(idx).value.clone())
    }

    /// Upserts a key.
    ///
    /// `ttl_ms` overrides the cache default for this entry: `Some(0)` disables
    /// expiry, `Some(n)` expires after `n` milliseconds, `None` uses the
    /// default. After the upsert, entries are evicted from the LRU end until
    /// both bounds hold, capped at [`MAX_EVICTIONS_PER_SET`]; the entry being
    /// set is never evicted by its own call.
    pub fn set(&self, key: &str, value: Value, ttl_ms: Option<u64>) {
        let now = Instant::now();
        let size_bytes = NODE_OVERHEAD + key.len() + estimate_value_size(&value);
        let expires_at = match ttl_ms {
            Some(0) => None,
            Some(ms) => Some(now + Duration::from_millis(ms)),
            None => self.default_ttl.map(|ttl| now + ttl),
        };

        let mut inner = self.inner.lock().expect("cache lock");

        let idx = if let Some(&idx) = inner.map.get(key) {
            let old_size = inner.node(idx).size_bytes;
            inner.memory_bytes = inner.memory_bytes.saturating_sub(old_size);
            inner.memory_bytes += size_bytes;
            {
                let node = inner.node_mut(idx);
                node.value = value;
                node.expires_at = expires_at;
                node.size_bytes = size_bytes;
            }
            inner.touch(idx);
            idx
        } else {
            let idx = inner.alloc(Node {
                key: key.to_string(),
                value,
                expires_at,
                size_bytes,
                prev: NIL,
                next: NIL,
            });
            inner.link_front(idx);
            inner.map.insert(key.to_string(), idx);
            inner.memory_bytes += size_bytes;
            idx
        };

        let mut evicted = 0;
        while evicted < MAX_EVICTIONS_PER_SET
            && (inner.map.len() > self.max_size || inner.memory_bytes > self.max_memory_bytes)
        {
            let Some(lru) = inner.lru_index() else { break };
            if lru == idx {
                // A single entry larger than the memory budget stays resident;
                // the entry-count bound still holds.
                break;
            }
            inner.remove(lru);
            inner.evictions += 1;
            evicted += 1;
        }
    }

    /// Removes a key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("cache lock");
        match inner.map.get(key).copied() {
            Some(idx) => {
                inner.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Membership check without promoting to MRU and without counting hits
    /// or misses. An expired entry is still removed and counted in
    /// `expirations`.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cache lock");
        let Some(&idx) = inner.map.get(key) else {
            return false;
        };
        if inner.node(idx).is_expired(now) {
            inner.remove(idx);
            inner.expirations += 1;
            return false;
        }
        true
    }

    /// Reads a key without touching recency, statistics, or expiry state.
    ///
    /// Used by the transaction engine to snapshot pre-transaction cache
    /// contents. An expired entry reads as absent but is left in place for
    /// the normal paths to reap.
    pub(crate) fn peek(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("cache lock");
        let &idx = inner.map.get(key)?;
        let node = inner.node(idx);
        if node.is_expired(now) {
            None
        } else {
            Some(node.value.clone())
        }
    }

    /// Drops every entry, keeping counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock");
        let (hits, misses, evictions, expirations) =
            (inner.hits, inner.misses, inner.evictions, inner.expirations);
        inner.reset();
        inner.hits = hits;
        inner.misses = misses;
        inner.evictions = evictions;
        inner.expirations = expirations;
    }

    /// Drops every entry and stops the periodic sweep.
    pub fn destroy(&self) {
        self.clear();
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock").take() {
            handle.abort();
        }
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock").map.len()
    }

    /// True when no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current estimated memory footprint in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.inner.lock().expect("cache lock").memory_bytes
    }

    /// Snapshot of the statistics counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock");
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            size: inner.map.len(),
            memory_bytes: inner.memory_bytes,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }

    /// Zeroes the statistics counters.
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
        inner.expirations = 0;
    }

    /// Keys currently cached, ordered MRU-first. Test and debugging aid.
    pub fn keys_by_recency(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("cache lock");
        let mut keys = Vec::with_capacity(inner.map.len());
        let mut idx = inner.node(HEAD).next;
        while idx != TAIL {
            let node = inner.node(idx);
            keys.push(node.key.clone());
            idx = node.next;
        }
        keys
    }

    // =========================================================================
    // Periodic Sweep
    // =========================================================================

    /// The sweep period for a given default TTL:
    /// `max(1000 ms, min(ttl / 10, 60000 ms))`.
    fn sweep_period(ttl: Duration) -> Duration {
        let tenth = ttl / 10;
        tenth.clamp(Duration::from_millis(1000), Duration::from_millis(60_000))
    }

    /// Starts the background expiry sweep when a default TTL is configured.
    ///
    /// The task holds only a `Weak` reference: dropping the last strong
    /// handle ends the sweep, and the task never keeps the process alive
    /// past the cache's owner.
    pub fn spawn_sweeper(cache: &Arc<Self>) {
        let Some(ttl) = cache.default_ttl else { return };
        let period = Self::sweep_period(ttl);
        let weak: Weak<Cache> = Arc::downgrade(cache);

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                cache.sweep_expired().await;
            }
        });

        *cache.sweeper.lock().expect("sweeper lock") = Some(handle);
    }

    /// Purges expired entries, scanning from the LRU end.
    ///
    /// Works in chunks and yields between them so foreground operations are
    /// never held off for the duration of a full scan.
    pub(crate) async fn sweep_expired(&self) -> usize {
        // Snapshot candidates under one short lock; re-check on removal.
        let candidates: Vec<String> = {
            let inner = self.inner.lock().expect("cache lock");
            let now = Instant::now();
            let mut expired = Vec::new();
            let mut idx = inner.node(TAIL).prev;
            while idx != HEAD {
                let node = inner.node(idx);
                if node.is_expired(now) {
                    expired.push(node.key.clone());
                }
                idx = node.prev;
            }
            expired
        };

        let mut purged = 0;
        for chunk in candidates.chunks(SWEEP_CHUNK) {
            {
                let mut inner = self.inner.lock().expect("cache lock");
                let now = Instant::now();
                for key in chunk {
                    if let Some(&idx) = inner.map.get(key) {
                        if inner.node(idx).is_expired(now) {
                            inner.remove(idx);
                            inner.expirations += 1;
                            purged += 1;
                        }
                    }
                }
            }
            tokio::task::yield_now().await;
        }

        if purged > 0 {
            tracing::debug!(purged, "cache sweep removed expired entries");
        }
        purged
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock").take() {
            handle.abort();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
