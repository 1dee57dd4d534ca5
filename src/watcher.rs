//! # Watchers & Change Notifications
//!
//! This module implements mutation notifications. Callers register a watcher
//! with a key pattern and a callback; every mutation fans out to the watchers
//! whose pattern matches the key, then publishes a global event on a
//! broadcast channel for stream-style consumers.
//!
//! ## Pattern Compilation
//!
//! Patterns compile once, at registration, into a tagged matcher:
//!
//! - `Exact("user:1")`: a literal without `*`, matched by equality
//! - `Glob(^user:.*$)`: a literal with `*`: every other regex metacharacter
//!   is escaped, `*` becomes `.*`, and the whole pattern is anchored
//! - `Re(...)`: a caller-supplied regex, tested against the key directly
//!
//! ## Safeguards
//!
//! Callbacks are untrusted code. Three protections keep one bad watcher from
//! hurting the store or its neighbors:
//!
//! 1. **Error isolation**: a callback error is caught, counted, and reported
//!    on the manager's error channel; it never propagates to the mutating
//!    caller and never stops the fan-out.
//! 2. **Auto-disable**: ten consecutive errors silently disable the watcher.
//!    One success resets the count.
//! 3. **Rate limiting**: each watcher gets at most 1000 invocations per
//!    sliding 1-second window; excess invocations are dropped silently.
//!
//! Watchers are invoked in creation order for a given event. Callbacks run
//! outside the registry lock, so a callback may register or remove watchers
//! without deadlocking.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use regex::Regex;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::value::Value;

// =============================================================================
// Configuration
// =============================================================================

/// Default watcher registration ceiling.
pub const DEFAULT_MAX_WATCHERS: usize = 1000;

/// Consecutive callback errors before a watcher is silently disabled.
pub const DEFAULT_MAX_ERRORS_BEFORE_DISABLE: u32 = 10;

/// Default per-watcher invocations allowed per rate-limit window.
pub const DEFAULT_MAX_CALLS_PER_WINDOW: usize = 1000;

/// Default sliding rate-limit window.
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_millis(1000);

/// Broadcast channel capacity for global events and watcher errors.
///
/// This determines how many events can be buffered before slow subscribers
/// start lagging. The per-watcher rate limit does not apply to the global
/// channel, so the buffer is sized for write bursts.
const BROADCAST_CAPACITY: usize = 10_000;

/// Returns the current time in milliseconds since the Unix epoch.
pub(crate) fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// Events
// =============================================================================

/// The kind of mutation a watcher event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Set,
    Delete,
    Push,
    Pull,
    Add,
    Subtract,
    Clear,
}

impl EventKind {
    /// The wire name of the event kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Set => "set",
            EventKind::Delete => "delete",
            EventKind::Push => "push",
            EventKind::Pull => "pull",
            EventKind::Add => "add",
            EventKind::Subtract => "subtract",
            EventKind::Clear => "clear",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification delivered to watchers and broadcast subscribers.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// What happened.
    pub event: EventKind,
    /// The affected key (empty for `clear`, which affects every key).
    pub key: String,
    /// The value after the mutation (`Undefined` for deletes and clears).
    pub value: Value,
    /// The value before the mutation, when known.
    pub old_value: Option<Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

/// An out-of-band report of a watcher callback failure.
#[derive(Debug, Clone)]
pub struct WatcherError {
    /// The failing watcher.
    pub watcher_id: WatcherId,
    /// The watcher's pattern text, for log correlation.
    pub pattern: String,
    /// The callback's error message.
    pub message: String,
}

// =============================================================================
// Patterns and Matchers
// =============================================================================

/// Identifier returned by [`WatcherManager::watch`].
pub type WatcherId = u64;

/// A watcher registration pattern.
#[derive(Debug, Clone)]
pub enum WatchPattern {
    /// A literal key, or a glob when it contains `*`.
    Literal(String),
    /// A regular expression tested against keys directly.
    Regex(Regex),
}

impl From<&str> for WatchPattern {
    fn from(s: &str) -> Self {
        WatchPattern::Literal(s.to_string())
    }
}

impl From<String> for WatchPattern {
    fn from(s: String) -> Self {
        WatchPattern::Literal(s)
    }
}

impl From<Regex> for WatchPattern {
    fn from(re: Regex) -> Self {
        WatchPattern::Regex(re)
    }
}

/// The compiled form a pattern takes at registration.
enum Matcher {
    Exact(String),
    Glob(Regex),
    Re(Regex),
}

impl Matcher {
    /// Compiles a pattern. Globs escape every metacharacter except `*`,
    /// which becomes `.*`, and anchor the whole string.
    fn compile(pattern: &WatchPattern) -> Result<Self> {
        match pattern {
            WatchPattern::Regex(re) => Ok(Matcher::Re(re.clone())),
            WatchPattern::Literal(text) => {
                if !text.contains('*') {
                    return Ok(Matcher::Exact(text.clone()));
                }
                let escaped: Vec<String> =
                    text.split('*').map(|part| regex::escape(part)).collect();
                let anchored = format!("^{}$", escaped.join(".*"));
                let re = Regex::new(&anchored)
                    .map_err(|e| Error::Config(format!("invalid watch pattern: {}", e)))?;
                Ok(Matcher::Glob(re))
            }
        }
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            Matcher::Exact(text) => text == key,
            Matcher::Glob(re) | Matcher::Re(re) => re.is_match(key),
        }
    }

    /// Display text for logs and error reports.
    fn describe(pattern: &WatchPattern) -> String {
        match pattern {
            WatchPattern::Literal(text) => text.clone(),
            WatchPattern::Regex(re) => re.as_str().to_string(),
        }
    }
}

// =============================================================================
// Watcher Manager
// =============================================================================

/// A registered callback. Errors are caught by the manager; returning `Err`
/// counts toward the watcher's disable threshold.
pub type WatchCallback =
    Arc<dyn Fn(&WatchEvent) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

struct WatcherEntry {
    pattern: String,
    matcher: Matcher,
    callback: WatchCallback,
    consecutive_errors: u32,
    disabled: bool,
    recent_calls: VecDeque<Instant>,
}

/// Owns the watcher registry and the broadcast channels.
pub struct WatcherManager {
    watchers: Mutex<BTreeMap<WatcherId, WatcherEntry>>,
    next_id: AtomicU64,
    max_watchers: usize,
    max_errors_before_disable: u32,
    max_calls_per_window: usize,
    rate_limit_window: Duration,
    events: broadcast::Sender<WatchEvent>,
    errors: broadcast::Sender<WatcherError>,
}

impl Default for WatcherManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherManager {
    /// Creates a manager with the default safeguards.
    pub fn new() -> Self {
        Self::with_limits(
            DEFAULT_MAX_WATCHERS,
            DEFAULT_MAX_ERRORS_BEFORE_DISABLE,
            DEFAULT_MAX_CALLS_PER_WINDOW,
            DEFAULT_RATE_LIMIT_WINDOW,
        )
    }

    /// Creates a manager with explicit safeguards (tests tighten these).
    pub fn with_limits(
        max_watchers: usize,
        max_errors_before_disable: u32,
        max_calls_per_window: usize,
        rate_limit_window: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (errors, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            watchers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            max_watchers,
            max_errors_before_disable,
            max_calls_per_window,
            rate_limit_window,
            events,
            errors,
        }
    }

    /// Registers a watcher. The pattern compiles once, here.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the registration ceiling is reached or a glob
    /// fails to compile.
    pub fn watch(
        &self,
        pattern: impl Into<WatchPattern>,
        callback: WatchCallback,
    ) -> Result<WatcherId> {
        let pattern = pattern.into();
        let matcher = Matcher::compile(&pattern)?;

        let mut watchers = self.watchers.lock().expect("watcher lock");
        if watchers.len() >= self.max_watchers {
            return Err(Error::Config(format!(
                "maximum number of watchers reached ({})",
                self.max_watchers
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        watchers.insert(
            id,
            WatcherEntry {
                pattern: Matcher::describe(&pattern),
                matcher,
                callback,
                consecutive_errors: 0,
                disabled: false,
                recent_calls: VecDeque::new(),
            },
        );
        Ok(id)
    }

    /// Removes a watcher. Returns whether it existed.
    pub fn unwatch(&self, id: WatcherId) -> bool {
        self.watchers
            .lock()
            .expect("watcher lock")
            .remove(&id)
            .is_some()
    }

    /// Removes every watcher.
    pub fn clear(&self) {
        self.watchers.lock().expect("watcher lock").clear();
    }

    /// Number of registered watchers (disabled ones included).
    pub fn count(&self) -> usize {
        self.watchers.lock().expect("watcher lock").len()
    }

    /// Subscribes to the global event stream (every mutation, no pattern).
    pub fn subscribe_events(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Subscribes to out-of-band watcher error reports.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<WatcherError> {
        self.errors.subscribe()
    }

    /// Fans a mutation out to matching watchers, then publishes the global
    /// event.
    ///
    /// Runs synchronously between the façade's suspension points. Callback
    /// panics are not caught: callbacks signal failure by returning `Err`,
    /// which is isolated here.
    pub fn notify(
        &self,
        event: EventKind,
        key: &str,
        value: Value,
        old_value: Option<Value>,
    ) {
        let watch_event = WatchEvent {
            event,
            key: key.to_string(),
            value,
            old_value,
            timestamp_ms: current_time_ms(),
        };

        // Select under the lock, invoke outside it: callbacks may re-enter
        // the registry (watch/unwatch) without deadlocking.
        let selected: Vec<(WatcherId, WatchCallback)> = {
            let mut watchers = self.watchers.lock().expect("watcher lock");
            let now = Instant::now();
            let window = self.rate_limit_window;
            let mut selected = Vec::new();

            for (&id, entry) in watchers.iter_mut() {
                if entry.disabled || !entry.matcher.matches(key) {
                    continue;
                }
                while entry
                    .recent_calls
                    .front()
                    .is_some_and(|&t| now.duration_since(t) >= window)
                {
                    entry.recent_calls.pop_front();
                }
                if entry.recent_calls.len() >= self.max_calls_per_window {
                    continue; // throttled, dropped silently
                }
                entry.recent_calls.push_back(now);
                selected.push((id, Arc::clone(&entry.callback)));
            }
            selected
        };

        for (id, callback) in selected {
            match callback(&watch_event) {
                Ok(()) => {
                    let mut watchers = self.watchers.lock().expect("watcher lock");
                    if let Some(entry) = watchers.get_mut(&id) {
                        entry.consecutive_errors = 0;
                    }
                }
                Err(e) => {
                    let mut pattern = String::new();
                    {
                        let mut watchers = self.watchers.lock().expect("watcher lock");
                        if let Some(entry) = watchers.get_mut(&id) {
                            entry.consecutive_errors += 1;
                            pattern = entry.pattern.clone();
                            if entry.consecutive_errors >= self.max_errors_before_disable {
                                entry.disabled = true;
                                tracing::warn!(
                                    watcher_id = id,
                                    pattern = %entry.pattern,
                                    errors = entry.consecutive_errors,
                                    "watcher disabled after consecutive errors"
                                );
                            }
                        }
                    }
                    let _ = self.errors.send(WatcherError {
                        watcher_id: id,
                        pattern,
                        message: e.to_string(),
                    });
                }
            }
        }

        let _ = self.events.send(watch_event);
    }
}

// =============================================================================
// Tests
// =============================================================================
