use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::models::Booking;

/// Current layout of the persisted cache. Bump when the shape changes; an
/// unknown version is discarded and repopulated from the server.
pub const CACHE_SCHEMA_VERSION: u32 = 2;

// ── Persisted state ──

/// Everything the client persists locally between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedState {
    pub schema_version: u32,
    #[serde(default)]
    pub bookings: Vec<Booking>,
    /// Instant of the last successful booking, for the cooldown guard.
    #[serde(default)]
    pub last_booking_at: Option<DateTime<Utc>>,
    /// Cached display name, restored when Telegram gives us no user.
    #[serde(default)]
    pub user_name: Option<String>,
}

// ── Cache repository ──

/// Persistence seam for the local cache. File-backed in production,
/// in-memory for tests; the storage mechanism is swappable without touching
/// the store.
pub trait BookingCache: Send + Sync {
    fn load(&self) -> Result<Option<CachedState>, CacheError>;
    fn save(&self, state: &CachedState) -> Result<(), CacheError>;
}

/// JSON file cache, one file per user.
pub struct JsonFileCache {
    path: PathBuf,
}

impl JsonFileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BookingCache for JsonFileCache {
    fn load(&self) -> Result<Option<CachedState>, CacheError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(decode_cache(&raw))
    }

    fn save(&self, state: &CachedState) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

/// In-memory cache for tests and hosts without a writable disk.
#[derive(Default)]
pub struct MemoryCache {
    state: Mutex<Option<CachedState>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BookingCache for MemoryCache {
    fn load(&self) -> Result<Option<CachedState>, CacheError> {
        Ok(self.state.lock().expect("cache lock poisoned").clone())
    }

    fn save(&self, state: &CachedState) -> Result<(), CacheError> {
        *self.state.lock().expect("cache lock poisoned") = Some(state.clone());
        Ok(())
    }
}

/// Decode a raw cache blob, tolerating older formats.
///
/// The very first release stored a bare JSON array of slot strings; those
/// are migrated into minimal bookings. Anything else that is not the current
/// schema is dropped — the next reconciliation repopulates it.
fn decode_cache(raw: &str) -> Option<CachedState> {
    if let Ok(state) = serde_json::from_str::<CachedState>(raw) {
        if state.schema_version == CACHE_SCHEMA_VERSION {
            return Some(state);
        }
        tracing::warn!(
            version = state.schema_version,
            "discarding cache with unknown schema version"
        );
        return None;
    }

    if let Ok(slots) = serde_json::from_str::<Vec<String>>(raw) {
        tracing::info!(entries = slots.len(), "migrating legacy slot-list cache");
        return Some(CachedState {
            schema_version: CACHE_SCHEMA_VERSION,
            bookings: slots
                .into_iter()
                .map(|slot| Booking {
                    slot,
                    massage_type: "classic".into(),
                    duration: 60,
                    name: String::new(),
                    event_id: None,
                })
                .collect(),
            last_booking_at: None,
            user_name: None,
        });
    }

    tracing::warn!("discarding unreadable cache");
    None
}

// ── Booking store ──

struct StoreInner {
    state: CachedState,
    /// Monotonic write counter. Every mutation bumps it; a server
    /// reconciliation may only land if no newer write happened since it
    /// began. This is what keeps a slow, older fetch from clobbering either
    /// a fresher fetch or an optimistic add.
    revision: u64,
}

/// Canonical holder of the current user's bookings.
///
/// The in-memory set is mirrored to a [`BookingCache`]; this store is the
/// cache's only writer. Server data is authoritative: reconciliation
/// replaces the whole set, it never merges.
pub struct BookingStore {
    cache: Arc<dyn BookingCache>,
    inner: Mutex<StoreInner>,
}

impl BookingStore {
    pub fn new(cache: Arc<dyn BookingCache>) -> Self {
        Self {
            cache,
            inner: Mutex::new(StoreInner {
                state: CachedState {
                    schema_version: CACHE_SCHEMA_VERSION,
                    ..CachedState::default()
                },
                revision: 0,
            }),
        }
    }

    /// Load whatever the local cache has, for immediate display before the
    /// server is consulted.
    pub fn hydrate_local(&self) -> Result<(), CacheError> {
        let loaded = self.cache.load()?;
        let mut inner = self.lock();
        if let Some(state) = loaded {
            inner.state = state;
            inner.revision += 1;
        }
        Ok(())
    }

    /// Begin a server reconciliation. The returned ticket must be handed
    /// back to [`apply_server`](Self::apply_server) together with the fetch
    /// result.
    pub fn begin_reconcile(&self) -> u64 {
        self.lock().revision
    }

    /// Replace the booking set with the server's — even when the server set
    /// is empty. Returns `false` (and changes nothing) when any write
    /// happened after the ticket was issued; only the newest data may land.
    pub fn apply_server(
        &self,
        ticket: u64,
        bookings: Vec<Booking>,
    ) -> Result<bool, CacheError> {
        let mut inner = self.lock();
        if ticket != inner.revision {
            tracing::debug!(ticket, current = inner.revision, "stale reconciliation dropped");
            return Ok(false);
        }
        inner.state.bookings = bookings;
        inner.revision += 1;
        self.persist(&inner)?;
        Ok(true)
    }

    /// Optimistically record a just-confirmed booking and arm the cooldown.
    pub fn add(&self, booking: Booking, booked_at: DateTime<Utc>) -> Result<(), CacheError> {
        let mut inner = self.lock();
        if !booking.name.is_empty() {
            inner.state.user_name = Some(booking.name.clone());
        }
        inner.state.bookings.push(booking);
        inner.state.last_booking_at = Some(booked_at);
        inner.revision += 1;
        self.persist(&inner)
    }

    /// Remove matching bookings. Returns how many were dropped.
    pub fn remove<F>(&self, predicate: F) -> Result<usize, CacheError>
    where
        F: Fn(&Booking) -> bool,
    {
        let mut inner = self.lock();
        let before = inner.state.bookings.len();
        inner.state.bookings.retain(|b| !predicate(b));
        let removed = before - inner.state.bookings.len();
        if removed > 0 {
            inner.revision += 1;
            self.persist(&inner)?;
        }
        Ok(removed)
    }

    /// Snapshot of all cached bookings, past ones included.
    pub fn bookings(&self) -> Vec<Booking> {
        self.lock().state.bookings.clone()
    }

    /// Bookings starting strictly after `now`. This is the only way "has an
    /// active booking" is determined; entries with unparseable slots are
    /// silently excluded.
    pub fn future_bookings(&self, now: DateTime<Utc>) -> Vec<Booking> {
        self.lock()
            .state
            .bookings
            .iter()
            .filter(|b| b.is_future(now))
            .cloned()
            .collect()
    }

    /// Instant of the last successful booking, for the cooldown guard.
    pub fn last_booking_at(&self) -> Option<DateTime<Utc>> {
        self.lock().state.last_booking_at
    }

    /// Cached display name, if any.
    pub fn user_name(&self) -> Option<String> {
        self.lock().state.user_name.clone()
    }

    /// Remember the display name across runs.
    pub fn set_user_name(&self, name: &str) -> Result<(), CacheError> {
        let mut inner = self.lock();
        if inner.state.user_name.as_deref() == Some(name) {
            return Ok(());
        }
        inner.state.user_name = Some(name.to_string());
        self.persist(&inner)
    }

    fn persist(&self, inner: &StoreInner) -> Result<(), CacheError> {
        self.cache.save(&inner.state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("store lock poisoned")
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn booking(slot: &str, name: &str) -> Booking {
        Booking {
            slot: slot.into(),
            massage_type: "classic".into(),
            duration: 60,
            name: name.into(),
            event_id: None,
        }
    }

    fn store() -> BookingStore {
        BookingStore::new(Arc::new(MemoryCache::new()))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_reconciliation_replaces_not_merges() {
        let store = store();
        store.add(booking("2024-01-02T10:00:00Z", "Ivan"), now()).unwrap();
        store.add(booking("2024-01-03T10:00:00Z", "Ivan"), now()).unwrap();

        let ticket = store.begin_reconcile();
        let applied = store
            .apply_server(ticket, vec![booking("2024-01-04T10:00:00Z", "Ivan")])
            .unwrap();

        assert!(applied);
        let bookings = store.bookings();
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].slot, "2024-01-04T10:00:00Z");
    }

    #[test]
    fn test_empty_server_set_clears_local_cache() {
        let cache = Arc::new(MemoryCache::new());
        let store = BookingStore::new(cache.clone());
        store.add(booking("2024-01-02T10:00:00Z", "Ivan"), now()).unwrap();

        let ticket = store.begin_reconcile();
        assert!(store.apply_server(ticket, vec![]).unwrap());
        assert!(store.bookings().is_empty());

        // The persisted cache is cleared too, not just memory.
        let persisted = cache.load().unwrap().unwrap();
        assert!(persisted.bookings.is_empty());
    }

    #[test]
    fn test_stale_reconciliation_is_dropped() {
        let store = store();
        let old_ticket = store.begin_reconcile();

        // A newer reconciliation lands first.
        let new_ticket = store.begin_reconcile();
        assert!(store
            .apply_server(new_ticket, vec![booking("2024-01-05T10:00:00Z", "Ivan")])
            .unwrap());

        // The older fetch resolves late; it must not overwrite.
        let applied = store
            .apply_server(old_ticket, vec![booking("2024-01-02T10:00:00Z", "Ivan")])
            .unwrap();
        assert!(!applied);
        assert_eq!(store.bookings()[0].slot, "2024-01-05T10:00:00Z");
    }

    #[test]
    fn test_optimistic_add_survives_older_fetch() {
        let store = store();
        let ticket = store.begin_reconcile();

        // User books while the fetch is still in flight.
        store.add(booking("2024-01-06T10:00:00Z", "Ivan"), now()).unwrap();

        // The pre-add fetch resolves with an empty set; it is stale now.
        assert!(!store.apply_server(ticket, vec![]).unwrap());
        assert_eq!(store.bookings().len(), 1);
    }

    #[test]
    fn test_future_filter_excludes_past_and_unparseable() {
        let store = store();
        store.add(booking("2023-12-31T10:00:00Z", "Ivan"), now()).unwrap();
        store.add(booking("2024-01-02T10:00:00Z", "Ivan"), now()).unwrap();
        store.add(booking("not-a-timestamp", "Ivan"), now()).unwrap();

        let future = store.future_bookings(now());
        assert_eq!(future.len(), 1);
        assert_eq!(future[0].slot, "2024-01-02T10:00:00Z");
    }

    #[test]
    fn test_remove_persists() {
        let cache = Arc::new(MemoryCache::new());
        let store = BookingStore::new(cache.clone());
        store.add(booking("2024-01-02T10:00:00Z", "Ivan"), now()).unwrap();
        store.add(booking("2024-01-03T10:00:00Z", "Ivan"), now()).unwrap();

        let removed = store
            .remove(|b| b.slot == "2024-01-02T10:00:00Z")
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.load().unwrap().unwrap().bookings.len(), 1);
    }

    #[test]
    fn test_hydrate_local_restores_cooldown_and_name() {
        let cache = Arc::new(MemoryCache::new());
        {
            let store = BookingStore::new(cache.clone());
            store.add(booking("2024-01-02T10:00:00Z", "Ivan"), now()).unwrap();
        }

        // Simulated reload: a fresh store over the same cache.
        let store = BookingStore::new(cache);
        store.hydrate_local().unwrap();
        assert_eq!(store.last_booking_at(), Some(now()));
        assert_eq!(store.user_name().as_deref(), Some("Ivan"));
        assert_eq!(store.bookings().len(), 1);
    }

    #[test]
    fn test_legacy_slot_list_cache_is_migrated() {
        let state = decode_cache(r#"["2024-01-02T10:00:00Z","2024-01-03T10:00:00Z"]"#).unwrap();
        assert_eq!(state.schema_version, CACHE_SCHEMA_VERSION);
        assert_eq!(state.bookings.len(), 2);
        assert_eq!(state.bookings[0].massage_type, "classic");
    }

    #[test]
    fn test_unknown_schema_version_is_discarded() {
        assert!(decode_cache(r#"{"schema_version":99,"bookings":[]}"#).is_none());
        assert!(decode_cache("definitely not json").is_none());
    }
}
