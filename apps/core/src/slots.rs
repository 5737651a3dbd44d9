use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Timelike, Utc};

use crate::api::BookingApi;
use crate::error::ApiError;

/// Availability query for one day of one service variant. Changing any field
/// means a different slot list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotQuery {
    pub day: NaiveDate,
    pub massage_type: String,
    pub duration: i64,
}

// ── Slot board ──

/// Proof that a fetch was started for a particular board state. Handed back
/// with the result; only the ticket from the newest `begin` still lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    epoch: u64,
}

#[derive(Default)]
struct BoardState {
    epoch: u64,
    key: Option<SlotQuery>,
    in_flight: bool,
    slots: Vec<DateTime<Utc>>,
}

/// The current slot list and the bookkeeping that keeps it honest under
/// concurrent fetches.
///
/// Last key wins: switching the query bumps the epoch, which invalidates
/// every ticket issued before the switch. A repeat `begin` for the key
/// already being fetched is de-duplicated and returns no ticket.
#[derive(Default)]
pub struct SlotBoard {
    inner: Mutex<BoardState>,
}

impl SlotBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fetch for `key`. Returns `None` when a fetch for this exact
    /// key is already running. Switching keys clears the visible slot list
    /// immediately so stale slots are never shown for the new selection.
    pub fn begin(&self, key: &SlotQuery) -> Option<FetchTicket> {
        let mut state = self.lock();
        if state.in_flight && state.key.as_ref() == Some(key) {
            tracing::debug!(?key, "slot fetch already in flight, deduplicated");
            return None;
        }
        if state.key.as_ref() != Some(key) {
            state.slots.clear();
            state.key = Some(key.clone());
        }
        state.epoch += 1;
        state.in_flight = true;
        Some(FetchTicket { epoch: state.epoch })
    }

    /// Land a fetch result. Returns `false` (discarding the slots) when the
    /// ticket is no longer the newest.
    pub fn complete(&self, ticket: FetchTicket, slots: Vec<DateTime<Utc>>) -> bool {
        let mut state = self.lock();
        if ticket.epoch != state.epoch {
            tracing::debug!(ticket = ticket.epoch, current = state.epoch, "stale slot fetch dropped");
            return false;
        }
        state.slots = slots;
        state.in_flight = false;
        true
    }

    /// Mark a fetch as failed. The board keeps whatever it was showing; a
    /// stale ticket is ignored entirely.
    pub fn fail(&self, ticket: FetchTicket) {
        let mut state = self.lock();
        if ticket.epoch == state.epoch {
            state.in_flight = false;
        }
    }

    /// The key whose slots are currently shown (or being fetched).
    pub fn current_key(&self) -> Option<SlotQuery> {
        self.lock().key.clone()
    }

    /// Snapshot of the currently visible slots.
    pub fn current(&self) -> Vec<DateTime<Utc>> {
        self.lock().slots.clone()
    }

    pub fn is_fetching(&self) -> bool {
        self.lock().in_flight
    }

    /// Fetch slots for `key` and land them on the board. Returns `Ok(true)`
    /// when the result became visible, `Ok(false)` when it was deduplicated
    /// or superseded by a newer query.
    pub async fn refresh<A>(&self, api: &A, key: SlotQuery) -> Result<bool, ApiError>
    where
        A: BookingApi + ?Sized,
    {
        let Some(ticket) = self.begin(&key) else {
            return Ok(false);
        };
        match api.fetch_slots(&key).await {
            Ok(raw) => Ok(self.complete(ticket, parse_slots(raw))),
            Err(e) => {
                self.fail(ticket);
                Err(e)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoardState> {
        self.inner.lock().expect("slot board lock poisoned")
    }
}

/// Parse raw wire timestamps, dropping malformed entries.
pub fn parse_slots(raw: Vec<String>) -> Vec<DateTime<Utc>> {
    raw.into_iter()
        .filter_map(|s| match DateTime::parse_from_rfc3339(&s) {
            Ok(t) => Some(t.with_timezone(&Utc)),
            Err(e) => {
                tracing::warn!(slot = %s, error = %e, "dropping malformed slot timestamp");
                None
            }
        })
        .collect()
}

// ── Day-part grouping ──

/// Slots of one day split by time of day.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GroupedSlots {
    /// Before 12:00.
    pub morning: Vec<DateTime<Utc>>,
    /// 12:00 to 16:59.
    pub afternoon: Vec<DateTime<Utc>>,
    /// 17:00 onwards.
    pub evening: Vec<DateTime<Utc>>,
}

/// Group slots into morning/afternoon/evening.
///
/// The backend emits timestamps whose clock value is the salon's wall time,
/// so the hour is read off the timestamp as-is; nothing here converts
/// timezones. Display code follows the same rule.
pub fn group_by_period(slots: &[DateTime<Utc>]) -> GroupedSlots {
    let mut grouped = GroupedSlots::default();
    for &slot in slots {
        let hour = slot.hour();
        if hour < 12 {
            grouped.morning.push(slot);
        } else if hour < 17 {
            grouped.afternoon.push(slot);
        } else {
            grouped.evening.push(slot);
        }
    }
    grouped
}

// ── Tests ──
