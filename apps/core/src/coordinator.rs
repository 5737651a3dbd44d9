use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};

use crate::api::BookingApi;
use crate::config::{AppConfig, BookingPolicy};
use crate::cooldown::CooldownGuard;
use crate::error::SubmitError;
use crate::models::{self, BookRequest, Booking, CancelRequest, MassageType};
use crate::slots::SlotBoard;
use crate::store::BookingStore;

// ── Draft ──

/// The user's booking selection as it is assembled step by step. Fields stay
/// optional until submission, where a hole becomes a validation error.
#[derive(Debug, Clone, Default)]
pub struct BookingDraft {
    pub massage_type: Option<String>,
    pub duration: Option<i64>,
    pub slot: Option<DateTime<Utc>>,
    pub name: String,
}

/// Whether a booking mutation is currently on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Idle,
    Submitting,
}

/// A confirmed booking plus the user-facing confirmation text.
#[derive(Debug, Clone)]
pub struct BookingOutcome {
    pub booking: Booking,
    pub message: String,
}

/// A confirmed cancellation plus the day whose slots just changed.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub message: String,
    pub day: Option<NaiveDate>,
}

// ── Coordinator ──

/// Orchestrates the booking lifecycle: validates the draft, applies the
/// cooldown and booking-policy gates, talks to the backend, and keeps the
/// local store and slot board consistent with the outcome.
///
/// At most one mutation (booking or cancellation) is on the wire at a time;
/// a second attempt while one is running fails fast with [`SubmitError::Busy`]
/// instead of queueing.
pub struct BookingCoordinator<A: BookingApi> {
    api: A,
    store: Arc<BookingStore>,
    guard: CooldownGuard,
    policy: BookingPolicy,
    catalog: Vec<MassageType>,
    slot_board: Option<Arc<SlotBoard>>,
    in_flight: AtomicBool,
}

impl<A: BookingApi> BookingCoordinator<A> {
    pub fn new(api: A, store: Arc<BookingStore>, config: &AppConfig) -> Self {
        Self {
            api,
            store,
            guard: CooldownGuard::new(config.cooldown_secs),
            policy: config.booking_policy,
            catalog: models::catalog(),
            slot_board: None,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Attach a slot board so confirmed mutations refresh the visible slots.
    pub fn with_slot_board(mut self, board: Arc<SlotBoard>) -> Self {
        self.slot_board = Some(board);
        self
    }

    pub fn store(&self) -> &Arc<BookingStore> {
        &self.store
    }

    pub fn catalog(&self) -> &[MassageType] {
        &self.catalog
    }

    pub fn phase(&self) -> AttemptPhase {
        if self.in_flight.load(Ordering::Acquire) {
            AttemptPhase::Submitting
        } else {
            AttemptPhase::Idle
        }
    }

    /// Seconds left on the cooldown at `now`, 0 when submission is allowed.
    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> i64 {
        self.guard.remaining_secs(self.store.last_booking_at(), now)
    }

    /// Load the local cache for immediate display, then reconcile with the
    /// backend's booking list for `name`. Returns whether the server data
    /// landed (a concurrent local write makes it stale).
    pub async fn hydrate(&self, name: &str) -> Result<bool, SubmitError> {
        if let Err(e) = self.store.hydrate_local() {
            tracing::warn!(error = %e, "local cache unreadable, starting empty");
        }
        if let Err(e) = self.store.set_user_name(name) {
            tracing::warn!(error = %e, "failed to persist user name");
        }
        let ticket = self.store.begin_reconcile();
        let bookings = self.api.fetch_user_bookings(name).await.map_err(SubmitError::Api)?;
        match self.store.apply_server(ticket, bookings) {
            Ok(applied) => Ok(applied),
            // In-memory state is updated even when the disk write fails.
            Err(e) => {
                tracing::warn!(error = %e, "reconciled bookings not persisted");
                Ok(true)
            }
        }
    }

    /// Submit a booking attempt. Gates fire in a fixed order: draft
    /// validation, cooldown, booking policy, single-mutation permit, and
    /// only then the network call.
    pub async fn submit(
        &self,
        draft: &BookingDraft,
        now: DateTime<Utc>,
    ) -> Result<BookingOutcome, SubmitError> {
        let (massage_type, duration, slot) = self.validate(draft)?;

        let remaining = self.guard.remaining_secs(self.store.last_booking_at(), now);
        if remaining > 0 {
            return Err(SubmitError::CooldownActive {
                remaining_secs: remaining,
            });
        }

        self.check_policy(slot, now)?;

        let _permit = self.acquire_permit()?;

        let request = BookRequest {
            name: draft.name.clone(),
            slot: slot.to_rfc3339_opts(SecondsFormat::Secs, true),
            massage_type: massage_type.id.clone(),
            duration: duration.minutes,
        };
        let ack = self.api.book(&request).await.map_err(SubmitError::Api)?;

        let booking = Booking {
            slot: request.slot,
            massage_type: request.massage_type,
            duration: request.duration,
            name: request.name,
            event_id: ack.event_id,
        };
        if let Err(e) = self.store.add(booking.clone(), now) {
            tracing::warn!(error = %e, "booking confirmed but cache write failed");
        }

        if let Some(board) = &self.slot_board {
            self.refresh_board(board, slot.date_naive()).await;
        }

        let range = time_range(&booking);
        let message = format!("Вы записаны на {} в {}!", massage_type.name, range);
        Ok(BookingOutcome { booking, message })
    }

    /// Cancel an existing booking and drop it from the local cache.
    pub async fn cancel(&self, booking: &Booking) -> Result<CancelOutcome, SubmitError> {
        let _permit = self.acquire_permit()?;

        let request = CancelRequest {
            name: booking.name.clone(),
            slot: booking.slot.clone(),
            massage_type: booking.massage_type.clone(),
            event_id: booking.event_id.clone(),
        };
        self.api.cancel(&request).await.map_err(SubmitError::Api)?;

        let slot = booking.slot.clone();
        let event_id = booking.event_id.clone();
        match self
            .store
            .remove(|b| b.slot == slot && b.event_id == event_id)
        {
            Ok(0) => tracing::warn!(%slot, "cancelled booking was not in the local cache"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "cancellation confirmed but cache write failed"),
        }

        let day = booking.start_time().map(|t| t.date_naive());
        if let (Some(board), Some(day)) = (&self.slot_board, day) {
            self.refresh_board(board, day).await;
        }

        let message = format!("Запись на {} успешно отменена!", time_range(booking));
        Ok(CancelOutcome { message, day })
    }

    // ── Gates ──

    fn validate(
        &self,
        draft: &BookingDraft,
    ) -> Result<(&MassageType, crate::models::DurationOption, DateTime<Utc>), SubmitError> {
        let type_id = draft.massage_type.as_deref().ok_or(SubmitError::MissingType)?;
        let minutes = draft.duration.ok_or(SubmitError::MissingDuration)?;
        let slot = draft.slot.ok_or(SubmitError::MissingSlot)?;

        let massage_type = models::find_type(&self.catalog, type_id)
            .ok_or_else(|| SubmitError::UnknownType(type_id.to_string()))?;
        let duration = massage_type
            .duration(minutes)
            .ok_or_else(|| SubmitError::UnknownDuration {
                massage_type: type_id.to_string(),
                minutes,
            })?;
        Ok((massage_type, duration, slot))
    }

    fn check_policy(&self, slot: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), SubmitError> {
        let future = self.store.future_bookings(now);
        match self.policy {
            BookingPolicy::Unlimited => Ok(()),
            BookingPolicy::OneActive => {
                if future.is_empty() {
                    Ok(())
                } else {
                    Err(SubmitError::LimitReached(
                        "У вас уже есть активная запись.".into(),
                    ))
                }
            }
            BookingPolicy::OnePerDay => {
                let day = slot.date_naive();
                let clash = future
                    .iter()
                    .any(|b| b.start_time().is_some_and(|t| t.date_naive() == day));
                if clash {
                    Err(SubmitError::LimitReached(
                        "У вас уже есть запись на этот день.".into(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn acquire_permit(&self) -> Result<FlightPermit<'_>, SubmitError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| SubmitError::Busy)?;
        Ok(FlightPermit(&self.in_flight))
    }

    async fn refresh_board(&self, board: &SlotBoard, day: NaiveDate) {
        let Some(key) = board.current_key() else {
            return;
        };
        if key.day != day {
            return;
        }
        if let Err(e) = board.refresh(&self.api, key).await {
            tracing::warn!(error = %e, "slot refresh after mutation failed");
        }
    }
}

/// Releases the single-mutation permit on drop, including on error paths.
struct FlightPermit<'a>(&'a AtomicBool);

impl Drop for FlightPermit<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// `HH:MM-HH:MM` range of a booking, shown in the timestamp's own offset
/// (the backend emits salon-presentable timestamps). Unparseable slots fall
/// back to the raw string.
fn time_range(booking: &Booking) -> String {
    match DateTime::parse_from_rfc3339(&booking.slot) {
        Ok(start) => {
            let end = start + Duration::minutes(booking.duration);
            format!("{}-{}", start.format("%H:%M"), end.format("%H:%M"))
        }
        Err(_) => booking.slot.clone(),
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::models::BookAck;
    use crate::store::MemoryCache;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MockApi {
        book_calls: AtomicUsize,
        cancel_calls: AtomicUsize,
        reject_book_with: Mutex<Option<String>>,
        server_bookings: Mutex<Vec<Booking>>,
        server_slots: Mutex<Vec<String>>,
        // When set, `book` parks until the release side is notified, so
        // tests can observe the coordinator mid-flight.
        gate: Option<Gate>,
    }

    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl BookingApi for MockApi {
        async fn fetch_slots(&self, _query: &crate::slots::SlotQuery) -> Result<Vec<String>, ApiError> {
            Ok(self.server_slots.lock().unwrap().clone())
        }

        async fn fetch_user_bookings(&self, _name: &str) -> Result<Vec<Booking>, ApiError> {
            Ok(self.server_bookings.lock().unwrap().clone())
        }

        async fn fetch_records(&self) -> Result<Vec<Booking>, ApiError> {
            Ok(self.server_bookings.lock().unwrap().clone())
        }

        async fn book(&self, _request: &BookRequest) -> Result<BookAck, ApiError> {
            self.book_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            if let Some(reason) = self.reject_book_with.lock().unwrap().clone() {
                return Err(ApiError::Rejected(reason));
            }
            Ok(BookAck {
                event_id: Some("ev1".into()),
            })
        }

        async fn cancel(&self, _request: &CancelRequest) -> Result<(), ApiError> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(policy: BookingPolicy) -> AppConfig {
        AppConfig {
            api_base: "https://example.com/api".into(),
            webapp_url: None,
            admin_tg_id: 1,
            min_lead_hours: 4,
            horizon_days: 14,
            cooldown_secs: 15,
            booking_policy: policy,
            cache_dir: "cache".into(),
        }
    }

    fn coordinator(
        api: Arc<MockApi>,
        policy: BookingPolicy,
    ) -> BookingCoordinator<Arc<MockApi>> {
        let store = Arc::new(BookingStore::new(Arc::new(MemoryCache::new())));
        BookingCoordinator::new(api, store, &config(policy))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn draft(slot_hour: u32) -> BookingDraft {
        BookingDraft {
            massage_type: Some("classic".into()),
            duration: Some(60),
            slot: Some(Utc.with_ymd_and_hms(2024, 1, 3, slot_hour, 0, 0).unwrap()),
            name: "Иван".into(),
        }
    }

    #[tokio::test]
    async fn test_successful_booking() {
        let api = Arc::new(MockApi::default());
        let coord = coordinator(api.clone(), BookingPolicy::Unlimited);

        let outcome = coord.submit(&draft(11), now()).await.unwrap();

        assert_eq!(outcome.message, "Вы записаны на Классический массаж в 11:00-12:00!");
        assert_eq!(outcome.booking.event_id.as_deref(), Some("ev1"));
        assert_eq!(coord.store().bookings().len(), 1);
        assert_eq!(coord.store().last_booking_at(), Some(now()));
        assert_eq!(api.book_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_incomplete_draft_never_reaches_network() {
        let api = Arc::new(MockApi::default());
        let coord = coordinator(api.clone(), BookingPolicy::Unlimited);

        let mut d = draft(11);
        d.slot = None;
        assert!(matches!(
            coord.submit(&d, now()).await,
            Err(SubmitError::MissingSlot)
        ));

        let mut d = draft(11);
        d.massage_type = None;
        assert!(matches!(
            coord.submit(&d, now()).await,
            Err(SubmitError::MissingType)
        ));

        let mut d = draft(11);
        d.duration = None;
        assert!(matches!(
            coord.submit(&d, now()).await,
            Err(SubmitError::MissingDuration)
        ));

        assert_eq!(api.book_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_type_and_duration_are_rejected_locally() {
        let api = Arc::new(MockApi::default());
        let coord = coordinator(api.clone(), BookingPolicy::Unlimited);

        let mut d = draft(11);
        d.massage_type = Some("hot-stone".into());
        assert!(matches!(
            coord.submit(&d, now()).await,
            Err(SubmitError::UnknownType(id)) if id == "hot-stone"
        ));

        let mut d = draft(11);
        d.duration = Some(45);
        assert!(matches!(
            coord.submit(&d, now()).await,
            Err(SubmitError::UnknownDuration { minutes: 45, .. })
        ));

        assert_eq!(api.book_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_second_submission() {
        let api = Arc::new(MockApi::default());
        let coord = coordinator(api.clone(), BookingPolicy::Unlimited);

        coord.submit(&draft(11), now()).await.unwrap();

        let later = now() + Duration::seconds(10);
        let err = coord.submit(&draft(14), later).await.unwrap_err();
        assert!(matches!(err, SubmitError::CooldownActive { remaining_secs: 5 }));
        assert_eq!(api.book_calls.load(Ordering::SeqCst), 1);

        // Past the window the next attempt goes through.
        coord
            .submit(&draft(14), now() + Duration::seconds(16))
            .await
            .unwrap();
        assert_eq!(api.book_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejection_leaves_store_untouched() {
        let api = Arc::new(MockApi::default());
        *api.reject_book_with.lock().unwrap() = Some("Слот уже занят".into());
        let coord = coordinator(api.clone(), BookingPolicy::Unlimited);

        let err = coord.submit(&draft(11), now()).await.unwrap_err();
        assert_eq!(err.to_string(), "Слот уже занят");
        assert!(coord.store().bookings().is_empty());
        // A failed attempt must not arm the cooldown.
        assert_eq!(coord.store().last_booking_at(), None);
        assert_eq!(coord.phase(), AttemptPhase::Idle);
    }

    #[tokio::test]
    async fn test_one_active_policy() {
        let api = Arc::new(MockApi::default());
        let coord = coordinator(api.clone(), BookingPolicy::OneActive);

        coord.submit(&draft(11), now()).await.unwrap();

        let later = now() + Duration::seconds(60);
        let err = coord.submit(&draft(15), later).await.unwrap_err();
        assert!(matches!(err, SubmitError::LimitReached(_)));
        assert_eq!(api.book_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_one_per_day_policy_allows_other_days() {
        let api = Arc::new(MockApi::default());
        let coord = coordinator(api.clone(), BookingPolicy::OnePerDay);

        coord.submit(&draft(11), now()).await.unwrap();
        let later = now() + Duration::seconds(60);

        // Same day is blocked.
        let err = coord.submit(&draft(15), later).await.unwrap_err();
        assert!(matches!(err, SubmitError::LimitReached(_)));

        // A different day is fine.
        let mut other_day = draft(11);
        other_day.slot = Some(Utc.with_ymd_and_hms(2024, 1, 5, 11, 0, 0).unwrap());
        coord.submit(&other_day, later).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_mutation_in_flight() {
        let api = Arc::new(MockApi {
            gate: Some(Gate::default()),
            ..MockApi::default()
        });
        let coord = Arc::new(coordinator(api.clone(), BookingPolicy::Unlimited));

        let submitting = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.submit(&draft(11), now()).await })
        };
        api.gate.as_ref().unwrap().entered.notified().await;
        assert_eq!(coord.phase(), AttemptPhase::Submitting);

        // A cancellation while the booking is on the wire fails fast and
        // never reaches the backend.
        let booking = Booking {
            slot: "2024-01-09T11:00:00Z".into(),
            massage_type: "classic".into(),
            duration: 60,
            name: "Иван".into(),
            event_id: None,
        };
        let err = coord.cancel(&booking).await.unwrap_err();
        assert!(matches!(err, SubmitError::Busy));
        assert_eq!(api.cancel_calls.load(Ordering::SeqCst), 0);

        api.gate.as_ref().unwrap().release.notify_one();
        submitting.await.unwrap().unwrap();
        assert_eq!(coord.phase(), AttemptPhase::Idle);
    }

    #[tokio::test]
    async fn test_cancel_removes_from_store() {
        let api = Arc::new(MockApi::default());
        let coord = coordinator(api.clone(), BookingPolicy::Unlimited);

        let outcome = coord.submit(&draft(11), now()).await.unwrap();
        let cancelled = coord.cancel(&outcome.booking).await.unwrap();

        assert_eq!(cancelled.message, "Запись на 11:00-12:00 успешно отменена!");
        assert_eq!(cancelled.day, NaiveDate::from_ymd_opt(2024, 1, 3));
        assert!(coord.store().bookings().is_empty());
        assert_eq!(api.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hydrate_replaces_local_with_server_truth() {
        let api = Arc::new(MockApi::default());
        *api.server_bookings.lock().unwrap() = vec![Booking {
            slot: "2024-01-07T09:00:00Z".into(),
            massage_type: "express".into(),
            duration: 40,
            name: "Иван".into(),
            event_id: Some("srv1".into()),
        }];
        let coord = coordinator(api.clone(), BookingPolicy::Unlimited);
        coord
            .store()
            .add(outcome_booking("2024-01-02T10:00:00Z"), now())
            .unwrap();

        assert!(coord.hydrate("Иван").await.unwrap());
        let bookings = coord.store().bookings();
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].event_id.as_deref(), Some("srv1"));
        assert_eq!(coord.store().user_name().as_deref(), Some("Иван"));
    }

    fn outcome_booking(slot: &str) -> Booking {
        Booking {
            slot: slot.into(),
            massage_type: "classic".into(),
            duration: 60,
            name: "Иван".into(),
            event_id: None,
        }
    }
}
