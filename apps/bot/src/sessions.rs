use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use selesta_core::config::DEFAULT_USER_NAME;
use selesta_core::{
    ApiClient, AppConfig, BookingCoordinator, BookingDraft, BookingStore, JsonFileCache,
    SlotBoard,
};
use teloxide::types::User;

/// Per-user bot state: the booking coordinator over that user's own cache
/// file, the slot board backing the inline keyboards, and the draft being
/// assembled in the chat flow.
pub struct UserSession {
    pub name: String,
    pub api: ApiClient,
    pub coordinator: BookingCoordinator<ApiClient>,
    pub board: Arc<SlotBoard>,
    pub draft: Mutex<BookingDraft>,
}

impl UserSession {
    /// Reset the chat flow back to the first step.
    pub fn reset_draft(&self) {
        let mut draft = self.draft.lock().expect("draft lock poisoned");
        *draft = BookingDraft {
            name: self.name.clone(),
            ..BookingDraft::default()
        };
    }
}

/// Lazily created sessions, keyed by Telegram user id.
pub struct Sessions {
    config: AppConfig,
    api: ApiClient,
    by_user: DashMap<i64, Arc<UserSession>>,
}

impl Sessions {
    pub fn new(config: AppConfig) -> Self {
        let api = ApiClient::new(&config);
        Self {
            config,
            api,
            by_user: DashMap::new(),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn get(&self, user: &User) -> Arc<UserSession> {
        let id = user.id.0 as i64;
        self.by_user
            .entry(id)
            .or_insert_with(|| {
                let name = display_name(user);
                let cache = JsonFileCache::new(
                    self.config.cache_dir.join(format!("user_{id}.json")),
                );
                let store = Arc::new(BookingStore::new(Arc::new(cache)));
                // The cooldown instant and cached bookings must be visible
                // right away, not only after the first reconciliation.
                if let Err(e) = store.hydrate_local() {
                    tracing::warn!(error = %e, "local cache unreadable, starting empty");
                }
                let board = Arc::new(SlotBoard::new());
                let coordinator =
                    BookingCoordinator::new(self.api.clone(), store, &self.config)
                        .with_slot_board(board.clone());
                Arc::new(UserSession {
                    draft: Mutex::new(BookingDraft {
                        name: name.clone(),
                        ..BookingDraft::default()
                    }),
                    name,
                    api: self.api.clone(),
                    coordinator,
                    board,
                })
            })
            .clone()
    }
}

/// Customer name as the backend knows it: "First Last", else "@username",
/// else the guest placeholder.
pub fn display_name(user: &User) -> String {
    let mut name = user.first_name.trim().to_string();
    if let Some(last) = user.last_name.as_deref() {
        let last = last.trim();
        if !last.is_empty() {
            if name.is_empty() {
                name = last.to_string();
            } else {
                name = format!("{name} {last}");
            }
        }
    }
    if !name.is_empty() {
        return name;
    }
    if let Some(username) = user.username.as_deref() {
        return format!("@{username}");
    }
    DEFAULT_USER_NAME.to_string()
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::UserId;

    fn user(first: &str, last: Option<&str>, username: Option<&str>) -> User {
        User {
            id: UserId(1),
            is_bot: false,
            first_name: first.into(),
            last_name: last.map(Into::into),
            username: username.map(Into::into),
            language_code: None,
            is_premium: false,
            added_to_attachment_menu: false,
        }
    }

    #[test]
    fn test_display_name_full() {
        assert_eq!(display_name(&user("Иван", Some("Петров"), None)), "Иван Петров");
    }

    #[test]
    fn test_display_name_first_only() {
        assert_eq!(display_name(&user("Иван", None, Some("ivan"))), "Иван");
    }

    #[test]
    fn test_display_name_username_fallback() {
        assert_eq!(display_name(&user("", None, Some("ivan"))), "@ivan");
        assert_eq!(display_name(&user("  ", Some(" "), Some("ivan"))), "@ivan");
    }

    #[test]
    fn test_display_name_guest_fallback() {
        assert_eq!(display_name(&user("", None, None)), DEFAULT_USER_NAME);
    }

    #[test]
    fn test_fresh_session_restores_persisted_cooldown() {
        use chrono::{Duration, TimeZone, Utc};
        use selesta_core::{Booking, BookingPolicy, BookingStore};

        let dir = std::env::temp_dir().join(format!(
            "selesta-session-cooldown-{}",
            std::process::id()
        ));
        let booked_at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        // A previous run books and persists the cooldown instant.
        {
            let cache = JsonFileCache::new(dir.join("user_1.json"));
            let store = BookingStore::new(Arc::new(cache));
            store
                .add(
                    Booking {
                        slot: "2024-01-03T11:00:00Z".into(),
                        massage_type: "classic".into(),
                        duration: 60,
                        name: "Иван".into(),
                        event_id: None,
                    },
                    booked_at,
                )
                .unwrap();
        }

        // A restart builds everything from scratch over the same cache dir.
        let config = AppConfig {
            api_base: "https://example.com/api".into(),
            webapp_url: None,
            admin_tg_id: 1,
            min_lead_hours: 4,
            horizon_days: 14,
            cooldown_secs: 15,
            booking_policy: BookingPolicy::Unlimited,
            cache_dir: dir.clone(),
        };
        let session = Sessions::new(config).get(&user("Иван", None, None));

        let remaining = session
            .coordinator
            .cooldown_remaining(booked_at + Duration::seconds(5));
        assert_eq!(remaining, 10);
        assert_eq!(session.coordinator.store().bookings().len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}
