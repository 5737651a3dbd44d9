//! Client core for the Selesta massage-booking Mini App.
//!
//! Everything that is not presentation lives here: the date window, the slot
//! availability client, the locally cached booking state, the cooldown guard
//! and the coordinator that talks to the booking backend. The backend itself
//! (slots/book/cancel/records REST API) is external.

pub mod api;
pub mod config;
pub mod cooldown;
pub mod coordinator;
pub mod error;
pub mod models;
pub mod slots;
pub mod store;
pub mod window;

pub use api::{ApiClient, BookingApi};
pub use config::{AppConfig, BookingPolicy};
pub use cooldown::CooldownGuard;
pub use coordinator::{AttemptPhase, BookingCoordinator, BookingDraft};
pub use error::{ApiError, CacheError, SubmitError};
pub use models::{Booking, DurationOption, MassageType};
pub use slots::{SlotBoard, SlotQuery};
pub use store::{BookingCache, BookingStore, JsonFileCache, MemoryCache};
