use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ── Service catalog ──

/// One bookable duration of a massage type, with its price in rubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationOption {
    pub minutes: i64,
    pub price: i64,
}

/// A category of massage. Every type has at least one duration option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MassageType {
    pub id: String,
    pub name: String,
    pub description: String,
    pub durations: Vec<DurationOption>,
}

impl MassageType {
    /// Look up a duration option by its length in minutes.
    pub fn duration(&self, minutes: i64) -> Option<DurationOption> {
        self.durations.iter().copied().find(|d| d.minutes == minutes)
    }
}

fn massage_type(
    id: &str,
    name: &str,
    description: &str,
    durations: &[(i64, i64)],
) -> MassageType {
    MassageType {
        id: id.into(),
        name: name.into(),
        description: description.into(),
        durations: durations
            .iter()
            .map(|&(minutes, price)| DurationOption { minutes, price })
            .collect(),
    }
}

/// The fixed service catalog. One practitioner, a handful of services.
pub fn catalog() -> Vec<MassageType> {
    vec![
        massage_type(
            "classic",
            "Классический массаж",
            "Расслабляющий классический массаж",
            &[(60, 2500), (90, 3500)],
        ),
        massage_type(
            "therapeutic",
            "Лечебный массаж",
            "Глубокий терапевтический массаж",
            &[(80, 3500)],
        ),
        massage_type(
            "fullbody",
            "Массаж всего тела",
            "Полный комплексный массаж",
            &[(90, 4000)],
        ),
        massage_type(
            "express",
            "Экспресс массаж",
            "Быстрый точечный массаж",
            &[(40, 1800)],
        ),
    ]
}

/// Find a catalog entry by id.
pub fn find_type<'a>(types: &'a [MassageType], id: &str) -> Option<&'a MassageType> {
    types.iter().find(|t| t.id == id)
}

// ── Bookings ──

fn default_massage_type() -> String {
    "classic".into()
}

fn default_duration() -> i64 {
    60
}

/// A booking as cached locally and as returned by the backend.
///
/// The slot is kept as the raw wire timestamp; older backend records are not
/// guaranteed to parse, and an unparseable slot must degrade to "not future"
/// rather than fail (see [`Booking::is_future`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    /// ISO-8601 start instant.
    pub slot: String,
    #[serde(default = "default_massage_type")]
    pub massage_type: String,
    /// Minutes.
    #[serde(default = "default_duration")]
    pub duration: i64,
    #[serde(default)]
    pub name: String,
    /// Opaque backend id, assigned on confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl Booking {
    /// Parsed start instant, if the raw slot is well-formed.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.slot)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// End instant, derived from start + duration.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.start_time().map(|t| t + Duration::minutes(self.duration))
    }

    /// Whether this booking starts strictly after `now`. Unparseable slots
    /// count as not future.
    pub fn is_future(&self, now: DateTime<Utc>) -> bool {
        self.start_time().is_some_and(|t| t > now)
    }
}

// ── Wire types ──

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRequest {
    pub name: String,
    pub slot: String,
    pub massage_type: String,
    pub duration: i64,
}

/// Raw `/book` response body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A successful `/book` acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookAck {
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub name: String,
    pub slot: String,
    pub massage_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Error payload the backend attaches to non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// ── Tests ──
