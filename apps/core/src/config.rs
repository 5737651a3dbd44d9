use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use chrono::FixedOffset;

// ── Defaults ──

/// Salon timezone offset (UTC+3, Moscow).
pub const MSK_OFFSET_SECS: i32 = 3 * 3600;
/// Minimum lead time before the earliest bookable slot (hours).
pub const DEFAULT_MIN_LEAD_HOURS: i64 = 4;
/// Booking horizon (days, today included).
pub const DEFAULT_HORIZON_DAYS: u32 = 14;
/// Cooldown between successive booking submissions (seconds).
pub const DEFAULT_COOLDOWN_SECS: i64 = 15;
/// Display name used when Telegram gives us nothing.
pub const DEFAULT_USER_NAME: &str = "Гость";

// ── Booking policy ──

/// How many active bookings one customer may hold.
///
/// The product has never settled on a single rule, so it is a config knob
/// rather than a hardcoded check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BookingPolicy {
    /// Any number of future bookings.
    #[default]
    Unlimited,
    /// At most one booking per calendar day.
    OnePerDay,
    /// At most one future booking total.
    OneActive,
}

impl FromStr for BookingPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unlimited" => Ok(Self::Unlimited),
            "one_per_day" => Ok(Self::OnePerDay),
            "one_active" => Ok(Self::OneActive),
            other => anyhow::bail!("unknown BOOKING_POLICY: {other}"),
        }
    }
}

// ── Application config ──

/// Runtime configuration, assembled once at startup and passed down
/// explicitly. Nothing in the core reads the environment on its own.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Base URL of the booking backend, e.g. `https://app.selesta-test.ru/api`.
    pub api_base: String,
    /// URL of the Mini App, shown as a web-app button when set.
    pub webapp_url: Option<String>,
    /// Telegram id of the salon operator.
    pub admin_tg_id: i64,
    pub min_lead_hours: i64,
    pub horizon_days: u32,
    pub cooldown_secs: i64,
    pub booking_policy: BookingPolicy,
    /// Directory for the per-user local cache files.
    pub cache_dir: PathBuf,
}

impl AppConfig {
    /// Read configuration from the environment. `API_BASE` and `ADMIN_TG_ID`
    /// are required; everything else falls back to product defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_base = std::env::var("API_BASE").context("API_BASE must be set")?;
        let admin_tg_id: i64 = std::env::var("ADMIN_TG_ID")
            .context("ADMIN_TG_ID must be set")?
            .parse()
            .context("ADMIN_TG_ID must be a number")?;

        let webapp_url = std::env::var("WEBAPP_URL").ok().filter(|u| !u.is_empty());

        let min_lead_hours = env_or("MIN_LEAD_HOURS", DEFAULT_MIN_LEAD_HOURS)?;
        let horizon_days = env_or("HORIZON_DAYS", DEFAULT_HORIZON_DAYS)?;
        let cooldown_secs = env_or("BOOKING_COOLDOWN_SECS", DEFAULT_COOLDOWN_SECS)?;

        let booking_policy = match std::env::var("BOOKING_POLICY") {
            Ok(raw) => raw.parse()?,
            Err(_) => BookingPolicy::default(),
        };

        let cache_dir = std::env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("cache"));

        Ok(Self {
            api_base,
            webapp_url,
            admin_tg_id,
            min_lead_hours,
            horizon_days,
            cooldown_secs,
            booking_policy,
            cache_dir,
        })
    }

    /// Salon-local timezone (fixed UTC+3).
    pub fn salon_tz(&self) -> FixedOffset {
        FixedOffset::east_opt(MSK_OFFSET_SECS).expect("valid fixed offset")
    }

    /// Whether the given Telegram user is the salon operator.
    pub fn is_admin(&self, tg_id: i64) -> bool {
        tg_id == self.admin_tg_id
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a number")),
        Err(_) => Ok(default),
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            api_base: "https://example.com/api".into(),
            webapp_url: None,
            admin_tg_id: 42,
            min_lead_hours: DEFAULT_MIN_LEAD_HOURS,
            horizon_days: DEFAULT_HORIZON_DAYS,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            booking_policy: BookingPolicy::Unlimited,
            cache_dir: PathBuf::from("cache"),
        }
    }

    #[test]
    fn test_admin_check() {
        let config = base_config();
        assert!(config.is_admin(42));
        assert!(!config.is_admin(43));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "unlimited".parse::<BookingPolicy>().unwrap(),
            BookingPolicy::Unlimited
        );
        assert_eq!(
            "one_per_day".parse::<BookingPolicy>().unwrap(),
            BookingPolicy::OnePerDay
        );
        assert_eq!(
            "one_active".parse::<BookingPolicy>().unwrap(),
            BookingPolicy::OneActive
        );
        assert!("weekly".parse::<BookingPolicy>().is_err());
    }

    #[test]
    fn test_salon_tz_is_utc_plus_3() {
        let config = base_config();
        assert_eq!(config.salon_tz().local_minus_utc(), MSK_OFFSET_SECS);
    }
}
