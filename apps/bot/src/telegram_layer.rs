//! Tracing layer that forwards ERROR-level events to the operator's
//! Telegram chat, rate-limited and deduplicated so a cascading failure does
//! not flood the chat. Sends are spawned onto the Tokio runtime and never
//! block the event path.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Minimum interval between alert messages.
const MIN_INTERVAL: Duration = Duration::from_secs(10);
/// Window during which an identical error is not repeated.
const DEDUP_WINDOW: Duration = Duration::from_secs(60);

// ── Throttle ──

/// Rate limit plus dedup over message hashes.
struct Throttle {
    min_interval: Duration,
    dedup_window: Duration,
    state: Mutex<ThrottleState>,
}

struct ThrottleState {
    last_sent: Instant,
    /// (hash, inserted_at) of recently sent messages.
    recent: Vec<(u64, Instant)>,
}

impl Throttle {
    fn new(min_interval: Duration, dedup_window: Duration) -> Self {
        Self {
            min_interval,
            dedup_window,
            state: Mutex::new(ThrottleState {
                // Allow the first message immediately.
                last_sent: Instant::now() - min_interval,
                recent: Vec::new(),
            }),
        }
    }

    fn admit(&self, hash: u64) -> bool {
        self.admit_at(hash, Instant::now())
    }

    fn admit_at(&self, hash: u64, now: Instant) -> bool {
        let mut state = self.state.lock().expect("throttle lock poisoned");
        state
            .recent
            .retain(|(_, ts)| now.duration_since(*ts) < self.dedup_window);

        let is_dup = state.recent.iter().any(|(h, _)| *h == hash);
        let too_soon = now.duration_since(state.last_sent) < self.min_interval;
        if is_dup || too_soon {
            return false;
        }
        state.last_sent = now;
        state.recent.push((hash, now));
        true
    }
}

// ── Layer ──

/// A `tracing` layer that forwards ERROR events to a Telegram chat.
pub struct TelegramLayer {
    bot_token: String,
    chat_id: i64,
    http: reqwest::Client,
    throttle: Throttle,
}

impl TelegramLayer {
    pub fn new(bot_token: String, chat_id: i64) -> Self {
        Self {
            bot_token,
            chat_id,
            http: reqwest::Client::new(),
            throttle: Throttle::new(MIN_INTERVAL, DEDUP_WINDOW),
        }
    }
}

impl<S: Subscriber> Layer<S> for TelegramLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::ERROR {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let message = visitor.message();

        let hash = {
            let mut h = DefaultHasher::new();
            message.hash(&mut h);
            h.finish()
        };
        if !self.throttle.admit(hash) {
            return;
        }

        let target = event.metadata().target();
        let now_utc = chrono::Utc::now().format("%H:%M:%S UTC");
        let text = format!(
            "\u{1f6a8} <b>Bot Error</b>\n\
             ━━━━━━━━━━━━━━━\n\
             <code>{message}</code>\n\
             ━━━━━━━━━━━━━━━\n\
             \u{1f4cd} {target}\n\
             \u{1f550} {now_utc}"
        );

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let client = self.http.clone();
        let chat_id = self.chat_id;
        tokio::spawn(async move {
            let _ = client
                .post(&url)
                .json(&serde_json::json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "HTML"
                }))
                .send()
                .await;
        });
    }
}

// ── Field visitor ──

/// Collects the `message` field plus any structured fields from an event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn message(&self) -> String {
        if self.fields.is_empty() {
            return self.message.clone();
        }
        let extras: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if self.message.is_empty() {
            extras.join(", ")
        } else {
            format!("{} ({})", self.message, extras.join(", "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{:?}", value);
        if field.name() == "message" {
            self.message = val;
        } else {
            self.fields.push((field.name().to_string(), val));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.push((field.name().to_string(), value.to_string()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.push((field.name().to_string(), value.to_string()));
    }
}

// ── Tests ──
