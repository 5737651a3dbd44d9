use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use selesta_core::models::{catalog, find_type};
use selesta_core::slots::group_by_period;
use selesta_core::window::available_dates;
use selesta_core::{AppConfig, Booking, BookingApi, BookingDraft, SlotQuery, SubmitError};
use teloxide::{
    prelude::*,
    types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, ParseMode, WebAppInfo},
    utils::command::BotCommands,
};

use crate::sessions::{Sessions, UserSession};

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
pub enum Command {
    #[command(description = "Записаться на массаж")]
    Start,
    #[command(description = "Мои записи")]
    MyBookings,
    #[command(description = "Все записи (для мастера)")]
    Records,
    #[command(description = "Помощь")]
    Help,
}

#[derive(Clone)]
pub struct BotState {
    pub config: AppConfig,
    pub sessions: Arc<Sessions>,
}

impl BotState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            sessions: Arc::new(Sessions::new(config.clone())),
            config,
        }
    }
}

// ── Command handlers ──

pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: &BotState,
) -> anyhow::Result<()> {
    match cmd {
        Command::Start => {
            bot.send_message(
                msg.chat.id,
                "💆 <b>Selesta Massage</b>\n\n\
                 Здравствуйте! 👋\n\
                 Я помогу вам записаться на массаж.\n\n\
                 Выберите, как удобнее записаться:",
            )
            .parse_mode(ParseMode::Html)
            .reply_markup(start_keyboard(state))
            .await?;
        }

        Command::MyBookings => {
            let Some(user) = msg.from.as_ref() else {
                return Ok(());
            };
            send_my_bookings(&bot, msg.chat.id, &state.sessions.get(user), state).await?;
        }

        Command::Records => {
            let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
            if !state.config.is_admin(user_id) {
                bot.send_message(msg.chat.id, "⛔ Только для мастера").await?;
                return Ok(());
            }
            send_records(&bot, msg.chat.id, state).await?;
        }

        Command::Help => {
            let is_admin = state
                .config
                .is_admin(msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0));

            let mut text = "💆 <b>Selesta Massage — бот для записи</b>\n\n\
                 /start — записаться на массаж\n\
                 /mybookings — мои записи\n\
                 /help — помощь"
                .to_string();

            if is_admin {
                text.push_str("\n\n<b>🔧 Команды мастера:</b>\n/records — все записи");
            }

            bot.send_message(msg.chat.id, text)
                .parse_mode(ParseMode::Html)
                .await?;
        }
    }

    Ok(())
}

// ── Callback query handler (inline button clicks) ──

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: &BotState,
) -> anyhow::Result<()> {
    let data = q.data.as_deref().unwrap_or("");
    let Some(chat_id) = q.message.as_ref().map(|m| m.chat().id) else {
        bot.answer_callback_query(&q.id).await?;
        return Ok(());
    };
    let session = state.sessions.get(&q.from);

    if data == "book" {
        bot.answer_callback_query(&q.id).await?;
        session.reset_draft();
        send_type_menu(&bot, chat_id, &session).await?;
    } else if let Some(type_id) = data.strip_prefix("t:") {
        bot.answer_callback_query(&q.id).await?;
        let Some(massage_type) = find_type(session.coordinator.catalog(), type_id) else {
            bot.send_message(chat_id, "Услуга не найдена. Начните заново: /start")
                .await?;
            return Ok(());
        };
        {
            let mut draft = session.draft.lock().expect("draft lock poisoned");
            draft.massage_type = Some(type_id.to_string());
            draft.duration = None;
            draft.slot = None;
        }

        let buttons: Vec<InlineKeyboardButton> = massage_type
            .durations
            .iter()
            .map(|d| {
                InlineKeyboardButton::callback(
                    format!("{} мин · {} ₽", d.minutes, d.price),
                    format!("d:{}", d.minutes),
                )
            })
            .collect();
        bot.send_message(
            chat_id,
            format!(
                "💆 <b>{}</b>\n{}\n\nВыберите длительность:",
                massage_type.name, massage_type.description
            ),
        )
        .parse_mode(ParseMode::Html)
        .reply_markup(InlineKeyboardMarkup::new(rows(buttons, 1)))
        .await?;
    } else if let Some(minutes) = data.strip_prefix("d:") {
        bot.answer_callback_query(&q.id).await?;
        let minutes: i64 = minutes.parse().unwrap_or(0);
        {
            let mut draft = session.draft.lock().expect("draft lock poisoned");
            draft.duration = Some(minutes);
            draft.slot = None;
        }
        send_date_menu(&bot, chat_id, state).await?;
    } else if let Some(day) = data.strip_prefix("day:") {
        bot.answer_callback_query(&q.id).await?;
        let Ok(day) = NaiveDate::parse_from_str(day, "%Y-%m-%d") else {
            return Ok(());
        };
        send_slot_menu(&bot, chat_id, &session, day).await?;
    } else if let Some(slot) = data.strip_prefix("s:") {
        bot.answer_callback_query(&q.id).await?;
        let Ok(slot) = DateTime::parse_from_rfc3339(slot) else {
            return Ok(());
        };
        let slot = slot.with_timezone(&Utc);
        let draft = {
            let mut draft = session.draft.lock().expect("draft lock poisoned");
            draft.slot = Some(slot);
            draft.clone()
        };
        send_confirmation_prompt(&bot, chat_id, &session, &draft).await?;
    } else if data == "confirm" {
        let draft = session.draft.lock().expect("draft lock poisoned").clone();
        match session.coordinator.submit(&draft, Utc::now()).await {
            Ok(outcome) => {
                bot.answer_callback_query(&q.id).text("✅").await?;
                session.reset_draft();
                bot.send_message(chat_id, format!("✅ {}", outcome.message))
                    .await?;
            }
            Err(e) => {
                bot.answer_callback_query(&q.id).await?;
                bot.send_message(chat_id, describe_submit_error(&e)).await?;
            }
        }
    } else if let Some(slot) = data.strip_prefix("c:") {
        let booking = session
            .coordinator
            .store()
            .bookings()
            .into_iter()
            .find(|b| b.slot == slot);
        let Some(booking) = booking else {
            bot.answer_callback_query(&q.id)
                .text("Запись не найдена или уже отменена")
                .await?;
            return Ok(());
        };
        match session.coordinator.cancel(&booking).await {
            Ok(outcome) => {
                bot.answer_callback_query(&q.id).text("✅").await?;
                bot.send_message(chat_id, format!("✅ {}", outcome.message))
                    .await?;
            }
            Err(e) => {
                bot.answer_callback_query(&q.id).await?;
                bot.send_message(chat_id, describe_submit_error(&e)).await?;
            }
        }
    } else {
        bot.answer_callback_query(&q.id).await?;
    }

    Ok(())
}

// ── Flow steps ──

fn start_keyboard(state: &BotState) -> InlineKeyboardMarkup {
    let mut keyboard: Vec<Vec<InlineKeyboardButton>> = Vec::new();
    if let Some(url) = &state.config.webapp_url {
        if let Ok(url) = url.parse() {
            keyboard.push(vec![InlineKeyboardButton::web_app(
                "💆 Открыть приложение",
                WebAppInfo { url },
            )]);
        } else {
            tracing::warn!(%url, "WEBAPP_URL is not a valid URL, button hidden");
        }
    }
    keyboard.push(vec![InlineKeyboardButton::callback(
        "📅 Записаться в чате",
        "book",
    )]);
    InlineKeyboardMarkup::new(keyboard)
}

async fn send_type_menu(
    bot: &Bot,
    chat_id: ChatId,
    session: &UserSession,
) -> anyhow::Result<()> {
    let buttons: Vec<InlineKeyboardButton> = session
        .coordinator
        .catalog()
        .iter()
        .map(|t| InlineKeyboardButton::callback(t.name.clone(), format!("t:{}", t.id)))
        .collect();
    bot.send_message(chat_id, "Выберите вид массажа:")
        .reply_markup(InlineKeyboardMarkup::new(rows(buttons, 1)))
        .await?;
    Ok(())
}

async fn send_date_menu(bot: &Bot, chat_id: ChatId, state: &BotState) -> anyhow::Result<()> {
    let now = Utc::now().with_timezone(&state.config.salon_tz());
    let dates = available_dates(now, state.config.min_lead_hours, state.config.horizon_days);

    let buttons: Vec<InlineKeyboardButton> = dates
        .iter()
        .map(|day| {
            InlineKeyboardButton::callback(
                format_date_ru(*day),
                format!("day:{}", day.format("%Y-%m-%d")),
            )
        })
        .collect();
    bot.send_message(chat_id, "Выберите дату:")
        .reply_markup(InlineKeyboardMarkup::new(rows(buttons, 2)))
        .await?;
    Ok(())
}

async fn send_slot_menu(
    bot: &Bot,
    chat_id: ChatId,
    session: &UserSession,
    day: NaiveDate,
) -> anyhow::Result<()> {
    let (massage_type, duration) = {
        let draft = session.draft.lock().expect("draft lock poisoned");
        (draft.massage_type.clone(), draft.duration)
    };
    let (Some(massage_type), Some(duration)) = (massage_type, duration) else {
        bot.send_message(chat_id, "Выбор устарел. Начните заново: /start")
            .await?;
        return Ok(());
    };

    let key = SlotQuery {
        day,
        massage_type,
        duration,
    };
    match session.board.refresh(&session.api, key).await {
        Ok(true) => {}
        // Deduplicated or superseded by a later tap; that tap will render.
        Ok(false) => return Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "slot fetch failed");
            bot.send_message(chat_id, "Не удалось загрузить свободное время. Попробуйте ещё раз.")
                .await?;
            return Ok(());
        }
    }

    let slots = session.board.current();
    if slots.is_empty() {
        bot.send_message(
            chat_id,
            format!("На {} свободного времени нет 🤷\nВыберите другую дату.", format_date_ru(day)),
        )
        .await?;
        return Ok(());
    }

    let grouped = group_by_period(&slots);
    let mut text = format!("🕐 Свободное время на {}:\n", format_date_ru(day));
    for (label, group) in [
        ("🌅 Утро", &grouped.morning),
        ("☀️ День", &grouped.afternoon),
        ("🌆 Вечер", &grouped.evening),
    ] {
        if !group.is_empty() {
            text.push_str(&format!("\n{label}: {}", times_line(group)));
        }
    }

    let buttons: Vec<InlineKeyboardButton> = slots
        .iter()
        .map(|slot| {
            InlineKeyboardButton::callback(
                slot.format("%H:%M").to_string(),
                format!("s:{}", slot.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            )
        })
        .collect();
    bot.send_message(chat_id, text)
        .reply_markup(InlineKeyboardMarkup::new(rows(buttons, 3)))
        .await?;
    Ok(())
}

async fn send_confirmation_prompt(
    bot: &Bot,
    chat_id: ChatId,
    session: &UserSession,
    draft: &BookingDraft,
) -> anyhow::Result<()> {
    let (Some(type_id), Some(minutes), Some(slot)) =
        (draft.massage_type.as_deref(), draft.duration, draft.slot)
    else {
        bot.send_message(chat_id, "Выбор устарел. Начните заново: /start")
            .await?;
        return Ok(());
    };
    let Some(massage_type) = find_type(session.coordinator.catalog(), type_id) else {
        bot.send_message(chat_id, "Услуга не найдена. Начните заново: /start")
            .await?;
        return Ok(());
    };
    let price = massage_type
        .duration(minutes)
        .map(|d| format!("{} ₽", d.price))
        .unwrap_or_else(|| "—".to_string());

    let keyboard = InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("✅ Подтвердить", "confirm"),
        InlineKeyboardButton::callback("↩️ Заново", "book"),
    ]]);
    bot.send_message(
        chat_id,
        format!(
            "Проверьте запись:\n\n💆 {}\n📅 {} · {}\n⏱ {} мин\n💰 {}",
            massage_type.name,
            format_date_ru(slot.date_naive()),
            range_label(slot, minutes),
            minutes,
            price,
        ),
    )
    .reply_markup(keyboard)
    .await?;
    Ok(())
}

async fn send_my_bookings(
    bot: &Bot,
    chat_id: ChatId,
    session: &UserSession,
    state: &BotState,
) -> anyhow::Result<()> {
    let mut note = "";
    if let Err(e) = session.coordinator.hydrate(&session.name).await {
        tracing::warn!(error = %e, "reconciliation failed, showing cached bookings");
        note = "\n⚠️ Не удалось обновить данные, показаны сохранённые записи.";
    }

    let bookings = session.coordinator.store().future_bookings(Utc::now());
    if bookings.is_empty() {
        bot.send_message(chat_id, format!("У вас пока нет активных записей 🤷{note}"))
            .reply_markup(start_keyboard(state))
            .await?;
        return Ok(());
    }

    let types = catalog();
    let mut text = format!("📋 <b>Ваши записи:</b>{note}\n\n");
    for b in &bookings {
        text.push_str(&format!("💆 <b>{}</b>\n📅 {}\n\n", service_name(&types, b), when_label(b)));
    }

    let buttons: Vec<Vec<InlineKeyboardButton>> = bookings
        .iter()
        .map(|b| {
            vec![InlineKeyboardButton::callback(
                format!("❌ Отменить {}", when_label(b)),
                format!("c:{}", b.slot),
            )]
        })
        .collect();
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(InlineKeyboardMarkup::new(buttons))
        .await?;
    Ok(())
}

async fn send_records(bot: &Bot, chat_id: ChatId, state: &BotState) -> anyhow::Result<()> {
    let records = match state.sessions.api().fetch_records().await {
        Ok(records) => records,
        Err(e) => {
            tracing::error!(error = %e, "records fetch failed");
            bot.send_message(chat_id, "Не удалось получить записи. Попробуйте позже.")
                .await?;
            return Ok(());
        }
    };

    if records.is_empty() {
        bot.send_message(chat_id, "☀️ Записей нет, свободные дни!").await?;
        return Ok(());
    }

    let types = catalog();
    let mut by_day: BTreeMap<NaiveDate, Vec<Booking>> = BTreeMap::new();
    for b in records {
        match b.start_time() {
            Some(t) => by_day.entry(t.date_naive()).or_default().push(b),
            None => tracing::warn!(slot = %b.slot, "record with unreadable slot skipped"),
        }
    }

    let mut total_count = 0usize;
    let mut total_sum = 0i64;
    let mut text = "📋 <b>Все записи</b>\n\n".to_string();
    for (day, mut bookings) in by_day {
        bookings.sort_by_key(|b| b.start_time());
        text.push_str(&format!("📅 <b>{}</b>\n", format_date_ru(day)));
        for b in &bookings {
            let price = find_type(&types, &b.massage_type)
                .and_then(|t| t.duration(b.duration))
                .map(|d| d.price)
                .unwrap_or(0);
            total_count += 1;
            total_sum += price;
            text.push_str(&format!(
                "  {} · 👤 {} · 💆 {}\n",
                when_time(b),
                b.name,
                service_name(&types, b),
            ));
        }
        text.push('\n');
    }
    text.push_str(&format!(
        "━━━━━━━━━━━━━\n📊 Всего записей: <b>{total_count}</b>\n💰 Итого: <b>{total_sum} ₽</b>"
    ));

    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

// ── Formatting helpers ──

/// User-facing explanation for a failed booking attempt. Backend refusals
/// are shown verbatim; connectivity faults get a generic retry hint.
fn describe_submit_error(error: &SubmitError) -> String {
    match error {
        SubmitError::CooldownActive { remaining_secs } => {
            format!("⏳ Подождите {remaining_secs} сек. перед следующей попыткой.")
        }
        SubmitError::Busy => "⏳ Предыдущий запрос ещё обрабатывается, подождите.".into(),
        SubmitError::LimitReached(reason) => format!("🚫 {reason}"),
        SubmitError::Api(api) if api.is_rejection() => format!("🚫 {api}"),
        SubmitError::Api(_) => "Сервис временно недоступен. Попробуйте позже.".into(),
        _ => "Выбор устарел. Начните запись заново: /start".into(),
    }
}

fn service_name(types: &[selesta_core::MassageType], booking: &Booking) -> String {
    find_type(types, &booking.massage_type)
        .map(|t| t.name.clone())
        .unwrap_or_else(|| booking.massage_type.clone())
}

/// "3 января · 11:00-12:00", falling back to the raw slot string.
fn when_label(booking: &Booking) -> String {
    match booking.start_time() {
        Some(t) => format!(
            "{} · {}",
            format_date_ru(t.date_naive()),
            range_label(t, booking.duration)
        ),
        None => booking.slot.clone(),
    }
}

fn when_time(booking: &Booking) -> String {
    match booking.start_time() {
        Some(t) => range_label(t, booking.duration),
        None => booking.slot.clone(),
    }
}

fn range_label(start: DateTime<Utc>, minutes: i64) -> String {
    let end = start + Duration::minutes(minutes);
    format!("{}-{}", start.format("%H:%M"), end.format("%H:%M"))
}

fn times_line(slots: &[DateTime<Utc>]) -> String {
    slots
        .iter()
        .map(|s| s.format("%H:%M").to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_date_ru(day: NaiveDate) -> String {
    use chrono::Datelike;
    let months = [
        "января", "февраля", "марта", "апреля", "мая", "июня",
        "июля", "августа", "сентября", "октября", "ноября", "декабря",
    ];
    format!("{} {}", day.day(), months[day.month0() as usize])
}

fn rows(buttons: Vec<InlineKeyboardButton>, per_row: usize) -> Vec<Vec<InlineKeyboardButton>> {
    buttons
        .chunks(per_row.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

// ── Tests ──
