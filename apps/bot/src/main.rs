mod flow;
mod sessions;
mod telegram_layer;

use teloxide::prelude::*;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use flow::{handle_callback, handle_command, BotState, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let bot_token = std::env::var("BOT_TOKEN").expect("BOT_TOKEN must be set");
    init_tracing(&bot_token)?;

    let config = selesta_core::AppConfig::from_env()?;
    let bot = Bot::new(&bot_token);

    tracing::info!("💆 Selesta bot starting...");

    let state = BotState::new(config);

    // Handle commands + callback queries (inline buttons)
    let cmd_handler = Update::filter_message()
        .filter_command::<Command>()
        .endpoint({
            let state = state.clone();
            move |bot: Bot, msg: Message, cmd: Command| {
                let state = state.clone();
                async move {
                    handle_command(bot, msg, cmd, &state).await?;
                    Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
                }
            }
        });

    let callback_handler = Update::filter_callback_query().endpoint({
        let state = state.clone();
        move |bot: Bot, q: CallbackQuery| {
            let state = state.clone();
            async move {
                handle_callback(bot, q, &state).await?;
                Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
            }
        }
    });

    let handler = dptree::entry()
        .branch(cmd_handler)
        .branch(callback_handler);

    Dispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

/// Console logging, plus the Telegram error relay when `ERROR_CHAT_ID` is
/// configured.
fn init_tracing(bot_token: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("info".parse()?);
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    let error_chat_id = std::env::var("ERROR_CHAT_ID")
        .ok()
        .and_then(|v| v.parse::<i64>().ok());
    match error_chat_id {
        Some(chat_id) => registry
            .with(telegram_layer::TelegramLayer::new(bot_token.to_string(), chat_id))
            .init(),
        None => registry.init(),
    }
    Ok(())
}
