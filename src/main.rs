use dotenvy::dotenv;
use gemini_relay_bot::bot::handlers::Command;
use gemini_relay_bot::config::Settings;
use gemini_relay_bot::llm::{GeminiClient, GenerativeModel};
use gemini_relay_bot::logging::init_logging;
use gemini_relay_bot::storage::{MongoStorage, UserStore};
use gemini_relay_bot::{bot, utils};
use std::future::IntoFuture;
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Load .env file
    dotenv().ok();

    init_logging();

    info!("Starting Gemini relay bot...");

    let settings = init_settings();
    let store = init_storage(&settings).await;
    let model = init_model(&settings).await;

    let Some(token) = settings.telegram_token() else {
        error!("TELEGRAM_BOT_TOKEN is not set");
        std::process::exit(1);
    };
    let bot = Bot::new(token);

    let commands = Command::bot_commands();
    if let Err(e) =
        utils::retry_telegram_request(|| bot.set_my_commands(commands.clone()).into_future()).await
    {
        warn!("Failed to register bot commands: {e}");
    }

    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![store, model])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

fn init_settings() -> Settings {
    let settings = match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = settings.validate() {
        error!("{e}");
        std::process::exit(1);
    }
    info!("Configuration loaded successfully.");
    settings
}

async fn init_storage(settings: &Settings) -> Arc<dyn UserStore> {
    let Some(uri) = settings.resolved_mongodb_uri() else {
        error!("MongoDB connection is not configured");
        std::process::exit(1);
    };

    let storage = match MongoStorage::connect(&uri, &settings.database_name()).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to initialize MongoDB storage: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = storage.check_connection().await {
        error!("{e}");
        std::process::exit(1);
    }
    Arc::new(storage)
}

async fn init_model(settings: &Settings) -> Arc<dyn GenerativeModel> {
    let client = match GeminiClient::from_settings(settings) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to configure Gemini: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = client.check_connection().await {
        error!("Gemini connection check failed: {e}");
        std::process::exit(1);
    }
    info!(model = client.model_id(), "Gemini client initialized.");
    Arc::new(client)
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    Update::filter_message()
        .branch(
            dptree::entry()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(dptree::filter(|msg: Message| msg.contact().is_some()).endpoint(handle_contact))
        .branch(dptree::filter(|msg: Message| msg.photo().is_some()).endpoint(handle_photo))
        .branch(
            dptree::filter(|msg: Message| msg.text().is_some_and(|t| !t.starts_with('/')))
                .endpoint(handle_text),
        )
        .branch(dptree::endpoint(handle_unsupported))
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    store: Arc<dyn UserStore>,
) -> Result<(), teloxide::RequestError> {
    let res = match cmd {
        Command::Start => bot::handlers::start(bot, msg, store).await,
        Command::Help => bot::handlers::help(bot, msg).await,
        Command::Healthcheck => bot::handlers::healthcheck(bot, msg, store).await,
    };
    if let Err(e) = res {
        error!("Command error: {e}");
    }
    respond(())
}

async fn handle_contact(
    bot: Bot,
    msg: Message,
    store: Arc<dyn UserStore>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_contact(bot, msg, store).await {
        error!("Contact handler error: {e}");
    }
    respond(())
}

async fn handle_text(
    bot: Bot,
    msg: Message,
    store: Arc<dyn UserStore>,
    model: Arc<dyn GenerativeModel>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_text(bot, msg, store, model).await {
        error!("Text handler error: {e}");
    }
    respond(())
}

async fn handle_photo(
    bot: Bot,
    msg: Message,
    store: Arc<dyn UserStore>,
    model: Arc<dyn GenerativeModel>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_photo(bot, msg, store, model).await {
        error!("Photo handler error: {e}");
    }
    respond(())
}

async fn handle_unsupported(bot: Bot, msg: Message) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_unsupported(bot, msg).await {
        error!("Fallback handler error: {e}");
    }
    respond(())
}
