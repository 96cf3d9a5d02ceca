use std::{env, sync::Arc};

use poise::serenity_prelude::{self as serenity};
use serenity::GatewayIntents;
use steward::commands;
use steward::guild::HttpGuildModeration;
use steward::handlers::Handler;
use steward::logging;
use steward::notify::{DiscordTransport, NotificationSink, Notifier};
use steward::repository::{PUNISHMENTS_KEY, PunishmentKind, REMINDERS_KEY};
use steward::sweep::{Registration, ReminderHandler, SweepScheduler, UnbanHandler, UnmuteHandler};
use steward::{BotConfig, Data, Error};
use tracing::{error, info};

/// Wire the expiry and reminder sweeps to their documents
fn build_scheduler(data: &Data, http: Arc<serenity::Http>) -> SweepScheduler {
    let notifier: Arc<dyn NotificationSink> = Arc::new(Notifier::new(
        DiscordTransport::new(http.clone()),
        data.config.fallback_channel_id,
    ));
    let moderation = Arc::new(HttpGuildModeration::new(http));

    SweepScheduler::new(data.store.clone(), notifier, data.config.sweep_config())
        .with_registration(
            Registration::new(
                PUNISHMENTS_KEY,
                "expires_at",
                Arc::new(UnbanHandler::new(moderation.clone())),
            )
            .in_collection(PunishmentKind::TempBan.collection())
            .completed_field("unbanned_at"),
        )
        .with_registration(
            Registration::new(
                PUNISHMENTS_KEY,
                "expires_at",
                Arc::new(UnmuteHandler::new(moderation)),
            )
            .in_collection(PunishmentKind::Timeout.collection())
            .completed_field("unmuted_at"),
        )
        .with_registration(
            Registration::new(REMINDERS_KEY, "remind_at", Arc::new(ReminderHandler))
                .in_collection(REMINDERS_KEY),
        )
}

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    let config = BotConfig::load().await?;

    // Initialize logging
    logging::init(&config.log_dir)?;
    info!(
        data_dir = %config.data_dir.display(),
        sweep_interval_ms = config.sweep_interval_ms,
        "Configuration loaded"
    );

    // Load environment variables
    let token = env::var("DISCORD_TOKEN").map_err(|_| "DISCORD_TOKEN must be set")?;

    // Set up the bot's data
    let data = Data::new(config);
    let setup_data = data.clone();
    let prefix = data.config.prefix.clone();

    // Configure the Poise framework
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all(),
            prefix_options: poise::PrefixFrameworkOptions {
                prefix: Some(prefix),
                ..Default::default()
            },
            pre_command: |ctx| {
                Box::pin(async move {
                    // Log the start of command execution
                    logging::log_command_start(ctx);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    // Log the end of command execution
                    logging::log_command_end(ctx);
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    // Log the error using our logging system
                    logging::log_command_error(&error);
                    if let Err(e) = poise::builtins::on_error(error).await {
                        error!("Error while handling error: {e}");
                    }
                })
            },
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                logging::log_console("Registering commands".to_string());
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                let scheduler = build_scheduler(&setup_data, ctx.http.clone());
                setup_data.set_sweeper(scheduler.start()).await;
                Ok(setup_data)
            })
        })
        .build();

    // Configure the Serenity client
    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;
    let mut client = serenity::ClientBuilder::new(token, intents)
        .event_handler(Handler::new(data.clone()))
        .framework(framework)
        .await?;

    // Stop the sweep before the gateway so no tick runs against a dead client
    let shard_manager = client.shard_manager.clone();
    let shutdown_data = data.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
            return;
        }
        info!("Shutdown requested");
        shutdown_data.stop_sweeper().await;
        shard_manager.shutdown_all().await;
    });

    info!("Starting bot...");
    if let Err(err) = client.start().await {
        error!("Error starting the bot: {err}");
    }

    data.stop_sweeper().await;
    Ok(())
}

fn main() {
    // Run the async main function
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::from)
        .and_then(|runtime| runtime.block_on(async_main()));

    // Handle any errors that occurred during execution
    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
