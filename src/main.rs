use std::sync::Arc;

use group_sentinel::moderation::{BackingStore, DiscordTransport, MemoryStore, SchedulerRequest};
use group_sentinel::{Config, Data, Error, commands, handlers, logging};
use poise::serenity_prelude::{self as serenity, GatewayIntents, Http};
use tracing::{error, info, warn};

async fn async_main() -> Result<(), Error> {
    let config = Config::load().await?;
    logging::init(&config.logging.dir)?;

    let token = Config::token()?;

    let store: Arc<dyn BackingStore> = match &config.storage.data_dir {
        Some(dir) => Arc::new(MemoryStore::load(dir).await?),
        None => {
            warn!("No storage.data_dir configured, sanctions will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    let transport = Arc::new(DiscordTransport::new(Arc::new(Http::new(&token))));

    let data = Data::build(config, store, transport)?;
    if let Err(e) = data.preload().await {
        error!(error = %e, "Initial authorization load failed, starting fail-open on an empty cache");
    }

    let (scheduler_tx, scheduler_handle) = Arc::clone(&data.scheduler).start();

    let setup_data = data.clone();
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all(),
            pre_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_start(ctx);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_end(ctx);
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    logging::log_command_error(&error);
                    if let Err(e) = poise::builtins::on_error(error).await {
                        warn!(error = %e, "Failed to report command error");
                    }
                })
            },
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                logging::log_console("Registering commands");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(setup_data)
            })
        })
        .build();

    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS;
    let mut client = serenity::ClientBuilder::new(&token, intents)
        .event_handler(handlers::Handler::new(data.clone()))
        .framework(framework)
        .await?;

    // Ctrl-C stops intake: scheduler first, then the gateway
    let shard_manager = Arc::clone(&client.shard_manager);
    let shutdown_tx = scheduler_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Shutdown requested");
        if shutdown_tx.send(SchedulerRequest::Shutdown).await.is_err() {
            warn!("Scheduler already stopped");
        }
        shard_manager.shutdown_all().await;
    });

    info!("Starting bot...");
    if let Err(e) = client.start().await {
        error!(error = %e, "Client stopped with an error");
    }

    // The gateway may have stopped on its own
    let _ = scheduler_tx.send(SchedulerRequest::Shutdown).await;
    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Scheduler task panicked");
    }
    data.service.drain().await;

    info!("Shutdown complete");
    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error building runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
