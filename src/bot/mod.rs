//! Chat gateway lifecycle: session, command registration, dispatch.
//!
//! Only the leader replica runs a gateway session. Commands are registered
//! against the configured guild on the `ready` event, and every interaction
//! is answered with a single channel message.

pub mod commands;

use serenity::all::{
    Client, Context, CreateInteractionResponse, CreateInteractionResponseMessage, EventHandler,
    GatewayIntents, GuildId, Interaction, Ready,
};
use serenity::gateway::ShardManager;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ChatConfig;
use self::commands::Handlers;

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("chat.guild_id {0:?} is not a valid guild id")]
    InvalidGuildId(String),
    #[error("chat gateway error: {0}")]
    Gateway(#[from] serenity::Error),
}

struct GatewayHandler {
    handlers: Arc<Handlers>,
    guild_id: GuildId,
}

#[serenity::async_trait]
impl EventHandler for GatewayHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(user = %ready.user.name, "chat gateway connected");

        match self
            .guild_id
            .set_commands(&ctx.http, commands::slash_commands())
            .await
        {
            Ok(registered) => info!(count = registered.len(), "slash commands registered"),
            Err(err) => error!(error = %err, "registering slash commands"),
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };

        // Each interaction runs on its own task so a slow command does not
        // block the gateway event loop; concurrent bids serialize at the
        // aggregate, not here.
        let handlers = self.handlers.clone();
        tokio::spawn(async move {
            let content = handlers.dispatch(&command).await;
            let response = CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().content(content),
            );
            if let Err(err) = command.create_response(&ctx.http, response).await {
                error!(command = %command.data.name, error = %err, "failed to respond to interaction");
            }
        });
    }
}

/// A running gateway session.
pub struct Bot {
    shard_manager: Arc<ShardManager>,
    task: JoinHandle<()>,
}

/// Opens the gateway connection and starts serving interactions.
pub async fn start(cfg: &ChatConfig, handlers: Handlers) -> Result<Bot, BotError> {
    let guild_id = cfg
        .guild_id
        .parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .map(GuildId::new)
        .ok_or_else(|| BotError::InvalidGuildId(cfg.guild_id.clone()))?;

    let handler = GatewayHandler {
        handlers: Arc::new(handlers),
        guild_id,
    };
    let mut client = Client::builder(&cfg.token, GatewayIntents::empty())
        .event_handler(handler)
        .await?;

    let shard_manager = client.shard_manager.clone();
    let task = tokio::spawn(async move {
        if let Err(err) = client.start().await {
            error!(error = %err, "chat gateway connection failed");
        }
    });

    Ok(Bot {
        shard_manager,
        task,
    })
}

impl Bot {
    /// Closes the gateway connection and waits for the session task.
    pub async fn stop(self) {
        self.shard_manager.shutdown_all().await;
        if let Err(err) = self.task.await {
            error!(error = %err, "gateway task panicked");
        }
    }
}
