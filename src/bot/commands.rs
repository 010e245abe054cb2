//! Slash-command definitions and handlers.
//!
//! This is the only module that speaks the chat platform's vocabulary:
//! interactions come in, core calls go out, replies come back as text.
//! Admin-gated commands are restricted here via default member permissions;
//! the core treats all callers uniformly.

use serenity::all::{
    CommandInteraction, CommandOptionType, CreateCommand, CreateCommandOption, Permissions,
    ResolvedOption, ResolvedValue,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::auction::coordinator::{ClosedAuction, Coordinator, CoordinatorError};
use crate::auction::AuctionId;
use crate::dkp::{DkpError, DkpManager};
use crate::store::{Player, UserId};

const DEFAULT_AUCTION_MINUTES: i64 = 5;

/// The slash-command surface, as registered with the platform.
pub fn slash_commands() -> Vec<CreateCommand> {
    vec![
        CreateCommand::new("register")
            .description("Register your character for DKP tracking")
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "character",
                    "Your in-game character name",
                )
                .required(true),
            ),
        CreateCommand::new("dkp").description("Check your DKP balance"),
        CreateCommand::new("dkp-list").description("List all players and their DKP"),
        CreateCommand::new("dkp-add")
            .description("Add DKP to a player (admin only)")
            .default_member_permissions(Permissions::MANAGE_GUILD)
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::User,
                    "player",
                    "The player to award DKP to",
                )
                .required(true),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::Integer,
                    "amount",
                    "Amount of DKP to award",
                )
                .required(true),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "reason",
                    "Reason for the DKP award",
                )
                .required(true),
            ),
        CreateCommand::new("dkp-remove")
            .description("Remove DKP from a player (admin only)")
            .default_member_permissions(Permissions::MANAGE_GUILD)
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::User,
                    "player",
                    "The player to deduct DKP from",
                )
                .required(true),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::Integer,
                    "amount",
                    "Amount of DKP to deduct",
                )
                .required(true),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "reason",
                    "Reason for the DKP deduction",
                )
                .required(true),
            ),
        CreateCommand::new("auction-start")
            .description("Start an item auction")
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "item", "Item name to auction")
                    .required(true),
            )
            .add_option(CreateCommandOption::new(
                CommandOptionType::Integer,
                "min-bid",
                "Minimum bid amount",
            ))
            .add_option(CreateCommandOption::new(
                CommandOptionType::Integer,
                "duration",
                "Auction duration in minutes (default: 5)",
            )),
        CreateCommand::new("bid")
            .description("Place a bid on the current auction")
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "auction-id",
                    "Auction ID to bid on",
                )
                .required(true),
            )
            .add_option(
                CreateCommandOption::new(CommandOptionType::Integer, "amount", "Bid amount")
                    .required(true),
            ),
        CreateCommand::new("auction-close")
            .description("Close an auction (admin only)")
            .default_member_permissions(Permissions::MANAGE_GUILD)
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "auction-id",
                    "Auction ID to close",
                )
                .required(true),
            ),
    ]
}

pub struct Handlers {
    dkp: Arc<DkpManager>,
    coordinator: Arc<Coordinator>,
}

impl Handlers {
    pub fn new(dkp: Arc<DkpManager>, coordinator: Arc<Coordinator>) -> Self {
        Self { dkp, coordinator }
    }

    /// Routes an interaction to its handler and returns the reply text.
    #[tracing::instrument(skip_all, fields(command = %command.data.name))]
    pub async fn dispatch(&self, command: &CommandInteraction) -> String {
        match command.data.name.as_str() {
            "register" => self.register(command).await,
            "dkp" => self.dkp_balance(command).await,
            "dkp-list" => self.dkp_list().await,
            "dkp-add" => self.dkp_add(command).await,
            "dkp-remove" => self.dkp_remove(command).await,
            "auction-start" => self.auction_start(command).await,
            "bid" => self.bid(command).await,
            "auction-close" => self.auction_close(command).await,
            other => format!("Unknown command `{other}`"),
        }
    }

    async fn register(&self, command: &CommandInteraction) -> String {
        let Some(character) = str_option(command, "character") else {
            return missing_option("character");
        };
        let user = caller(command);

        match self.dkp.register(&user, character).await {
            Ok(player) => format!(
                "Registered **{}** (DKP: {})",
                player.character_name, player.dkp
            ),
            Err(err) => dkp_failure("Failed to register", &err),
        }
    }

    async fn dkp_balance(&self, command: &CommandInteraction) -> String {
        match self.dkp.get(&caller(command)).await {
            Ok(player) => format!("**{}** has **{} DKP**", player.character_name, player.dkp),
            Err(DkpError::NotRegistered(_)) => {
                "You are not registered. Use `/register` first.".to_string()
            }
            Err(err) => dkp_failure("Failed to look up balance", &err),
        }
    }

    async fn dkp_list(&self) -> String {
        match self.dkp.list().await {
            Ok(players) => standings(&players),
            Err(err) => dkp_failure("Error listing players", &err),
        }
    }

    async fn dkp_add(&self, command: &CommandInteraction) -> String {
        let Some(target) = user_option(command, "player") else {
            return missing_option("player");
        };
        let Some(amount) = amount_option(command, "amount") else {
            return "Amount is out of range.".to_string();
        };
        let Some(reason) = str_option(command, "reason") else {
            return missing_option("reason");
        };

        let target = match self.dkp.get(&target).await {
            Ok(player) => player,
            Err(DkpError::NotRegistered(_)) => {
                return "Target player is not registered.".to_string();
            }
            Err(err) => return dkp_failure("Failed to look up player", &err),
        };

        match self.dkp.award(&target.id, amount, reason).await {
            Ok(_) => format!(
                "Awarded **{} DKP** to **{}** for: {}",
                amount, target.character_name, reason
            ),
            Err(err) => dkp_failure("Failed to award DKP", &err),
        }
    }

    async fn dkp_remove(&self, command: &CommandInteraction) -> String {
        let Some(target) = user_option(command, "player") else {
            return missing_option("player");
        };
        let Some(amount) = amount_option(command, "amount") else {
            return "Amount is out of range.".to_string();
        };
        let Some(reason) = str_option(command, "reason") else {
            return missing_option("reason");
        };

        let target = match self.dkp.get(&target).await {
            Ok(player) => player,
            Err(DkpError::NotRegistered(_)) => {
                return "Target player is not registered.".to_string();
            }
            Err(err) => return dkp_failure("Failed to look up player", &err),
        };

        match self.dkp.deduct(&target.id, amount, reason).await {
            Ok(_) => format!(
                "Deducted **{} DKP** from **{}** for: {}",
                amount, target.character_name, reason
            ),
            Err(err) => dkp_failure("Failed to deduct DKP", &err),
        }
    }

    async fn auction_start(&self, command: &CommandInteraction) -> String {
        let Some(item) = str_option(command, "item") else {
            return missing_option("item");
        };
        let min_bid = match int_option(command, "min-bid") {
            Some(raw) => match i32::try_from(raw) {
                Ok(value) if value >= 0 => value,
                _ => return "Minimum bid is out of range.".to_string(),
            },
            None => 0,
        };
        let minutes = int_option(command, "duration").unwrap_or(DEFAULT_AUCTION_MINUTES);
        let Ok(minutes) = u64::try_from(minutes) else {
            return "Duration must not be negative.".to_string();
        };
        let duration = Duration::from_secs(minutes * 60);

        match self
            .coordinator
            .start_auction(item, caller(command), min_bid, duration)
            .await
        {
            Ok(auction) => format!(
                "Auction started for **{}** (ID: `{}`, Min bid: {}, Duration: {}m)",
                item,
                auction.id(),
                min_bid,
                minutes
            ),
            Err(err) => auction_failure("Failed to start auction", &err),
        }
    }

    async fn bid(&self, command: &CommandInteraction) -> String {
        let Some(raw_id) = str_option(command, "auction-id") else {
            return missing_option("auction-id");
        };
        let Some(amount) = amount_option(command, "amount") else {
            return "Amount is out of range.".to_string();
        };
        let Ok(auction_id) = raw_id.parse::<AuctionId>() else {
            return format!("Auction `{raw_id}` not found");
        };

        match self
            .coordinator
            .place_bid(&auction_id, &caller(command), amount)
            .await
        {
            Ok(_) => format!("Bid of **{amount} DKP** placed on auction `{auction_id}`"),
            Err(err) => auction_failure("Bid failed", &err),
        }
    }

    async fn auction_close(&self, command: &CommandInteraction) -> String {
        let Some(raw_id) = str_option(command, "auction-id") else {
            return missing_option("auction-id");
        };
        let Ok(auction_id) = raw_id.parse::<AuctionId>() else {
            return format!("Auction `{raw_id}` not found");
        };

        match self.coordinator.close_auction(&auction_id).await {
            Ok(outcome) => close_summary(&outcome),
            Err(err) => auction_failure("Failed to close auction", &err),
        }
    }
}

fn caller(command: &CommandInteraction) -> UserId {
    UserId::new(command.user.id.to_string())
}

fn find_option<'a>(
    command: &'a CommandInteraction,
    name: &str,
) -> Option<ResolvedOption<'a>> {
    command
        .data
        .options()
        .into_iter()
        .find(|option| option.name == name)
}

fn str_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    match find_option(command, name)?.value {
        ResolvedValue::String(value) => Some(value),
        _ => None,
    }
}

fn int_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    match find_option(command, name)?.value {
        ResolvedValue::Integer(value) => Some(value),
        _ => None,
    }
}

/// An integer option narrowed to the DKP range.
fn amount_option(command: &CommandInteraction, name: &str) -> Option<i32> {
    i32::try_from(int_option(command, name)?).ok()
}

fn user_option(command: &CommandInteraction, name: &str) -> Option<UserId> {
    match find_option(command, name)?.value {
        ResolvedValue::User(user, _) => Some(UserId::new(user.id.to_string())),
        _ => None,
    }
}

fn missing_option(name: &str) -> String {
    format!("Missing required option `{name}`")
}

fn standings(players: &[Player]) -> String {
    if players.is_empty() {
        return "No players registered yet.".to_string();
    }
    let mut message = String::from("**DKP Standings:**\n");
    for (index, player) in players.iter().enumerate() {
        message.push_str(&format!(
            "{}. {} with {} DKP\n",
            index + 1,
            player.character_name,
            player.dkp
        ));
    }
    message
}

fn close_summary(outcome: &ClosedAuction) -> String {
    match &outcome.winner {
        Some(bid) => format!(
            "Auction for **{}** closed! Winner: **{}** with **{} DKP**",
            outcome.item_name, bid.player_id, bid.amount
        ),
        None => format!("Auction for **{}** closed with no bids.", outcome.item_name),
    }
}

/// Input errors render as-is; internal failures are logged and replaced
/// with a generic line.
fn dkp_failure(prefix: &str, err: &DkpError) -> String {
    match err {
        DkpError::Store(_) => {
            error!(error = %err, "dkp command failed");
            format!("{prefix}: something went wrong, try again later.")
        }
        _ => format!("{prefix}: {err}"),
    }
}

fn auction_failure(prefix: &str, err: &CoordinatorError) -> String {
    match err {
        CoordinatorError::Bid(_)
        | CoordinatorError::AuctionNotFound(_)
        | CoordinatorError::PlayerNotRegistered(_) => format!("{prefix}: {err}"),
        CoordinatorError::Settlement { auction_id, .. } => {
            error!(error = %err, "settlement failed");
            format!(
                "Auction `{auction_id}` closed, but settling the winner's DKP failed; \
                 an admin should reconcile the balance."
            )
        }
        CoordinatorError::Replay(_) | CoordinatorError::Store(_) => {
            error!(error = %err, "auction command failed");
            format!("{prefix}: something went wrong, try again later.")
        }
    }
}
