use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use serenity::all::{
    ChannelId, CommandDataOptionValue, CommandInteraction, CreateCommand, CreateCommandOption,
    CreateEmbed, CreateInteractionResponse, CreateInteractionResponseFollowup,
    CreateInteractionResponseMessage, CreateMessage, EditInteractionResponse, GatewayIntents,
    GuildId, Http, Mentionable, RoleId, UserId,
};
use serenity::async_trait;
use serenity::builder::CreateEmbedFooter;
use serenity::client::Context as SerenityContext;
use serenity::http::HttpError;
use serenity::model::application::CommandOptionType;
use serenity::prelude::*;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::birthday::listing::{self, PAGE_SIZE};
use crate::birthday::{Community, DayMonth, Member, Notice, RoleError, Sweep, local_today};
use crate::config::Config;
use crate::store::{BalanceError, Storage, StoreError, USER_PLACEHOLDER};

const COLOR_GOLD: u32 = 0xf1c40f;
const COLOR_PURPLE: u32 = 0x9b59b6;
const COLOR_BLUE: u32 = 0x3498db;

/// Discord サーバーに対する [`Community`] の実装。
#[derive(Clone)]
pub struct DiscordCommunity {
    http: Arc<Http>,
    guild_id: GuildId,
    channel_id: ChannelId,
    role_id: RoleId,
}

impl DiscordCommunity {
    pub fn new(http: Arc<Http>, config: &Config) -> Self {
        Self {
            http,
            guild_id: GuildId::new(config.discord.guild_id),
            channel_id: ChannelId::new(config.birthday.channel_id),
            role_id: RoleId::new(config.birthday.role_id),
        }
    }
}

#[async_trait]
impl Community for DiscordCommunity {
    async fn resolve_member(&self, user_id: u64) -> Result<Option<Member>> {
        if user_id == 0 {
            return Ok(None);
        }

        match self.guild_id.member(&self.http, UserId::new(user_id)).await {
            Ok(member) => Ok(Some(Member {
                id: user_id,
                display_name: member.display_name().to_string(),
                mention: member.mention().to_string(),
                has_birthday_role: member.roles.contains(&self.role_id),
            })),
            Err(e) if is_missing_member(&e) => {
                debug!(user_id, "Member is not in the guild");
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to fetch member"),
        }
    }

    async fn grant_birthday_role(&self, user_id: u64) -> Result<(), RoleError> {
        self.http
            .add_member_role(
                self.guild_id,
                UserId::new(user_id),
                self.role_id,
                Some("Birthday"),
            )
            .await
            .map_err(role_error)
    }

    async fn revoke_birthday_role(&self, user_id: u64) -> Result<(), RoleError> {
        self.http
            .remove_member_role(
                self.guild_id,
                UserId::new(user_id),
                self.role_id,
                Some("Birthday is over"),
            )
            .await
            .map_err(role_error)
    }

    async fn post(&self, notice: Notice) -> Result<()> {
        let embed = match notice {
            Notice::Birthday { text } => CreateEmbed::new()
                .title("🎂 Happy Birthday!")
                .description(text)
                .color(COLOR_GOLD),
            Notice::Reminder { text } => CreateEmbed::new()
                .title("⏰ Reminder!")
                .description(text)
                .color(COLOR_PURPLE),
        };

        self.channel_id
            .send_message(&self.http, CreateMessage::new().embed(embed))
            .await
            .context("Failed to send notice")?;
        Ok(())
    }
}

/// HTTP エラーのステータスコードを取り出す。
fn status_code(error: &serenity::Error) -> Option<u16> {
    match error {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) => {
            Some(response.status_code.as_u16())
        }
        _ => None,
    }
}

/// メンバー取得のエラーが「在籍していない」ことを表すか。
fn is_missing_member(error: &serenity::Error) -> bool {
    status_code(error) == Some(404)
}

fn role_error(error: serenity::Error) -> RoleError {
    match status_code(&error) {
        Some(403) => RoleError::Forbidden,
        Some(404) => RoleError::NotFound,
        _ => RoleError::Other(error.into()),
    }
}

pub struct Handler {
    config: Config,
    store: Arc<Storage>,
    /// 再接続で ready が複数回呼ばれても 1 つだけ起動する
    sweep_started: AtomicBool,
    /// 永続化エラーの通知先。受け取った側が bot を停止する。
    fatal: mpsc::Sender<anyhow::Error>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: SerenityContext, ready: serenity::model::gateway::Ready) {
        info!(user = %ready.user.name, "Bot connected");

        let guild_id = GuildId::new(self.config.discord.guild_id);
        if let Err(e) = guild_id.set_commands(&ctx.http, commands()).await {
            error!(error = %e, "Failed to register commands");
        } else {
            info!(guild_id = guild_id.get(), "Slash commands registered");
        }

        if self.sweep_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let reminder_role = self
            .config
            .birthday
            .reminder_role_id
            .map(|id| RoleId::new(id).mention().to_string());
        let sweep = Sweep::new(
            self.store.clone(),
            self.community(&ctx),
            self.config.birthday.utc_offset,
            reminder_role,
        );
        tokio::spawn(sweep.run(self.config.birthday.interval, self.fatal.clone()));
    }

    async fn interaction_create(
        &self,
        ctx: SerenityContext,
        interaction: serenity::model::application::Interaction,
    ) {
        if let serenity::model::application::Interaction::Command(command) = interaction
            && let Err(e) = self.handle_command(&ctx, &command).await
        {
            error!(error = %e, command = %command.data.name, "Command error");

            let content = format!("Error: {}", e);
            let response = CreateInteractionResponseMessage::new()
                .content(&content)
                .ephemeral(true);

            // 応答済み (遅延応答を含む) ならフォローアップで伝える
            if command
                .create_response(&ctx.http, CreateInteractionResponse::Message(response))
                .await
                .is_err()
            {
                let followup = CreateInteractionResponseFollowup::new()
                    .content(content)
                    .ephemeral(true);
                if let Err(e) = command.create_followup(&ctx.http, followup).await {
                    error!(error = %e, "Failed to send error response");
                }
            }

            if e.downcast_ref::<StoreError>().is_some() {
                let _ = self.fatal.send(e).await;
            }
        }
    }
}

/// 登録するスラッシュコマンドの一覧。
fn commands() -> Vec<CreateCommand> {
    let user_option = |description: &str| {
        CreateCommandOption::new(CommandOptionType::User, "user", description)
    };
    let amount_option = || {
        CreateCommandOption::new(CommandOptionType::Integer, "amount", "Amount")
            .min_int_value(1)
            .required(true)
    };

    vec![
        CreateCommand::new("add_birthday")
            .description("Register a birthday")
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "date", "Format: DD/MM")
                    .required(true),
            )
            .add_option(user_option("Member to register (admins only)")),
        CreateCommand::new("remove_birthday")
            .description("Remove a birthday")
            .add_option(user_option("Member to remove (admins only)")),
        CreateCommand::new("birthday")
            .description("Show a registered birthday")
            .add_option(user_option("Member to look up")),
        CreateCommand::new("list_birthdays").description("List all birthdays"),
        CreateCommand::new("next_birthday").description("🎉 Show the nearest birthday"),
        CreateCommand::new("set_message")
            .description("Change the birthday greeting")
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "text",
                    "Greeting; {user} is replaced with the member",
                )
                .required(true),
            ),
        CreateCommand::new("balance").description("Show the organization balance"),
        CreateCommand::new("balance_add")
            .description("Add to the organization balance")
            .add_option(amount_option()),
        CreateCommand::new("balance_remove")
            .description("Remove from the organization balance")
            .add_option(amount_option()),
    ]
}

fn option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a CommandDataOptionValue> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .map(|opt| &opt.value)
}

/// 「考え中」の遅延応答。メンバー取得に時間がかかるコマンドで先に返す。
fn deferred() -> CreateInteractionResponse {
    CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new())
}

/// 一覧に表示する名前。取得できなければ ID で代用する。
async fn display_label<C: Community>(
    community: &C,
    user_id: u64,
    name: impl FnOnce(Member) -> String,
) -> String {
    match community.resolve_member(user_id).await {
        Ok(Some(member)) => name(member),
        Ok(None) => format!("ID {user_id}"),
        Err(e) => {
            warn!(user_id, error = %e, "Failed to fetch member for listing");
            format!("ID {user_id}")
        }
    }
}

/// 次の誕生日までの日数を文章にする。
fn describe_days(days: i64) -> String {
    match days {
        0 => "today".to_string(),
        1 => "tomorrow".to_string(),
        n => format!("in {n} days"),
    }
}

impl Handler {
    fn community(&self, ctx: &SerenityContext) -> DiscordCommunity {
        DiscordCommunity::new(ctx.http.clone(), &self.config)
    }

    async fn handle_command(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
    ) -> Result<()> {
        match command.data.name.as_str() {
            "add_birthday" => self.handle_add_birthday(ctx, command).await,
            "remove_birthday" => self.handle_remove_birthday(ctx, command).await,
            "birthday" => self.handle_birthday(ctx, command).await,
            "list_birthdays" => self.handle_list_birthdays(ctx, command).await,
            "next_birthday" => self.handle_next_birthday(ctx, command).await,
            "set_message" => self.handle_set_message(ctx, command).await,
            "balance" => self.handle_balance(ctx, command).await,
            "balance_add" => self.handle_balance_add(ctx, command).await,
            "balance_remove" => self.handle_balance_remove(ctx, command).await,
            _ => Ok(()),
        }
    }

    /// コマンドの対象ユーザーを決める。他人を対象にできるのは管理者だけ。
    fn target_user(&self, command: &CommandInteraction) -> Option<u64> {
        let caller = command.user.id.get();
        match option(command, "user").and_then(|v| v.as_user_id()) {
            Some(user) if user.get() != caller => {
                self.config.is_admin(caller).then_some(user.get())
            }
            _ => Some(caller),
        }
    }

    /// 管理者でなければ拒否の返信をして `false` を返す。
    async fn ensure_admin(&self, ctx: &SerenityContext, command: &CommandInteraction) -> Result<bool> {
        let user_id = command.user.id.get();
        if self.config.is_admin(user_id) {
            return Ok(true);
        }
        warn!(user_id, command = %command.data.name, "Unauthorized access attempt");
        reply(ctx, command, "You are not authorized to use this command.", true).await?;
        Ok(false)
    }

    async fn handle_add_birthday(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
    ) -> Result<()> {
        let text = option(command, "date")
            .and_then(|v| v.as_str())
            .context("Date not provided")?;

        let Some(user_id) = self.target_user(command) else {
            return reply(ctx, command, "Only admins can set other members' birthdays.", true).await;
        };

        let date: DayMonth = match text.parse() {
            Ok(date) => date,
            Err(e) => {
                return reply(ctx, command, format!("❌ Invalid date ({e}). Use DD/MM."), true)
                    .await;
            }
        };

        self.store.set_birthday(user_id, date).await?;
        info!(user_id, %date, by = command.user.id.get(), "Birthday saved");

        reply(
            ctx,
            command,
            format!("✅ Saved birthday {date} for {}!", UserId::new(user_id).mention()),
            false,
        )
        .await
    }

    async fn handle_remove_birthday(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
    ) -> Result<()> {
        let Some(user_id) = self.target_user(command) else {
            return reply(ctx, command, "Only admins can remove other members' birthdays.", true)
                .await;
        };

        let mention = UserId::new(user_id).mention();
        match self.store.remove_birthday(user_id).await? {
            Some(date) => {
                info!(user_id, %date, by = command.user.id.get(), "Birthday removed");
                reply(ctx, command, format!("🗑️ Removed birthday of {mention}."), false).await
            }
            None => {
                reply(ctx, command, format!("⚠️ No birthday registered for {mention}."), true)
                    .await
            }
        }
    }

    async fn handle_birthday(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
    ) -> Result<()> {
        let user_id = option(command, "user")
            .and_then(|v| v.as_user_id())
            .unwrap_or(command.user.id);
        let mention = user_id.mention();

        let content = match self.store.birthday(user_id.get()).await? {
            Some(date) => {
                let days = date.days_until(local_today(self.config.birthday.utc_offset));
                format!("🎂 {mention}: {date} ({})", describe_days(days))
            }
            None => format!("⚠️ No birthday registered for {mention}."),
        };
        reply(ctx, command, content, false).await
    }

    async fn handle_list_birthdays(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
    ) -> Result<()> {
        let birthdays = self.store.birthdays().await?;
        if birthdays.is_empty() {
            return reply(ctx, command, "⚠️ The list is empty.", false).await;
        }

        // メンバー取得は件数分の HTTP リクエストになるので、3 秒の期限前に応答しておく
        command.create_response(&ctx.http, deferred()).await?;

        let today = local_today(self.config.birthday.utc_offset);
        let items = listing::upcoming(&birthdays, today);
        let community = self.community(ctx);

        let mut embeds = Vec::new();
        for (index, page) in listing::paginate(&items, PAGE_SIZE).into_iter().enumerate() {
            let title = if index == 0 {
                "📅 Birthdays"
            } else {
                "📅 Birthdays (continued)"
            };
            let mut embed = CreateEmbed::new().title(title).color(COLOR_BLUE);
            for item in page {
                let name =
                    display_label(&community, item.user_id, |member| member.display_name).await;
                let value = format!("{} ({})", item.date, describe_days(item.days_until));
                embed = embed.field(name, value, false);
            }
            embeds.push(embed);
        }

        let total = items.len();
        let mut embeds = embeds.into_iter();
        if let Some(first) = embeds.next() {
            let first = first.footer(CreateEmbedFooter::new(format!("Total: {total} birthday(s)")));
            command
                .edit_response(&ctx.http, EditInteractionResponse::new().embed(first))
                .await?;
        }
        for embed in embeds {
            command
                .create_followup(
                    &ctx.http,
                    CreateInteractionResponseFollowup::new().embed(embed),
                )
                .await?;
        }

        Ok(())
    }

    async fn handle_next_birthday(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
    ) -> Result<()> {
        let birthdays = self.store.birthdays().await?;
        let today = local_today(self.config.birthday.utc_offset);
        let nearest = listing::nearest(&listing::upcoming(&birthdays, today));
        if nearest.is_empty() {
            return reply(ctx, command, "⚠️ The list is empty.", false).await;
        }

        command.create_response(&ctx.http, deferred()).await?;

        let community = self.community(ctx);
        let mut lines = Vec::with_capacity(nearest.len());
        for item in nearest {
            let name = display_label(&community, item.user_id, |member| member.mention).await;
            lines.push(format!(
                "🎂 Next birthday: {name} on {} ({})",
                item.date,
                describe_days(item.days_until)
            ));
        }
        command
            .edit_response(
                &ctx.http,
                EditInteractionResponse::new().content(lines.join("\n")),
            )
            .await?;
        Ok(())
    }

    async fn handle_set_message(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
    ) -> Result<()> {
        if !self.ensure_admin(ctx, command).await? {
            return Ok(());
        }

        let text = option(command, "text")
            .and_then(|v| v.as_str())
            .context("Text not provided")?;
        if !text.contains(USER_PLACEHOLDER) {
            return reply(
                ctx,
                command,
                format!("❌ The message must contain {USER_PLACEHOLDER}."),
                true,
            )
            .await;
        }

        self.store.set_message_template(text).await?;
        info!(by = command.user.id.get(), "Greeting updated");
        reply(ctx, command, "✅ Greeting updated!", false).await
    }

    async fn handle_balance(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
    ) -> Result<()> {
        let balance = self.store.balance().await?;
        reply(ctx, command, format!("💰 Organization balance: {balance}"), false).await
    }

    async fn handle_balance_add(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
    ) -> Result<()> {
        if !self.ensure_admin(ctx, command).await? {
            return Ok(());
        }
        let amount = option(command, "amount")
            .and_then(|v| v.as_i64())
            .context("Amount not provided")?;

        let content = match self.store.deposit(amount).await {
            Ok(balance) => {
                info!(amount, balance, by = command.user.id.get(), "Balance increased");
                format!("✅ Added {amount}. Balance: {balance}")
            }
            Err(BalanceError::Store(e)) => return Err(e.into()),
            Err(e) => format!("❌ {e}"),
        };
        reply(ctx, command, content, false).await
    }

    async fn handle_balance_remove(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
    ) -> Result<()> {
        if !self.ensure_admin(ctx, command).await? {
            return Ok(());
        }
        let amount = option(command, "amount")
            .and_then(|v| v.as_i64())
            .context("Amount not provided")?;

        let content = match self.store.withdraw(amount).await {
            Ok(balance) => {
                info!(amount, balance, by = command.user.id.get(), "Balance decreased");
                format!("✅ Removed {amount}. Balance: {balance}")
            }
            Err(BalanceError::Store(e)) => return Err(e.into()),
            Err(e) => format!("❌ {e}"),
        };
        reply(ctx, command, content, false).await
    }
}

async fn reply(
    ctx: &SerenityContext,
    command: &CommandInteraction,
    content: impl Into<String>,
    ephemeral: bool,
) -> Result<()> {
    let response = CreateInteractionResponseMessage::new()
        .content(content)
        .ephemeral(ephemeral);
    command
        .create_response(&ctx.http, CreateInteractionResponse::Message(response))
        .await?;
    Ok(())
}

/// bot を起動し、終了するまで待つ。
///
/// 永続化エラーを受け取った場合や Ctrl-C で全シャードを停止して戻る。
pub async fn run(config: Config, store: Arc<Storage>) -> Result<()> {
    let intents = GatewayIntents::GUILDS;
    let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
    let handler = Handler {
        config: config.clone(),
        store,
        sweep_started: AtomicBool::new(false),
        fatal: fatal_tx,
    };

    let mut client = Client::builder(&config.discord.token, intents)
        .event_handler(handler)
        .await
        .context("Failed to create client")?;
    let shard_manager = client.shard_manager.clone();

    info!("Starting bot");
    tokio::select! {
        result = client.start() => result.context("Client error")?,
        Some(e) = fatal_rx.recv() => {
            error!(error = %e, "Storage failure, shutting down");
            shard_manager.shutdown_all().await;
            return Err(e);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            shard_manager.shutdown_all().await;
        }
    }

    Ok(())
}
