use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub discord: DiscordConfig,
    pub birthday: BirthdayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DiscordConfig {
    pub token: String,
    /// コマンドを登録するサーバー
    pub guild_id: u64,
    /// 他人の誕生日の編集・メッセージ変更・残高操作ができるユーザー
    #[serde(default)]
    pub admins: Vec<u64>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: "YOUR_DISCORD_BOT_TOKEN".to_string(),
            guild_id: 0,
            admins: vec![],
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BirthdayConfig {
    /// お祝いと予告を投稿するチャンネル
    pub channel_id: u64,
    /// 誕生日当日に付与するロール
    pub role_id: u64,
    /// 予告でメンションするロール
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder_role_id: Option<u64>,
    /// 日付判定に使う UTC からのオフセット
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_utc_offset")]
    pub utc_offset: FixedOffset,
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,
}

impl Default for BirthdayConfig {
    fn default() -> Self {
        Self {
            channel_id: 0,
            role_id: 0,
            reminder_role_id: None,
            utc_offset: default_utc_offset(),
            interval: default_interval(),
        }
    }
}

fn default_utc_offset() -> FixedOffset {
    FixedOffset::east_opt(3 * 3600).expect("UTC+3 is a valid offset")
}

fn default_interval() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Json {
        dir: PathBuf,
    },
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Json {
            dir: PathBuf::from("data"),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

impl Config {
    pub fn is_admin(&self, user_id: u64) -> bool {
        self.discord.admins.contains(&user_id)
    }

    /// Discord の ID に 0 は使えないので、未設定のまま起動しないようにする。
    pub fn validate(&self) -> Result<()> {
        ensure!(self.discord.guild_id != 0, "discord.guild_id is not set");
        ensure!(self.birthday.channel_id != 0, "birthday.channel_id is not set");
        ensure!(self.birthday.role_id != 0, "birthday.role_id is not set");
        ensure!(
            self.birthday.reminder_role_id != Some(0),
            "birthday.reminder_role_id must not be 0"
        );
        ensure!(
            !self.birthday.interval.is_zero(),
            "birthday.interval must be positive"
        );
        Ok(())
    }
}

pub fn open_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path.as_ref()).context("Failed to read configuration file")?;
    let config: Config = toml::from_str(&content).context("Failed to parse configuration file")?;
    Ok(config)
}

pub fn write_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
    let content =
        toml::to_string_pretty(&Config::default()).context("Failed to serialize configuration")?;
    fs::write(path.as_ref(), content).context("Failed to write configuration file")?;
    Ok(())
}
