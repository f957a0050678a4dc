//! 誕生日・お祝いメッセージ・組織残高の永続化。
//!
//! バックエンドは JSON ファイル群か PostgreSQL のどちらか。どちらも変更のたびに即座に書き込む。

mod json;
mod postgres;

use std::path::PathBuf;

use thiserror::Error;
use tracing::info;

use crate::birthday::DayMonth;
use crate::config::StorageConfig;

pub use json::JsonStore;
pub use postgres::PgStore;

/// お祝いメッセージが未設定のときに使うテンプレート。
pub const DEFAULT_TEMPLATE: &str = "Today is {user}'s birthday! 🎉🥳";

/// テンプレート中でメンションに置き換えられるトークン。
pub const USER_PLACEHOLDER: &str = "{user}";

/// 永続化層の失敗。起きた時点でプロセスを止める。
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize store: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored date {date:?} for user {user_id} is invalid")]
    InvalidRecord { user_id: u64, date: String },
}

#[derive(Error, Debug)]
pub enum BalanceError {
    #[error("amount must be positive, got {0}")]
    NonPositive(i64),
    #[error("insufficient funds: balance is {balance}, requested {requested}")]
    Insufficient { balance: i64, requested: i64 },
    #[error("balance would overflow")]
    Overflow,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 1 人分の誕生日レコード。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Birthday {
    pub user_id: u64,
    pub date: DayMonth,
}

/// テンプレートの `{user}` をすべてメンションに置き換える。
pub fn render_template(template: &str, mention: &str) -> String {
    template.replace(USER_PLACEHOLDER, mention)
}

/// 設定されたバックエンドへのハンドル。
pub enum Storage {
    Json(JsonStore),
    Postgres(PgStore),
}

impl Storage {
    /// 設定に従ってストアを開く。
    pub async fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        match config {
            StorageConfig::Json { dir } => {
                info!(dir = ?dir, "Opening JSON store");
                Ok(Self::Json(JsonStore::open(dir)?))
            }
            StorageConfig::Postgres {
                url,
                max_connections,
            } => {
                info!(max_connections, "Connecting to PostgreSQL store");
                Ok(Self::Postgres(PgStore::connect(url, *max_connections).await?))
            }
        }
    }

    /// 誕生日を登録する。既にあれば上書きする。
    pub async fn set_birthday(&self, user_id: u64, date: DayMonth) -> Result<(), StoreError> {
        match self {
            Self::Json(store) => store.set_birthday(user_id, date).await,
            Self::Postgres(store) => store.set_birthday(user_id, date).await,
        }
    }

    pub async fn birthday(&self, user_id: u64) -> Result<Option<DayMonth>, StoreError> {
        match self {
            Self::Json(store) => Ok(store.birthday(user_id).await),
            Self::Postgres(store) => store.birthday(user_id).await,
        }
    }

    /// 誕生日を削除し、削除した値を返す。未登録なら `None` でストアは変化しない。
    pub async fn remove_birthday(&self, user_id: u64) -> Result<Option<DayMonth>, StoreError> {
        match self {
            Self::Json(store) => store.remove_birthday(user_id).await,
            Self::Postgres(store) => store.remove_birthday(user_id).await,
        }
    }

    /// 全件を返す。順序に意味はない。
    pub async fn birthdays(&self) -> Result<Vec<Birthday>, StoreError> {
        match self {
            Self::Json(store) => Ok(store.birthdays().await),
            Self::Postgres(store) => store.birthdays().await,
        }
    }

    /// 現在のお祝いメッセージのテンプレート。未設定なら [`DEFAULT_TEMPLATE`]。
    pub async fn message_template(&self) -> Result<String, StoreError> {
        let template = match self {
            Self::Json(store) => store.message_template().await,
            Self::Postgres(store) => store.message_template().await?,
        };
        Ok(template.unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()))
    }

    pub async fn set_message_template(&self, template: &str) -> Result<(), StoreError> {
        match self {
            Self::Json(store) => store.set_message_template(template).await,
            Self::Postgres(store) => store.set_message_template(template).await,
        }
    }

    pub async fn balance(&self) -> Result<i64, StoreError> {
        match self {
            Self::Json(store) => Ok(store.balance().await),
            Self::Postgres(store) => store.balance().await,
        }
    }

    /// 残高に加算し、加算後の残高を返す。
    pub async fn deposit(&self, amount: i64) -> Result<i64, BalanceError> {
        if amount <= 0 {
            return Err(BalanceError::NonPositive(amount));
        }
        match self {
            Self::Json(store) => store.deposit(amount).await,
            Self::Postgres(store) => store.deposit(amount).await,
        }
    }

    /// 残高から減算し、減算後の残高を返す。
    ///
    /// 残高を超える額は切り詰めずに拒否する。
    pub async fn withdraw(&self, amount: i64) -> Result<i64, BalanceError> {
        if amount <= 0 {
            return Err(BalanceError::NonPositive(amount));
        }
        match self {
            Self::Json(store) => store.withdraw(amount).await,
            Self::Postgres(store) => store.withdraw(amount).await,
        }
    }
}
