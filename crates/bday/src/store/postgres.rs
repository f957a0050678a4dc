//! PostgreSQL に保存するストア。スキーマは埋め込みマイグレーションで作成する。

use sqlx::{PgPool, Row as _, postgres::PgPoolOptions};
use tracing::info;

use super::{BalanceError, Birthday, StoreError};
use crate::birthday::DayMonth;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// 接続プールを作成し、マイグレーションを適用する。
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database migrations applied");

        Ok(Self { pool })
    }

    pub async fn set_birthday(&self, user_id: u64, date: DayMonth) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO birthdays (user_id, date)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET date = EXCLUDED.date
            "#,
        )
        .bind(user_id as i64)
        .bind(date.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn birthday(&self, user_id: u64) -> Result<Option<DayMonth>, StoreError> {
        let date: Option<String> =
            sqlx::query_scalar("SELECT date FROM birthdays WHERE user_id = $1")
                .bind(user_id as i64)
                .fetch_optional(&self.pool)
                .await?;
        date.map(|date| parse_record(user_id, date)).transpose()
    }

    pub async fn remove_birthday(&self, user_id: u64) -> Result<Option<DayMonth>, StoreError> {
        let date: Option<String> =
            sqlx::query_scalar("DELETE FROM birthdays WHERE user_id = $1 RETURNING date")
                .bind(user_id as i64)
                .fetch_optional(&self.pool)
                .await?;
        date.map(|date| parse_record(user_id, date)).transpose()
    }

    pub async fn birthdays(&self) -> Result<Vec<Birthday>, StoreError> {
        let rows = sqlx::query("SELECT user_id, date FROM birthdays")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<Birthday, StoreError> {
                let user_id = row.try_get::<i64, _>("user_id")? as u64;
                let date = parse_record(user_id, row.try_get("date")?)?;
                Ok(Birthday { user_id, date })
            })
            .collect()
    }

    pub async fn message_template(&self) -> Result<Option<String>, StoreError> {
        let template: Option<String> =
            sqlx::query_scalar("SELECT template FROM message_template WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(template)
    }

    pub async fn set_message_template(&self, template: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO message_template (id, template)
            VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET template = EXCLUDED.template
            "#,
        )
        .bind(template)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn balance(&self) -> Result<i64, StoreError> {
        let balance: i64 = sqlx::query_scalar("SELECT amount FROM balance WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(balance)
    }

    pub async fn deposit(&self, amount: i64) -> Result<i64, BalanceError> {
        let balance: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE balance SET amount = amount + $1
            WHERE id = 1 AND amount <= $2 - $1
            RETURNING amount
            "#,
        )
        .bind(amount)
        .bind(i64::MAX)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;
        balance.ok_or(BalanceError::Overflow)
    }

    pub async fn withdraw(&self, amount: i64) -> Result<i64, BalanceError> {
        let balance: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE balance SET amount = amount - $1
            WHERE id = 1 AND amount >= $1
            RETURNING amount
            "#,
        )
        .bind(amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        match balance {
            Some(balance) => Ok(balance),
            None => Err(BalanceError::Insufficient {
                balance: self.balance().await?,
                requested: amount,
            }),
        }
    }
}

fn parse_record(user_id: u64, date: String) -> Result<DayMonth, StoreError> {
    date.parse()
        .map_err(|_| StoreError::InvalidRecord { user_id, date })
}
