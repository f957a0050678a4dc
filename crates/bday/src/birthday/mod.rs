//! 誕生日の登録内容に基づくお祝い・ロール管理・一覧表示。

mod date;
pub mod listing;
mod sweep;

pub use date::DayMonth;
pub use sweep::{Community, Member, Notice, RoleError, Sweep};

use chrono::{FixedOffset, NaiveDate};

/// 設定されたタイムゾーンでの今日の日付を取得する。
pub fn local_today(offset: FixedOffset) -> NaiveDate {
    chrono::Utc::now().with_timezone(&offset).date_naive()
}
