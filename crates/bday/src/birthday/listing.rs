//! 一覧表示用に誕生日を近い順に並べ、ページに分割する。

use chrono::NaiveDate;

use super::DayMonth;
use crate::store::Birthday;

/// Discord の埋め込み 1 件に載せられるフィールド数の上限。
pub const PAGE_SIZE: usize = 25;

/// 次の誕生日までの日数付きのレコード。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upcoming {
    pub user_id: u64,
    pub date: DayMonth,
    pub days_until: i64,
}

/// 次の誕生日が近い順に並べる。同じ日なら日付、ユーザー ID の順。
pub fn upcoming(birthdays: &[Birthday], today: NaiveDate) -> Vec<Upcoming> {
    let mut items: Vec<Upcoming> = birthdays
        .iter()
        .map(|b| Upcoming {
            user_id: b.user_id,
            date: b.date,
            days_until: b.date.days_until(today),
        })
        .collect();
    items.sort_by_key(|u| (u.days_until, u.date, u.user_id));
    items
}

/// 最も近い誕生日を返す。同じ日の人が複数いればすべて返す。
pub fn nearest(items: &[Upcoming]) -> Vec<Upcoming> {
    let Some(min) = items.iter().map(|u| u.days_until).min() else {
        return Vec::new();
    };
    items
        .iter()
        .filter(|u| u.days_until == min)
        .copied()
        .collect()
}

/// `page_size` 件ずつのページに分ける。
pub fn paginate<T>(items: &[T], page_size: usize) -> Vec<&[T]> {
    items.chunks(page_size.max(1)).collect()
}
