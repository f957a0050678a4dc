//! 年を持たない誕生日 (`DD/MM`) の解析と正規化。

use std::{fmt, str::FromStr, sync::LazyLock};

use chrono::{Datelike as _, NaiveDate};
use regex::Regex;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

static DAY_MONTH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)/([0-9]+)$").expect("day/month pattern is valid"));

/// 各月の最大日数。2 月はうるう年を許容して 29 日とする。
const DAYS_IN_MONTH: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DateError {
    #[error("expected a date in DD/MM format")]
    Format,
    #[error("month {0} is out of range (1-12)")]
    Month(u32),
    #[error("day {day} does not exist in month {month}")]
    Day { day: u32, month: u32 },
}

/// 日と月の組。表示形式はゼロ埋めの `DD/MM`。
///
/// 比較は月、日の順に行われる。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr,
)]
pub struct DayMonth {
    month: u8,
    day: u8,
}

impl DayMonth {
    /// 日と月から値を作る。存在しない組み合わせはエラーになる。
    pub fn new(day: u32, month: u32) -> Result<Self, DateError> {
        if !(1..=12).contains(&month) {
            return Err(DateError::Month(month));
        }
        let max_day = DAYS_IN_MONTH[(month - 1) as usize];
        if !(1..=max_day).contains(&day) {
            return Err(DateError::Day { day, month });
        }
        Ok(Self {
            month: month as u8,
            day: day as u8,
        })
    }

    /// 日付から年を落とした値を返す。
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            month: date.month() as u8,
            day: date.day() as u8,
        }
    }

    pub fn day(self) -> u32 {
        self.day.into()
    }

    pub fn month(self) -> u32 {
        self.month.into()
    }

    /// `today` 以降で最初にこの日付になる日を返す。
    ///
    /// 当日なら `today` そのものを返す。2/29 は次のうるう年まで進む。
    pub fn next_occurrence(self, today: NaiveDate) -> NaiveDate {
        let mut year = today.year();
        loop {
            if let Some(date) = NaiveDate::from_ymd_opt(year, self.month(), self.day())
                && date >= today
            {
                return date;
            }
            year += 1;
        }
    }

    /// 次にこの日付になるまでの日数。
    pub fn days_until(self, today: NaiveDate) -> i64 {
        (self.next_occurrence(today) - today).num_days()
    }
}

impl FromStr for DayMonth {
    type Err = DateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = DAY_MONTH_PATTERN
            .captures(s.trim())
            .ok_or(DateError::Format)?;
        // 桁あふれは範囲外として扱う
        let day = captures[1].parse().unwrap_or(u32::MAX);
        let month = captures[2].parse().unwrap_or(u32::MAX);
        Self::new(day, month)
    }
}

impl fmt::Display for DayMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}/{:02}", self.day, self.month)
    }
}
