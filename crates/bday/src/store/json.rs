//! ディレクトリ内の JSON / テキストファイルに保存するストア。
//!
//! - `birthdays.json`: ユーザー ID -> `DD/MM`
//! - `message.txt`: お祝いメッセージのテンプレート
//! - `balance.json`: `{"balance": <整数>}`

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{BalanceError, Birthday, StoreError};
use crate::birthday::DayMonth;

const BIRTHDAYS_FILE: &str = "birthdays.json";
const MESSAGE_FILE: &str = "message.txt";
const BALANCE_FILE: &str = "balance.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct BalanceFile {
    balance: i64,
}

/// メモリ上に保持している内容。ファイルと常に一致させる。
struct State {
    birthdays: BTreeMap<u64, DayMonth>,
    template: Option<String>,
    balance: i64,
}

pub struct JsonStore {
    /// ファイルを置くディレクトリ
    dir: PathBuf,
    state: Mutex<State>,
}

impl JsonStore {
    /// ディレクトリからストアを読み込む。ファイルが無いものは空として扱う。
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let birthdays: BTreeMap<u64, DayMonth> =
            read_json(&dir.join(BIRTHDAYS_FILE))?.unwrap_or_default();
        let template = read_text(&dir.join(MESSAGE_FILE))?;
        let balance = read_json::<BalanceFile>(&dir.join(BALANCE_FILE))?
            .unwrap_or_default()
            .balance;

        Ok(Self {
            dir,
            state: Mutex::new(State {
                birthdays,
                template,
                balance,
            }),
        })
    }

    pub async fn set_birthday(&self, user_id: u64, date: DayMonth) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut birthdays = state.birthdays.clone();
        birthdays.insert(user_id, date);
        self.save_birthdays(&birthdays)?;
        state.birthdays = birthdays;
        Ok(())
    }

    pub async fn birthday(&self, user_id: u64) -> Option<DayMonth> {
        self.state.lock().await.birthdays.get(&user_id).copied()
    }

    pub async fn remove_birthday(&self, user_id: u64) -> Result<Option<DayMonth>, StoreError> {
        let mut state = self.state.lock().await;
        let mut birthdays = state.birthdays.clone();
        let removed = birthdays.remove(&user_id);
        if removed.is_some() {
            self.save_birthdays(&birthdays)?;
            state.birthdays = birthdays;
        }
        Ok(removed)
    }

    pub async fn birthdays(&self) -> Vec<Birthday> {
        self.state
            .lock()
            .await
            .birthdays
            .iter()
            .map(|(&user_id, &date)| Birthday { user_id, date })
            .collect()
    }

    pub async fn message_template(&self) -> Option<String> {
        self.state.lock().await.template.clone()
    }

    pub async fn set_message_template(&self, template: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let path = self.dir.join(MESSAGE_FILE);
        fs::write(&path, template).map_err(|source| StoreError::Io { path, source })?;
        state.template = Some(template.to_string());
        Ok(())
    }

    pub async fn balance(&self) -> i64 {
        self.state.lock().await.balance
    }

    pub async fn deposit(&self, amount: i64) -> Result<i64, BalanceError> {
        let mut state = self.state.lock().await;
        let balance = state
            .balance
            .checked_add(amount)
            .ok_or(BalanceError::Overflow)?;
        self.save_balance(balance)?;
        state.balance = balance;
        Ok(balance)
    }

    pub async fn withdraw(&self, amount: i64) -> Result<i64, BalanceError> {
        let mut state = self.state.lock().await;
        if amount > state.balance {
            return Err(BalanceError::Insufficient {
                balance: state.balance,
                requested: amount,
            });
        }
        let balance = state.balance - amount;
        self.save_balance(balance)?;
        state.balance = balance;
        Ok(balance)
    }

    fn save_birthdays(&self, birthdays: &BTreeMap<u64, DayMonth>) -> Result<(), StoreError> {
        write_json(&self.dir.join(BIRTHDAYS_FILE), birthdays)
    }

    fn save_balance(&self, balance: i64) -> Result<(), StoreError> {
        write_json(&self.dir.join(BALANCE_FILE), &BalanceFile { balance })
    }
}

fn read_text(path: &Path) -> Result<Option<String>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StoreError> {
    let Some(content) = read_text(path)? else {
        return Ok(None);
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dm(s: &str) -> DayMonth {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn open_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        assert!(store.birthdays().await.is_empty());
        assert!(store.message_template().await.is_none());
        assert_eq!(store.balance().await, 0);
    }

    #[tokio::test]
    async fn open_creates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("data").join("bday");
        JsonStore::open(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn set_get_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        store.set_birthday(123, dm("15/03")).await.unwrap();
        assert_eq!(store.birthday(123).await, Some(dm("15/03")));

        store.set_birthday(123, dm("16/03")).await.unwrap();
        assert_eq!(store.birthday(123).await, Some(dm("16/03")));
        assert_eq!(store.birthdays().await.len(), 1);
        assert_eq!(store.birthday(999).await, None);
    }

    #[tokio::test]
    async fn remove_missing_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        store.set_birthday(1, dm("01/01")).await.unwrap();
        let before = fs::read_to_string(dir.path().join(BIRTHDAYS_FILE)).unwrap();

        assert_eq!(store.remove_birthday(2).await.unwrap(), None);

        let after = fs::read_to_string(dir.path().join(BIRTHDAYS_FILE)).unwrap();
        assert_eq!(before, after);
        assert_eq!(store.birthdays().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        store.set_birthday(1, dm("01/01")).await.unwrap();

        assert_eq!(store.remove_birthday(1).await.unwrap(), Some(dm("01/01")));
        assert!(store.birthdays().await.is_empty());

        let reopened = JsonStore::open(dir.path()).unwrap();
        assert!(reopened.birthdays().await.is_empty());
    }

    #[tokio::test]
    async fn failed_write_keeps_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        store.set_birthday(1, dm("01/01")).await.unwrap();

        // ファイルの位置をディレクトリで塞いで書き込みを失敗させる
        let path = dir.path().join(BIRTHDAYS_FILE);
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        let err = store.set_birthday(2, dm("02/02")).await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert_eq!(store.birthday(2).await, None);

        let err = store.remove_birthday(1).await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert_eq!(store.birthday(1).await, Some(dm("01/01")));
        assert_eq!(store.birthdays().await.len(), 1);
    }

    #[tokio::test]
    async fn changes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonStore::open(dir.path()).unwrap();
            store.set_birthday(42, dm("29/02")).await.unwrap();
            store.set_message_template("Yay {user}").await.unwrap();
            store.deposit(10).await.unwrap();
        }

        let store = JsonStore::open(dir.path()).unwrap();
        assert_eq!(store.birthday(42).await, Some(dm("29/02")));
        assert_eq!(store.message_template().await.as_deref(), Some("Yay {user}"));
        assert_eq!(store.balance().await, 10);
    }

    #[tokio::test]
    async fn load_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(BIRTHDAYS_FILE),
            r#"{"123": "5/3", "456": "31/12"}"#,
        )
        .unwrap();
        fs::write(dir.path().join(MESSAGE_FILE), "Happy birthday {user}!").unwrap();
        fs::write(dir.path().join(BALANCE_FILE), r#"{"balance": 250}"#).unwrap();

        let store = JsonStore::open(dir.path()).unwrap();
        assert_eq!(store.birthday(123).await, Some(dm("05/03")));
        assert_eq!(store.birthday(456).await, Some(dm("31/12")));
        assert_eq!(
            store.message_template().await.as_deref(),
            Some("Happy birthday {user}!")
        );
        assert_eq!(store.balance().await, 250);
    }

    #[test]
    fn reject_invalid_stored_date() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(BIRTHDAYS_FILE), r#"{"123": "31/02"}"#).unwrap();

        let err = JsonStore::open(dir.path()).err().unwrap();
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[tokio::test]
    async fn birthdays_file_is_id_to_date_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        store.set_birthday(7, dm("1/2")).await.unwrap();

        let content = fs::read_to_string(dir.path().join(BIRTHDAYS_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value, serde_json::json!({ "7": "01/02" }));
    }
}
