//! 1 日 1 回の誕生日チェック。
//!
//! 当日の誕生日をお祝いしてロールを付与し、当日以外の人からロールを外し、
//! 翌日の誕生日を予告する。

use std::{sync::Arc, time::Duration};

use chrono::{FixedOffset, NaiveDate};
use serenity::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{DayMonth, local_today};
use crate::store::{Birthday, Storage, StoreError, render_template};

/// コミュニティのメンバー。チェックのたびに取得し直し、キャッシュしない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: u64,
    pub display_name: String,
    /// 本文に埋め込むメンション文字列
    pub mention: String,
    pub has_birthday_role: bool,
}

#[derive(Error, Debug)]
pub enum RoleError {
    #[error("missing permission to manage the birthday role")]
    Forbidden,
    #[error("member or role not found")]
    NotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// チャンネルに投稿するお知らせ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Birthday { text: String },
    Reminder { text: String },
}

/// チャットプラットフォーム側の操作。
#[async_trait]
pub trait Community: Send + Sync {
    /// メンバーを取得する。退出済みなら `Ok(None)`。
    ///
    /// 通信エラーなど、在籍しているか判断できない場合は `Err` を返す。
    async fn resolve_member(&self, user_id: u64) -> anyhow::Result<Option<Member>>;

    async fn grant_birthday_role(&self, user_id: u64) -> Result<(), RoleError>;

    async fn revoke_birthday_role(&self, user_id: u64) -> Result<(), RoleError>;

    /// お知らせ用チャンネルに投稿する。
    async fn post(&self, notice: Notice) -> anyhow::Result<()>;
}

/// 1 回のチェックで行った操作の件数。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub announced: usize,
    pub granted: usize,
    pub revoked: usize,
    pub reminded: usize,
    pub skipped: usize,
    /// メンバーを取得できず処理しなかった件数
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
enum RoleChange {
    Grant,
    Revoke,
}

pub struct Sweep<C> {
    store: Arc<Storage>,
    community: C,
    offset: FixedOffset,
    /// 予告でメンションするロール
    reminder_role: Option<String>,
}

impl<C: Community> Sweep<C> {
    pub fn new(
        store: Arc<Storage>,
        community: C,
        offset: FixedOffset,
        reminder_role: Option<String>,
    ) -> Self {
        Self {
            store,
            community,
            offset,
            reminder_role,
        }
    }

    /// `interval` ごとにチェックを繰り返す。初回は即座に実行する。
    ///
    /// ストアの読み込みに失敗した場合はエラーを `fatal` に送って終了する。
    pub async fn run(self, interval: Duration, fatal: mpsc::Sender<anyhow::Error>) {
        info!(
            interval = %humantime::format_duration(interval),
            offset = %self.offset,
            "Starting birthday sweep"
        );

        loop {
            let today = local_today(self.offset);
            match self.run_cycle(today).await {
                Ok(report) => info!(
                    date = %today,
                    announced = report.announced,
                    granted = report.granted,
                    revoked = report.revoked,
                    reminded = report.reminded,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Birthday sweep finished"
                ),
                Err(e) => {
                    error!(error = %e, "Birthday sweep failed");
                    let _ = fatal
                        .send(anyhow::Error::new(e).context("Birthday sweep failed"))
                        .await;
                    break;
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// `today` を基準に 1 回分のチェックを行う。
    pub async fn run_cycle(&self, today: NaiveDate) -> Result<CycleReport, StoreError> {
        let today_key = DayMonth::from_date(today);
        let tomorrow_key = today.succ_opt().map(DayMonth::from_date);

        let birthdays = self.store.birthdays().await?;
        let template = self.store.message_template().await?;

        let mut report = CycleReport::default();
        let mut members: Vec<(Birthday, Member)> = Vec::with_capacity(birthdays.len());
        for birthday in birthdays {
            match self.community.resolve_member(birthday.user_id).await {
                Ok(Some(member)) => members.push((birthday, member)),
                Ok(None) => {
                    debug!(user_id = birthday.user_id, "Member not found, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(
                        user_id = birthday.user_id,
                        date = %birthday.date,
                        error = %e,
                        "Failed to resolve member, birthday not handled this cycle"
                    );
                    report.failed += 1;
                }
            }
        }

        for (_, member) in members.iter().filter(|(b, _)| b.date == today_key) {
            if self.change_role(RoleChange::Grant, member).await {
                report.granted += 1;
            }
            let text = render_template(&template, &member.mention);
            if self.post(Notice::Birthday { text }).await {
                report.announced += 1;
            }
        }

        for (_, member) in members
            .iter()
            .filter(|(b, m)| b.date != today_key && m.has_birthday_role)
        {
            if self.change_role(RoleChange::Revoke, member).await {
                report.revoked += 1;
            }
        }

        for (_, member) in members
            .iter()
            .filter(|(b, _)| Some(b.date) == tomorrow_key)
        {
            let text = reminder_text(&member.mention, self.reminder_role.as_deref());
            if self.post(Notice::Reminder { text }).await {
                report.reminded += 1;
            }
        }

        Ok(report)
    }

    /// ロールを変更する。失敗はログに残して続行する。
    async fn change_role(&self, change: RoleChange, member: &Member) -> bool {
        let result = match change {
            RoleChange::Grant => self.community.grant_birthday_role(member.id).await,
            RoleChange::Revoke => self.community.revoke_birthday_role(member.id).await,
        };

        match result {
            Ok(()) => {
                info!(user_id = member.id, ?change, "Birthday role updated");
                true
            }
            Err(e @ (RoleError::Forbidden | RoleError::NotFound)) => {
                warn!(user_id = member.id, ?change, error = %e, "Birthday role not updated");
                false
            }
            Err(RoleError::Other(e)) => {
                error!(user_id = member.id, ?change, error = %e, "Failed to update birthday role");
                false
            }
        }
    }

    async fn post(&self, notice: Notice) -> bool {
        match self.community.post(notice).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to post notice");
                false
            }
        }
    }
}

/// 翌日の誕生日の予告文。
pub fn reminder_text(member_mention: &str, role_mention: Option<&str>) -> String {
    match role_mention {
        Some(role) => format!(
            "Tomorrow is {member_mention}'s birthday! {role}, get the presents ready 🎁🥳"
        ),
        None => format!("Tomorrow is {member_mention}'s birthday! Get the presents ready 🎁🥳"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;
    use crate::store::JsonStore;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Grant(u64),
        Revoke(u64),
        Post(Notice),
    }

    #[derive(Default)]
    struct FakeCommunity {
        members: HashMap<u64, Member>,
        forbidden: bool,
        /// 取得が失敗するメンバー
        unreachable: HashSet<u64>,
        calls: Mutex<Vec<Call>>,
    }

    impl FakeCommunity {
        fn with_member(mut self, id: u64, has_birthday_role: bool) -> Self {
            self.members.insert(
                id,
                Member {
                    id,
                    display_name: format!("user{id}"),
                    mention: format!("<@{id}>"),
                    has_birthday_role,
                },
            );
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Community for FakeCommunity {
        async fn resolve_member(&self, user_id: u64) -> anyhow::Result<Option<Member>> {
            if self.unreachable.contains(&user_id) {
                anyhow::bail!("gateway timeout");
            }
            Ok(self.members.get(&user_id).cloned())
        }

        async fn grant_birthday_role(&self, user_id: u64) -> Result<(), RoleError> {
            self.record(Call::Grant(user_id));
            if self.forbidden {
                return Err(RoleError::Forbidden);
            }
            Ok(())
        }

        async fn revoke_birthday_role(&self, user_id: u64) -> Result<(), RoleError> {
            self.record(Call::Revoke(user_id));
            if self.forbidden {
                return Err(RoleError::Forbidden);
            }
            Ok(())
        }

        async fn post(&self, notice: Notice) -> anyhow::Result<()> {
            self.record(Call::Post(notice));
            Ok(())
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn sweep_with(
        birthdays: &[(u64, &str)],
        community: FakeCommunity,
    ) -> (tempfile::TempDir, Sweep<FakeCommunity>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Storage::Json(JsonStore::open(dir.path()).unwrap());
        for (user_id, dm) in birthdays {
            store
                .set_birthday(*user_id, dm.parse().unwrap())
                .await
                .unwrap();
        }
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        let sweep = Sweep::new(
            Arc::new(store),
            community,
            offset,
            Some("<@&99>".to_string()),
        );
        (dir, sweep)
    }

    #[tokio::test]
    async fn birthday_today_is_announced() {
        let community = FakeCommunity::default().with_member(1, false);
        let (_dir, sweep) = sweep_with(&[(1, "15/03")], community).await;

        let report = sweep.run_cycle(date(2024, 3, 15)).await.unwrap();

        assert_eq!(
            sweep.community.calls(),
            vec![
                Call::Grant(1),
                Call::Post(Notice::Birthday {
                    text: "Today is <@1>'s birthday! 🎉🥳".to_string()
                }),
            ]
        );
        assert_eq!(
            report,
            CycleReport {
                announced: 1,
                granted: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn birthday_holder_keeps_role_on_the_day() {
        let community = FakeCommunity::default().with_member(1, true);
        let (_dir, sweep) = sweep_with(&[(1, "15/03")], community).await;

        sweep.run_cycle(date(2024, 3, 15)).await.unwrap();

        assert!(!sweep.community.calls().contains(&Call::Revoke(1)));
    }

    #[tokio::test]
    async fn birthday_tomorrow_revokes_and_reminds() {
        let community = FakeCommunity::default().with_member(1, true);
        let (_dir, sweep) = sweep_with(&[(1, "16/03")], community).await;

        let report = sweep.run_cycle(date(2024, 3, 15)).await.unwrap();

        assert_eq!(
            sweep.community.calls(),
            vec![
                Call::Revoke(1),
                Call::Post(Notice::Reminder {
                    text: "Tomorrow is <@1>'s birthday! <@&99>, get the presents ready 🎁🥳"
                        .to_string()
                }),
            ]
        );
        assert_eq!(report.announced, 0);
        assert_eq!(report.revoked, 1);
        assert_eq!(report.reminded, 1);
    }

    #[tokio::test]
    async fn no_revoke_without_role() {
        let community = FakeCommunity::default().with_member(1, false);
        let (_dir, sweep) = sweep_with(&[(1, "16/03")], community).await;

        sweep.run_cycle(date(2024, 3, 15)).await.unwrap();

        let calls = sweep.community.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::Post(Notice::Reminder { .. })));
    }

    #[tokio::test]
    async fn missing_member_is_skipped() {
        let (_dir, sweep) = sweep_with(&[(1, "15/03"), (2, "16/03")], FakeCommunity::default()).await;

        let report = sweep.run_cycle(date(2024, 3, 15)).await.unwrap();

        assert!(sweep.community.calls().is_empty());
        assert_eq!(report.skipped, 2);
        // レコード自体は残る
        assert_eq!(sweep.store.birthdays().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lookup_failure_is_not_counted_as_missing() {
        let community = FakeCommunity {
            unreachable: HashSet::from([1]),
            ..Default::default()
        }
        .with_member(1, false)
        .with_member(2, false);
        let (_dir, sweep) = sweep_with(&[(1, "15/03"), (2, "15/03")], community).await;

        let report = sweep.run_cycle(date(2024, 3, 15)).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.announced, 1);
        assert!(!sweep.community.calls().contains(&Call::Grant(1)));
        assert!(sweep.community.calls().contains(&Call::Grant(2)));
    }

    #[tokio::test]
    async fn forbidden_role_change_still_announces() {
        let community = FakeCommunity {
            forbidden: true,
            ..Default::default()
        }
        .with_member(1, false)
        .with_member(2, true);
        let (_dir, sweep) = sweep_with(&[(1, "15/03"), (2, "01/01")], community).await;

        let report = sweep.run_cycle(date(2024, 3, 15)).await.unwrap();

        assert_eq!(report.granted, 0);
        assert_eq!(report.revoked, 0);
        assert_eq!(report.announced, 1);
        assert_eq!(
            sweep.community.calls(),
            vec![
                Call::Grant(1),
                Call::Post(Notice::Birthday {
                    text: "Today is <@1>'s birthday! 🎉🥳".to_string()
                }),
                Call::Revoke(2),
            ]
        );
    }

    #[tokio::test]
    async fn uses_stored_template() {
        let community = FakeCommunity::default().with_member(1, false);
        let (_dir, sweep) = sweep_with(&[(1, "15/03")], community).await;
        sweep
            .store
            .set_message_template("Happy birthday, {user}!")
            .await
            .unwrap();

        sweep.run_cycle(date(2024, 3, 15)).await.unwrap();

        assert!(sweep.community.calls().contains(&Call::Post(Notice::Birthday {
            text: "Happy birthday, <@1>!".to_string()
        })));
    }

    #[tokio::test]
    async fn reminder_across_year_boundary() {
        let community = FakeCommunity::default().with_member(1, false);
        let (_dir, sweep) = sweep_with(&[(1, "01/01")], community).await;

        let report = sweep.run_cycle(date(2023, 12, 31)).await.unwrap();

        assert_eq!(report.reminded, 1);
    }

    #[tokio::test]
    async fn steps_run_in_order_across_records() {
        let community = FakeCommunity::default()
            .with_member(1, false)
            .with_member(2, true)
            .with_member(3, false);
        let (_dir, sweep) =
            sweep_with(&[(1, "15/03"), (2, "10/10"), (3, "16/03")], community).await;

        sweep.run_cycle(date(2024, 3, 15)).await.unwrap();

        let calls = sweep.community.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], Call::Grant(1));
        assert!(matches!(calls[1], Call::Post(Notice::Birthday { .. })));
        assert_eq!(calls[2], Call::Revoke(2));
        assert!(matches!(calls[3], Call::Post(Notice::Reminder { .. })));
    }

    #[test]
    fn reminder_without_role() {
        assert_eq!(
            reminder_text("<@1>", None),
            "Tomorrow is <@1>'s birthday! Get the presents ready 🎁🥳"
        );
    }
}
