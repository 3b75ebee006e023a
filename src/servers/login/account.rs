//! Durable account records, global account variables, the GM list, and
//! the login/ipban audit trail.
//!
//! Thin `sqlx::query_as`/`.bind()` wrappers around a `MySqlPool`, but
//! also carries an in-process fake table so [`AccountStore`] can back a
//! [`super::LoginEngine`] in tests without a live database — the pool
//! field is `Option<MySqlPool>` and `None` switches every method over to
//! the fake tables.

use anyhow::Result;
use sqlx::MySqlPool;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Table name overrides, taken from [`crate::config::LoginConfig`].
#[derive(Debug, Clone)]
pub struct TableNames {
    pub login: String,
    pub loginlog: String,
    pub ipban: String,
    pub reg: String,
    pub sstatus: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: u32,
    pub username: String,
    pub password: String,
    pub sex: char,
    pub gm_level: u8,
    pub email: String,
    pub connect_until: i64,
    pub ban_until: i64,
    pub state: i32,
    pub last_login: i64,
    pub login_count: u32,
    pub last_ip: String,
}

impl Account {
    fn new(id: u32, username: &str, password: &str, sex: char) -> Self {
        Account {
            id,
            username: username.to_string(),
            password: password.to_string(),
            sex,
            gm_level: 0,
            email: "a@a.com".to_string(),
            connect_until: 0,
            ban_until: 0,
            state: 0,
            last_login: 0,
            login_count: 0,
            last_ip: String::new(),
        }
    }
}

#[derive(Default)]
struct FakeTables {
    accounts: HashMap<u32, Account>,
    next_id: u32,
    vars: HashMap<u32, HashMap<String, String>>,
    audit: Vec<AuditRow>,
    sstatus: HashMap<u32, (String, u32)>,
}

#[derive(Debug, Clone)]
pub struct AuditRow {
    pub timestamp: i64,
    pub ip: String,
    pub user: String,
    pub rcode: i32,
    pub message: String,
}

pub struct AccountStore {
    pool: Option<MySqlPool>,
    tables: TableNames,
    new_account_id_floor: u32,
    fake: Mutex<FakeTables>,
}

impl AccountStore {
    pub fn new(pool: Option<MySqlPool>, tables: TableNames, new_account_id_floor: u32) -> Self {
        let mut fake = FakeTables::default();
        fake.next_id = new_account_id_floor;
        AccountStore {
            pool,
            tables,
            new_account_id_floor,
            fake: Mutex::new(fake),
        }
    }

    pub async fn lookup(&self, username: &str, case_sensitive: bool) -> Option<Account> {
        if let Some(pool) = &self.pool {
            let sql = if case_sensitive {
                format!("SELECT * FROM `{}` WHERE BINARY `userid` = ?", self.tables.login)
            } else {
                format!("SELECT * FROM `{}` WHERE `userid` = ?", self.tables.login)
            };
            let row: Option<AccountRow> = sqlx::query_as(&sql)
                .bind(username)
                .fetch_optional(pool)
                .await
                .unwrap_or(None);
            return row.map(Into::into);
        }

        let fake = self.fake.lock().await;
        fake.accounts.values().find(|a| {
            if case_sensitive {
                a.username == username
            } else {
                a.username.eq_ignore_ascii_case(username)
            }
        }).cloned()
    }

    pub async fn lookup_by_id(&self, id: u32) -> Option<Account> {
        if let Some(pool) = &self.pool {
            let sql = format!("SELECT * FROM `{}` WHERE id = ?", self.tables.login);
            let row: Option<AccountRow> = sqlx::query_as(&sql)
                .bind(id)
                .fetch_optional(pool)
                .await
                .unwrap_or(None);
            return row.map(Into::into);
        }
        let fake = self.fake.lock().await;
        fake.accounts.get(&id).cloned()
    }

    /// Creates a new account, enforcing the id-floor invariant: a
    /// newly assigned id below `new_account_id_floor` is rewritten to
    /// the floor, and the row is dropped if the rewrite itself fails.
    pub async fn create(&self, username: &str, password: &str, sex: char) -> Result<u32> {
        if let Some(pool) = &self.pool {
            let sql = format!(
                "INSERT INTO `{}` (userid, user_pass, sex, email) VALUES (?, ?, ?, 'a@a.com')",
                self.tables.login
            );
            let result = sqlx::query(&sql)
                .bind(username)
                .bind(password)
                .bind(sex.to_string())
                .execute(pool)
                .await?;
            let mut id = result.last_insert_id() as u32;
            if id < self.new_account_id_floor {
                let rewrite = format!("UPDATE `{}` SET id = ? WHERE id = ?", self.tables.login);
                let rewritten = sqlx::query(&rewrite)
                    .bind(self.new_account_id_floor)
                    .bind(id)
                    .execute(pool)
                    .await;
                match rewritten {
                    Ok(_) => id = self.new_account_id_floor,
                    Err(e) => {
                        let delete = format!("DELETE FROM `{}` WHERE id = ?", self.tables.login);
                        let _ = sqlx::query(&delete).bind(id).execute(pool).await;
                        return Err(e.into());
                    }
                }
            }
            return Ok(id);
        }

        let mut fake = self.fake.lock().await;
        if fake.accounts.values().any(|a| a.username == username) {
            anyhow::bail!("account already exists");
        }
        let id = fake.next_id.max(self.new_account_id_floor);
        fake.next_id = id + 1;
        fake.accounts.insert(id, Account::new(id, username, password, sex));
        Ok(id)
    }

    pub async fn update_login_stats(&self, id: u32, ip: &str, timestamp: i64) {
        if let Some(pool) = &self.pool {
            let sql = format!(
                "UPDATE `{}` SET lastlogin = ?, last_ip = ?, logincount = logincount + 1 WHERE id = ?",
                self.tables.login
            );
            let _ = sqlx::query(&sql).bind(timestamp).bind(ip).bind(id).execute(pool).await;
            return;
        }
        let mut fake = self.fake.lock().await;
        if let Some(acc) = fake.accounts.get_mut(&id) {
            acc.last_login = timestamp;
            acc.last_ip = ip.to_string();
            acc.login_count += 1;
        }
    }

    pub async fn set_ban_until(&self, id: u32, ts: i64) {
        if let Some(pool) = &self.pool {
            let sql = format!("UPDATE `{}` SET ban_until = ? WHERE id = ?", self.tables.login);
            let _ = sqlx::query(&sql).bind(ts).bind(id).execute(pool).await;
            return;
        }
        let mut fake = self.fake.lock().await;
        if let Some(acc) = fake.accounts.get_mut(&id) {
            acc.ban_until = ts;
        }
    }

    pub async fn set_state(&self, id: u32, code: i32) {
        if let Some(pool) = &self.pool {
            let sql = format!("UPDATE `{}` SET state = ? WHERE id = ?", self.tables.login);
            let _ = sqlx::query(&sql).bind(code).bind(id).execute(pool).await;
            return;
        }
        let mut fake = self.fake.lock().await;
        if let Some(acc) = fake.accounts.get_mut(&id) {
            acc.state = code;
        }
    }

    pub async fn set_sex(&self, id: u32, sex: char) {
        if let Some(pool) = &self.pool {
            let sql = format!("UPDATE `{}` SET sex = ? WHERE id = ?", self.tables.login);
            let _ = sqlx::query(&sql).bind(sex.to_string()).bind(id).execute(pool).await;
            return;
        }
        let mut fake = self.fake.lock().await;
        if let Some(acc) = fake.accounts.get_mut(&id) {
            acc.sex = sex;
        }
    }

    /// Changes the account's email, guarded by a claimed current email
    /// matching the stored one. Rejects the sentinel `a@a.com` and any
    /// value failing [`validate_email`]. Returns whether the change applied.
    pub async fn set_email(&self, id: u32, claimed_current: &str, new_email: &str) -> bool {
        if new_email == "a@a.com" || !validate_email(new_email) {
            return false;
        }
        if let Some(pool) = &self.pool {
            let sql = format!("SELECT email FROM `{}` WHERE id = ?", self.tables.login);
            let row: Option<(String,)> = sqlx::query_as(&sql).bind(id).fetch_optional(pool).await.unwrap_or(None);
            let current = match row {
                Some((e,)) => e,
                None => return false,
            };
            if current != claimed_current {
                return false;
            }
            let update = format!("UPDATE `{}` SET email = ? WHERE id = ?", self.tables.login);
            return sqlx::query(&update).bind(new_email).bind(id).execute(pool).await.is_ok();
        }
        let mut fake = self.fake.lock().await;
        match fake.accounts.get_mut(&id) {
            Some(acc) if acc.email == claimed_current => {
                acc.email = new_email.to_string();
                true
            }
            _ => false,
        }
    }

    /// Atomically replaces the full variable set for `id`.
    pub async fn replace_variables(&self, id: u32, vars: HashMap<String, String>) {
        if let Some(pool) = &self.pool {
            let mut tx = match pool.begin().await {
                Ok(tx) => tx,
                Err(_) => return,
            };
            let delete = format!("DELETE FROM `{}` WHERE type = 1 AND account_id = ?", self.tables.reg);
            if sqlx::query(&delete).bind(id).execute(&mut *tx).await.is_err() {
                return;
            }
            let insert = format!(
                "INSERT INTO `{}` (type, account_id, str, value) VALUES (1, ?, ?, ?)",
                self.tables.reg
            );
            for (k, v) in &vars {
                if sqlx::query(&insert).bind(id).bind(k).bind(v).execute(&mut *tx).await.is_err() {
                    return;
                }
            }
            let _ = tx.commit().await;
            return;
        }
        let mut fake = self.fake.lock().await;
        fake.vars.insert(id, vars);
    }

    pub async fn read_variables(&self, id: u32) -> HashMap<String, String> {
        if let Some(pool) = &self.pool {
            let sql = format!(
                "SELECT str, value FROM `{}` WHERE type = 1 AND account_id = ?",
                self.tables.reg
            );
            let rows: Vec<(String, String)> = sqlx::query_as(&sql)
                .bind(id)
                .fetch_all(pool)
                .await
                .unwrap_or_default();
            return rows.into_iter().collect();
        }
        let fake = self.fake.lock().await;
        fake.vars.get(&id).cloned().unwrap_or_default()
    }

    pub async fn load_gm_list(&self) -> Vec<(u32, u8)> {
        if let Some(pool) = &self.pool {
            let sql = format!("SELECT id, level FROM `{}` WHERE level > 0", self.tables.login);
            return sqlx::query_as(&sql).fetch_all(pool).await.unwrap_or_default();
        }
        let fake = self.fake.lock().await;
        fake.accounts.values().filter(|a| a.gm_level > 0).map(|a| (a.id, a.gm_level)).collect()
    }

    pub async fn append_audit(&self, timestamp: i64, ip: &str, user: &str, rcode: i32, message: &str) {
        if let Some(pool) = &self.pool {
            let sql = format!(
                "INSERT INTO `{}` (time, ip, user, rcode, log) VALUES (?, ?, ?, ?, ?)",
                self.tables.loginlog
            );
            let _ = sqlx::query(&sql)
                .bind(timestamp)
                .bind(ip)
                .bind(user)
                .bind(rcode)
                .bind(message)
                .execute(pool)
                .await;
            return;
        }
        let mut fake = self.fake.lock().await;
        fake.audit.push(AuditRow {
            timestamp,
            ip: ip.to_string(),
            user: user.to_string(),
            rcode,
            message: message.to_string(),
        });
    }

    /// Counts `rcode = 1` (bad password) audit rows from `ip` within
    /// the last `window_secs` seconds, relative to `now`.
    pub async fn count_recent_bad_password(&self, ip: &str, now: i64, window_secs: i64) -> i64 {
        if let Some(pool) = &self.pool {
            let sql = format!(
                "SELECT COUNT(*) FROM `{}` WHERE ip = ? AND rcode = 1 AND time >= ?",
                self.tables.loginlog
            );
            let row: Option<(i64,)> = sqlx::query_as(&sql)
                .bind(ip)
                .bind(now - window_secs)
                .fetch_optional(pool)
                .await
                .unwrap_or(None);
            return row.map(|(n,)| n).unwrap_or(0);
        }
        let fake = self.fake.lock().await;
        fake.audit
            .iter()
            .filter(|r| r.ip == ip && r.rcode == 1 && r.timestamp >= now - window_secs)
            .count() as i64
    }

    /// `sstatus` bookkeeping on a char-server connecting: delete then
    /// insert the row for this slot.
    pub async fn sstatus_connect(&self, index: u32, name: &str) {
        if let Some(pool) = &self.pool {
            let delete = format!("DELETE FROM `{}` WHERE `index` = ?", self.tables.sstatus);
            let _ = sqlx::query(&delete).bind(index).execute(pool).await;
            let insert = format!(
                "INSERT INTO `{}` (`index`, name, user) VALUES (?, ?, 0)",
                self.tables.sstatus
            );
            let _ = sqlx::query(&insert).bind(index).bind(name).execute(pool).await;
            return;
        }
        let mut fake = self.fake.lock().await;
        fake.sstatus.insert(index, (name.to_string(), 0));
    }

    /// DB keepalive: a no-op round-trip that keeps the pooled connection
    /// from being dropped by the server's `wait_timeout`.
    pub async fn ping(&self) -> bool {
        let Some(pool) = &self.pool else { return true };
        sqlx::query("SELECT 1").execute(pool).await.is_ok()
    }

    /// `sstatus` bookkeeping on a 0x2714 user-count report.
    pub async fn sstatus_update_count(&self, index: u32, user_count: u32) {
        if let Some(pool) = &self.pool {
            let sql = format!("UPDATE `{}` SET user = ? WHERE `index` = ?", self.tables.sstatus);
            let _ = sqlx::query(&sql).bind(user_count).bind(index).execute(pool).await;
            return;
        }
        let mut fake = self.fake.lock().await;
        if let Some(entry) = fake.sstatus.get_mut(&index) {
            entry.1 = user_count;
        }
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: u32,
    userid: String,
    user_pass: String,
    sex: String,
    level: Option<u8>,
    email: String,
    connect_until: Option<i64>,
    ban_until: Option<i64>,
    state: Option<i32>,
    lastlogin: Option<i64>,
    logincount: Option<u32>,
    last_ip: Option<String>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: row.id,
            username: row.userid,
            password: row.user_pass,
            sex: row.sex.chars().next().unwrap_or('M'),
            gm_level: row.level.unwrap_or(0),
            email: row.email,
            connect_until: row.connect_until.unwrap_or(0),
            ban_until: row.ban_until.unwrap_or(0),
            state: row.state.unwrap_or(0),
            last_login: row.lastlogin.unwrap_or(0),
            login_count: row.logincount.unwrap_or(0),
            last_ip: row.last_ip.unwrap_or_default(),
        }
    }
}

/// Email grammar: length 3..39, contains `@`, not trailing `@` or `.`,
/// no `@.` or `..` after the last `@`, no control chars/space/`;` after
/// the last `@`.
pub fn validate_email(email: &str) -> bool {
    if email.len() < 3 || email.len() > 39 {
        return false;
    }
    let Some(at_pos) = email.rfind('@') else { return false };
    if at_pos == 0 || at_pos == email.len() - 1 {
        return false;
    }
    if email.ends_with('.') {
        return false;
    }
    let domain = &email[at_pos + 1..];
    if domain.starts_with('.') || domain.contains("..") {
        return false;
    }
    if domain.chars().any(|c| c.is_control() || c == ' ' || c == ';') {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> TableNames {
        TableNames {
            login: "login".into(),
            loginlog: "loginlog".into(),
            ipban: "ipbanlist".into(),
            reg: "global_reg_value".into(),
            sstatus: "sstatus".into(),
        }
    }

    #[tokio::test]
    async fn create_then_lookup_round_trips() {
        let store = AccountStore::new(None, tables(), 2_000_000);
        let id = store.create("alice", "alicepw", 'F').await.unwrap();
        assert!(id >= 2_000_000);
        let acc = store.lookup("alice", true).await.unwrap();
        assert_eq!(acc.id, id);
        assert_eq!(acc.password, "alicepw");
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive_when_configured() {
        let store = AccountStore::new(None, tables(), 2_000_000);
        store.create("Alice", "pw", 'F').await.unwrap();
        assert!(store.lookup("alice", false).await.is_some());
        assert!(store.lookup("alice", true).await.is_none());
    }

    #[tokio::test]
    async fn replace_then_read_variables_round_trips() {
        let store = AccountStore::new(None, tables(), 2_000_000);
        let id = store.create("bob", "pw", 'M').await.unwrap();
        let mut vars = HashMap::new();
        vars.insert("k1".to_string(), "v1".to_string());
        vars.insert("k2".to_string(), "v2".to_string());
        store.replace_variables(id, vars.clone()).await;
        let read = store.read_variables(id).await;
        assert_eq!(read, vars);
    }

    #[tokio::test]
    async fn set_email_rejects_sentinel_and_mismatched_current() {
        let store = AccountStore::new(None, tables(), 2_000_000);
        let id = store.create("carol", "pw", 'F').await.unwrap();
        assert!(!store.set_email(id, "a@a.com", "a@a.com").await);
        assert!(!store.set_email(id, "wrong@current.com", "new@valid.com").await);
        assert!(store.set_email(id, "a@a.com", "new@valid.com").await);
    }

    #[test]
    fn email_grammar_accepts_and_rejects() {
        assert!(validate_email("a@b.com"));
        assert!(!validate_email("ab"));
        assert!(!validate_email("@b.com"));
        assert!(!validate_email("a@"));
        assert!(!validate_email("a@b.com."));
        assert!(!validate_email("a@.com"));
        assert!(!validate_email("a@b..com"));
        assert!(!validate_email("a@b com"));
    }

    #[tokio::test]
    async fn bad_password_audit_counted_within_window() {
        let store = AccountStore::new(None, tables(), 2_000_000);
        store.append_audit(1000, "10.0.0.5", "alice", 1, "password error").await;
        store.append_audit(1100, "10.0.0.5", "alice", 1, "password error").await;
        store.append_audit(1100, "10.0.0.5", "alice", 0, "login ok").await;
        let count = store.count_recent_bad_password("10.0.0.5", 1200, 300).await;
        assert_eq!(count, 2);
    }
}
