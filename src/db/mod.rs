//! Persistence contract.
//!
//! The core treats durable state as an external collaborator with a narrow
//! row interface: accounts (for SASL and OPER), registered channels,
//! stored messages (for CHATHISTORY), and server bans. SQLite via sqlx is
//! the shipped implementation. The daemon never polls — bans and
//! registered channels are loaded at startup and pushed in on change.

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::security::bans::{BanKind, ServerBan};

/// Shared handle to the SQLite pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// An account row. The core uses only these fields.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub password_hash: Option<String>,
    pub suspended: bool,
}

/// A registered channel row.
#[derive(Debug, Clone)]
pub struct RegisteredChannel {
    pub name: String,
    pub founder: String,
}

/// One stored message for CHATHISTORY playback.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub msgid: String,
    /// Folded channel name or nick.
    pub target: String,
    pub sender_nick: String,
    /// Full `nick!user@host` at send time.
    pub prefix: String,
    pub text: String,
    pub account: Option<String>,
    /// Unix millis.
    pub sent_at: i64,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS accounts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE COLLATE NOCASE,
        password_hash TEXT,
        suspended INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS account_fingerprints (
        account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
        fingerprint TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS registered_nicks (
        account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
        nick TEXT NOT NULL UNIQUE COLLATE NOCASE
    )",
    "CREATE TABLE IF NOT EXISTS registered_channels (
        name TEXT PRIMARY KEY COLLATE NOCASE,
        founder TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        msgid TEXT PRIMARY KEY,
        target TEXT NOT NULL,
        sender_nick TEXT NOT NULL,
        prefix TEXT NOT NULL,
        text TEXT NOT NULL,
        account TEXT,
        sent_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_target_time ON messages(target, sent_at)",
    "CREATE TABLE IF NOT EXISTS server_bans (
        kind TEXT NOT NULL,
        pattern TEXT NOT NULL,
        reason TEXT NOT NULL,
        set_by TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER,
        PRIMARY KEY (kind, pattern)
    )",
];

impl Database {
    /// Open (creating if missing) a database file and apply the schema.
    pub async fn connect(path: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    pub async fn find_account_by_name(&self, name: &str) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, name, password_hash, suspended FROM accounts WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(account_from_row))
    }

    pub async fn find_account_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT a.id, a.name, a.password_hash, a.suspended
             FROM accounts a
             JOIN account_fingerprints f ON f.account_id = a.id
             WHERE f.fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(account_from_row))
    }

    /// Verify a password against the stored Argon2 hash. Constant-time by
    /// construction of the verifier; a missing hash always fails.
    pub async fn verify_password(&self, name: &str, password: &str) -> Result<bool, sqlx::Error> {
        let Some(account) = self.find_account_by_name(name).await? else {
            return Ok(false);
        };
        if account.suspended {
            return Ok(false);
        }
        let Some(hash) = account.password_hash else {
            return Ok(false);
        };
        Ok(verify_argon2(&hash, password))
    }

    pub async fn list_registered_nicknames(
        &self,
        account_id: i64,
    ) -> Result<Vec<String>, sqlx::Error> {
        let rows = sqlx::query("SELECT nick FROM registered_nicks WHERE account_id = ?")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }

    /// Create an account. `password_hash` is PHC-format Argon2.
    pub async fn create_account(
        &self,
        name: &str,
        password_hash: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query("INSERT INTO accounts (name, password_hash) VALUES (?, ?)")
            .bind(name)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Bind a certificate fingerprint to an account (SASL EXTERNAL).
    pub async fn add_fingerprint(
        &self,
        account_id: i64,
        fingerprint: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO account_fingerprints (account_id, fingerprint) VALUES (?, ?)",
        )
        .bind(account_id)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registered channels
    // ------------------------------------------------------------------

    /// Register a channel to a founder account.
    pub async fn register_channel(&self, name: &str, founder: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT OR REPLACE INTO registered_channels (name, founder) VALUES (?, ?)")
            .bind(name)
            .bind(founder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn find_registered_channel(
        &self,
        name: &str,
    ) -> Result<Option<RegisteredChannel>, sqlx::Error> {
        let row = sqlx::query("SELECT name, founder FROM registered_channels WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| RegisteredChannel {
            name: r.get(0),
            founder: r.get(1),
        }))
    }

    pub async fn list_registered_channels(&self) -> Result<Vec<RegisteredChannel>, sqlx::Error> {
        let rows = sqlx::query("SELECT name, founder FROM registered_channels")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| RegisteredChannel {
                name: r.get(0),
                founder: r.get(1),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Message history
    // ------------------------------------------------------------------

    pub async fn store_message(&self, msg: &StoredMessage) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO messages
             (msgid, target, sender_nick, prefix, text, account, sent_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.msgid)
        .bind(&msg.target)
        .bind(&msg.sender_nick)
        .bind(&msg.prefix)
        .bind(&msg.text)
        .bind(&msg.account)
        .bind(msg.sent_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch messages for a target in a half-open time window, oldest
    /// first, capped at `limit`.
    pub async fn query_messages(
        &self,
        target: &str,
        since: Option<i64>,
        before: Option<i64>,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT msgid, target, sender_nick, prefix, text, account, sent_at
             FROM messages
             WHERE target = ? AND sent_at > ? AND sent_at < ?
             ORDER BY sent_at DESC
             LIMIT ?",
        )
        .bind(target)
        .bind(since.unwrap_or(0))
        .bind(before.unwrap_or(i64::MAX))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut out: Vec<StoredMessage> = rows
            .iter()
            .map(|r| StoredMessage {
                msgid: r.get(0),
                target: r.get(1),
                sender_nick: r.get(2),
                prefix: r.get(3),
                text: r.get(4),
                account: r.get(5),
                sent_at: r.get(6),
            })
            .collect();
        out.reverse();
        Ok(out)
    }

    /// Delete stored messages older than the retention window. Returns the
    /// number removed.
    pub async fn prune_messages(&self, older_than_millis: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM messages WHERE sent_at < ?")
            .bind(older_than_millis)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Server bans
    // ------------------------------------------------------------------

    pub async fn list_server_bans(&self, kind: BanKind) -> Result<Vec<ServerBan>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT pattern, reason, set_by, created_at, expires_at
             FROM server_bans WHERE kind = ?",
        )
        .bind(kind.letter().to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ServerBan {
                kind,
                pattern: r.get(0),
                reason: r.get(1),
                set_by: r.get(2),
                created_at: r.get(3),
                expires_at: r.get(4),
            })
            .collect())
    }

    pub async fn save_server_ban(&self, ban: &ServerBan) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR REPLACE INTO server_bans
             (kind, pattern, reason, set_by, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(ban.kind.letter().to_string())
        .bind(&ban.pattern)
        .bind(&ban.reason)
        .bind(&ban.set_by)
        .bind(ban.created_at)
        .bind(ban.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_server_ban(&self, kind: BanKind, pattern: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM server_bans WHERE kind = ? AND pattern = ?")
            .bind(kind.letter().to_string())
            .bind(pattern)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn account_from_row(row: sqlx::sqlite::SqliteRow) -> Account {
    Account {
        id: row.get(0),
        name: row.get(1),
        password_hash: row.get(2),
        suspended: row.get::<i64, _>(3) != 0,
    }
}

/// PHC-format Argon2 verification; malformed hashes fail closed.
pub fn verify_argon2(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};

    fn hash(password: &str) -> String {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn account_lookup_and_password() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query("INSERT INTO accounts (name, password_hash) VALUES (?, ?)")
            .bind("alice")
            .bind(hash("pw"))
            .execute(&db.pool)
            .await
            .unwrap();

        let account = db.find_account_by_name("alice").await.unwrap().unwrap();
        assert_eq!(account.name, "alice");
        assert!(db.verify_password("alice", "pw").await.unwrap());
        assert!(!db.verify_password("alice", "wrong").await.unwrap());
        assert!(!db.verify_password("nobody", "pw").await.unwrap());
    }

    #[tokio::test]
    async fn suspended_account_fails_auth() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query("INSERT INTO accounts (name, password_hash, suspended) VALUES (?, ?, 1)")
            .bind("mallory")
            .bind(hash("pw"))
            .execute(&db.pool)
            .await
            .unwrap();
        assert!(!db.verify_password("mallory", "pw").await.unwrap());
    }

    #[tokio::test]
    async fn fingerprint_lookup() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query("INSERT INTO accounts (name) VALUES ('bob')")
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO account_fingerprints (account_id, fingerprint)
             SELECT id, 'abcd1234' FROM accounts WHERE name = 'bob'",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let account = db
            .find_account_by_fingerprint("abcd1234")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.name, "bob");
        assert!(db.find_account_by_fingerprint("ffff").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn message_round_trip_and_window() {
        let db = Database::in_memory().await.unwrap();
        for i in 0..5i64 {
            db.store_message(&StoredMessage {
                msgid: format!("m{}", i),
                target: "#lobby".into(),
                sender_nick: "alice".into(),
                prefix: "alice!a@h".into(),
                text: format!("hello {}", i),
                account: None,
                sent_at: 1000 + i,
            })
            .await
            .unwrap();
        }

        let all = db.query_messages("#lobby", None, None, 10).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all.first().unwrap().msgid, "m0", "oldest first");

        let windowed = db
            .query_messages("#lobby", Some(1001), Some(1004), 10)
            .await
            .unwrap();
        assert_eq!(windowed.len(), 2);

        let limited = db.query_messages("#lobby", None, None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited.last().unwrap().msgid, "m4", "latest kept under limit");

        let pruned = db.prune_messages(1003).await.unwrap();
        assert_eq!(pruned, 3);
    }

    #[tokio::test]
    async fn server_ban_round_trip() {
        let db = Database::in_memory().await.unwrap();
        db.save_server_ban(&ServerBan {
            kind: BanKind::KLine,
            pattern: "*@bad.example".into(),
            reason: "spam".into(),
            set_by: "oper".into(),
            created_at: 1,
            expires_at: None,
        })
        .await
        .unwrap();

        let klines = db.list_server_bans(BanKind::KLine).await.unwrap();
        assert_eq!(klines.len(), 1);
        assert!(db.list_server_bans(BanKind::ZLine).await.unwrap().is_empty());
        assert!(db.delete_server_ban(BanKind::KLine, "*@bad.example").await.unwrap());
    }
}
