//-
// Copyright (c) 2024, 2025, Jason Lingle
//
// This file is part of Tridove.
//
// Tridove is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Tridove is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of  MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Tridove. If not, see <http://www.gnu.org/licenses/>.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use log::warn;
use rusqlite::{params, Connection, OptionalExtension};

use super::password;
use crate::support::error::Error;

/// The shared user directory, backed by SQLite.
///
/// All operations serialize on one coarse mutex. Authentication traffic is
/// low-rate, so contention is not a concern; what matters is that the three
/// protocol front-ends see one consistent view.
pub struct DirectoryStore {
    conn: Mutex<Connection>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRecord {
    pub local: String,
    pub domain: String,
    pub quota_bytes: i64,
    pub used_bytes: i64,
    pub active: bool,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainRecord {
    pub domain: String,
    pub active: bool,
}

pub const DEFAULT_QUOTA_BYTES: i64 = 100 * 1024 * 1024;
/// The same value for contexts that need a string, e.g. clap defaults.
/// `default_quota_constants_agree` keeps the two from drifting apart.
pub const DEFAULT_QUOTA_BYTES_STR: &str = "104857600";

/// Split `user@domain` into its parts. A missing `@` yields an empty domain.
pub fn parse_userid(userid: &str) -> (&str, &str) {
    match userid.split_once('@') {
        Some((local, domain)) => (local, domain),
        None => (userid, ""),
    }
}

impl DirectoryStore {
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS domains (\n\
             id INTEGER PRIMARY KEY AUTOINCREMENT,\n\
             domain TEXT UNIQUE NOT NULL,\n\
             active INTEGER DEFAULT 1,\n\
             created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP\n\
             );\n\
             CREATE TABLE IF NOT EXISTS users (\n\
             id INTEGER PRIMARY KEY AUTOINCREMENT,\n\
             username TEXT NOT NULL,\n\
             domain TEXT NOT NULL,\n\
             password_hash TEXT NOT NULL,\n\
             quota_bytes INTEGER DEFAULT {default_quota},\n\
             used_bytes INTEGER DEFAULT 0,\n\
             active INTEGER DEFAULT 1,\n\
             created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,\n\
             UNIQUE(username, domain),\n\
             FOREIGN KEY(domain) REFERENCES domains(domain) \
             ON DELETE CASCADE\n\
             );\n\
             CREATE INDEX IF NOT EXISTS idx_users_username \
             ON users(username);\n\
             CREATE INDEX IF NOT EXISTS idx_users_domain ON users(domain);",
            default_quota = DEFAULT_QUOTA_BYTES,
        ))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Verify `password` against the record for `userid` (`user@domain`).
    ///
    /// Unknown users, inactive users, and internal errors all report plain
    /// failure; the protocol layers have no use for the distinction and the
    /// client must not learn it.
    pub fn authenticate(&self, userid: &str, password: &str) -> bool {
        let (local, domain) = parse_userid(userid);
        let conn = self.conn.lock().unwrap();

        let row: Option<(String, bool)> = conn
            .query_row(
                "SELECT password_hash, active FROM users \
                 WHERE username = ?1 AND domain = ?2",
                params![local, domain],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .unwrap_or(None);

        let Some((hash, active)) = row else {
            return false;
        };

        if !active {
            return false;
        }

        match password::verify_password(password, &hash) {
            Ok(ok) => ok,
            Err(e) => {
                warn!("Unverifiable password hash for {userid}: {e}");
                false
            },
        }
    }

    pub fn user_exists(&self, local: &str, domain: &str) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT 1 FROM users \
             WHERE username = ?1 AND domain = ?2 AND active = 1",
            params![local, domain],
            |_| Ok(()),
        )
        .optional()
        .unwrap_or(None)
        .is_some()
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT 1 FROM domains WHERE domain = ?1 AND active = 1",
            params![domain],
            |_| Ok(()),
        )
        .optional()
        .unwrap_or(None)
        .is_some()
    }

    pub fn create_domain(&self, domain: &str) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "INSERT OR IGNORE INTO domains (domain) VALUES (?1)",
            params![domain],
        )?;
        if 0 == n {
            return Err(Error::DomainExists);
        }
        Ok(())
    }

    pub fn delete_domain(&self, domain: &str) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM domains WHERE domain = ?1",
            params![domain],
        )?;
        if 0 == n {
            return Err(Error::NxDomain);
        }
        Ok(())
    }

    pub fn list_domains(&self) -> Result<Vec<DomainRecord>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT domain, active FROM domains ORDER BY domain",
        )?;
        let domains = stmt
            .query_map([], |row| {
                Ok(DomainRecord {
                    domain: row.get(0)?,
                    active: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(domains)
    }

    pub fn create_user(
        &self,
        local: &str,
        domain: &str,
        password: &str,
        quota_bytes: i64,
    ) -> Result<(), Error> {
        let hash = password::hash_password(password)?;
        let conn = self.conn.lock().unwrap();

        // The domain row is created on demand so that `user add` on a fresh
        // system is a single step.
        conn.execute(
            "INSERT OR IGNORE INTO domains (domain) VALUES (?1)",
            params![domain],
        )?;

        let result = conn.execute(
            "INSERT INTO users (username, domain, password_hash, quota_bytes) \
             VALUES (?1, ?2, ?3, ?4)",
            params![local, domain, hash, quota_bytes],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if rusqlite::ErrorCode::ConstraintViolation == e.code =>
            {
                Err(Error::UserExists)
            },
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_user(&self, local: &str, domain: &str) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM users WHERE username = ?1 AND domain = ?2",
            params![local, domain],
        )?;
        if 0 == n {
            return Err(Error::NxUser);
        }
        Ok(())
    }

    pub fn set_password(
        &self,
        local: &str,
        domain: &str,
        password: &str,
    ) -> Result<(), Error> {
        let hash = password::hash_password(password)?;
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE users SET password_hash = ?1 \
             WHERE username = ?2 AND domain = ?3",
            params![hash, local, domain],
        )?;
        if 0 == n {
            return Err(Error::NxUser);
        }
        Ok(())
    }

    pub fn set_quota(
        &self,
        local: &str,
        domain: &str,
        quota_bytes: i64,
    ) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE users SET quota_bytes = ?1 \
             WHERE username = ?2 AND domain = ?3",
            params![quota_bytes, local, domain],
        )?;
        if 0 == n {
            return Err(Error::NxUser);
        }
        Ok(())
    }

    /// Record a change in the user's on-disk usage.
    ///
    /// Usage is tracked but never enforced at delivery time.
    pub fn add_used_bytes(
        &self,
        local: &str,
        domain: &str,
        delta: i64,
    ) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET used_bytes = MAX(0, used_bytes + ?1) \
             WHERE username = ?2 AND domain = ?3",
            params![delta, local, domain],
        )?;
        Ok(())
    }

    pub fn get_user(
        &self,
        local: &str,
        domain: &str,
    ) -> Result<Option<UserRecord>, Error> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                "SELECT username, domain, quota_bytes, used_bytes, active, \
                 created_at FROM users WHERE username = ?1 AND domain = ?2",
                params![local, domain],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(
        &self,
        domain: Option<&str>,
    ) -> Result<Vec<UserRecord>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut users = Vec::new();

        if let Some(domain) = domain {
            let mut stmt = conn.prepare(
                "SELECT username, domain, quota_bytes, used_bytes, active, \
                 created_at FROM users WHERE domain = ?1 \
                 ORDER BY domain, username",
            )?;
            for user in stmt.query_map(params![domain], user_from_row)? {
                users.push(user?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT username, domain, quota_bytes, used_bytes, active, \
                 created_at FROM users ORDER BY domain, username",
            )?;
            for user in stmt.query_map([], user_from_row)? {
                users.push(user?);
            }
        }

        Ok(users)
    }
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        local: row.get(0)?,
        domain: row.get(1)?,
        quota_bytes: row.get(2)?,
        used_bytes: row.get(3)?,
        active: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    fn open_store() -> (TempDir, DirectoryStore) {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::open(&dir.path().join("users.sqlite"))
            .unwrap();
        (dir, store)
    }

    #[test]
    fn user_lifecycle() {
        let (_dir, store) = open_store();

        assert!(!store.authenticate("azure@example.com", "hunter2"));
        assert!(!store.user_exists("azure", "example.com"));
        assert!(!store.is_local_domain("example.com"));

        store
            .create_user("azure", "example.com", "hunter2", 1024)
            .unwrap();

        assert!(store.is_local_domain("example.com"));
        assert!(store.user_exists("azure", "example.com"));
        assert!(store.authenticate("azure@example.com", "hunter2"));
        assert!(!store.authenticate("azure@example.com", "hunter3"));
        assert!(!store.authenticate("azure@other.com", "hunter2"));

        assert_matches!(
            Err(Error::UserExists),
            store.create_user("azure", "example.com", "x", 1024)
        );

        store.set_password("azure", "example.com", "swordfish").unwrap();
        assert!(!store.authenticate("azure@example.com", "hunter2"));
        assert!(store.authenticate("azure@example.com", "swordfish"));

        let user = store.get_user("azure", "example.com").unwrap().unwrap();
        assert_eq!(1024, user.quota_bytes);
        assert_eq!(0, user.used_bytes);
        assert!(user.active);

        store.add_used_bytes("azure", "example.com", 300).unwrap();
        store.add_used_bytes("azure", "example.com", -100).unwrap();
        let user = store.get_user("azure", "example.com").unwrap().unwrap();
        assert_eq!(200, user.used_bytes);

        store.delete_user("azure", "example.com").unwrap();
        assert!(!store.user_exists("azure", "example.com"));
        assert_matches!(
            Err(Error::NxUser),
            store.delete_user("azure", "example.com")
        );
        // The domain survives its last user
        assert!(store.is_local_domain("example.com"));
    }

    #[test]
    fn domain_lifecycle() {
        let (_dir, store) = open_store();

        store.create_domain("example.com").unwrap();
        assert_matches!(
            Err(Error::DomainExists),
            store.create_domain("example.com")
        );
        assert!(store.is_local_domain("example.com"));

        store.create_user("zim", "example.com", "x", 1).unwrap();
        store.create_domain("other.org").unwrap();
        let domains = store.list_domains().unwrap();
        assert_eq!(2, domains.len());
        assert_eq!("example.com", domains[0].domain);

        // Deleting the domain cascades to its users
        store.delete_domain("example.com").unwrap();
        assert!(!store.user_exists("zim", "example.com"));
        assert_matches!(Err(Error::NxDomain), store.delete_domain("example.com"));
    }

    #[test]
    fn list_users_filters_by_domain() {
        let (_dir, store) = open_store();
        store.create_user("a", "one.com", "x", 1).unwrap();
        store.create_user("b", "one.com", "x", 1).unwrap();
        store.create_user("c", "two.com", "x", 1).unwrap();

        assert_eq!(3, store.list_users(None).unwrap().len());
        let one = store.list_users(Some("one.com")).unwrap();
        assert_eq!(2, one.len());
        assert_eq!("a", one[0].local);
    }

    #[test]
    fn default_quota_constants_agree() {
        assert_eq!(
            Ok(DEFAULT_QUOTA_BYTES),
            DEFAULT_QUOTA_BYTES_STR.parse::<i64>()
        );
    }

    #[test]
    fn parse_userid_splits() {
        assert_eq!(("user", "example.com"), parse_userid("user@example.com"));
        assert_eq!(("user", ""), parse_userid("user"));
        assert_eq!(("", "example.com"), parse_userid("@example.com"));
    }
}
