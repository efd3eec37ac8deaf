//! SQLite-backed realization of the key-value store: the session store,
//! the user-token index, and transient login state. Multi-key writes that
//! must be pipelined into one transaction share a single `rusqlite`
//! transaction run inside `spawn_blocking`.

pub mod models;

use anyhow::{Context, Result};
use refinery::Runner;
use refinery::embed_migrations;
use rusqlite::{Connection, params};

embed_migrations!("migrations/sqlite");

#[cfg(unix)]
use fs2::FileExt;
#[cfg(unix)]
use std::fs::OpenOptions;
#[cfg(unix)]
use std::time::Instant;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

#[cfg(windows)]
use std::ffi::OsStr;
#[cfg(windows)]
use std::os::windows::ffi::OsStrExt;

use tokio::task;

use crate::crypto;
use crate::handle::Handle;
use crate::utility::{set_secure_dir_permissions, set_secure_file_permissions};
pub use models::{LoginState, SessionRecord, TokenIndexEntry};

#[cfg(windows)]
mod windows_lock {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Threading::{CreateMutexW, ReleaseMutex, WaitForSingleObject};
    use windows::core::PCWSTR;

    pub struct NamedMutexGuard(HANDLE);

    impl Drop for NamedMutexGuard {
        fn drop(&mut self) {
            unsafe {
                let _ = ReleaseMutex(self.0);
                let _ = CloseHandle(self.0);
            }
        }
    }

    fn mutex_name_from_lock_path(lock_path: &Path) -> String {
        let mut hasher = Sha256::new();
        hasher.update(lock_path.to_string_lossy().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("Global\\gafaelfawr_migrate_{}", digest)
    }

    pub fn acquire(lock_path: &Path, timeout: Duration) -> anyhow::Result<NamedMutexGuard> {
        let name = mutex_name_from_lock_path(lock_path);
        let wide: Vec<u16> = OsStr::new(&name)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let pcw = PCWSTR(wide.as_ptr());

        unsafe {
            let handle = CreateMutexW(None, false, pcw)?;
            let ms: u32 = match timeout.as_millis().try_into() {
                Ok(v) => v,
                Err(_) => u32::MAX,
            };
            let wait = WaitForSingleObject(handle, ms);
            let wait_val: u32 = wait.0 as u32;
            if wait_val == 0 {
                return Ok(NamedMutexGuard(handle));
            }
            let _ = CloseHandle(handle);
            if wait_val == 0x102 {
                return Err(anyhow::anyhow!("timeout waiting for named mutex"));
            }
            Err(anyhow::anyhow!(
                "waiting for named mutex failed: {}",
                wait_val
            ))
        }
    }
}

/// Opens a lock file with retry logic for Unix systems.
#[cfg(unix)]
fn open_lock_file_with_retry(lock_path: &Path, timeout: Duration) -> anyhow::Result<std::fs::File> {
    use std::thread::sleep;

    let start = Instant::now();
    loop {
        match OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(lock_path)
        {
            Ok(f) => match f.try_lock_exclusive() {
                Ok(()) => return Ok(f),
                Err(_) => {
                    if start.elapsed() > timeout {
                        return Err(anyhow::anyhow!(
                            "timeout acquiring migration lock {}: {}",
                            lock_path.display(),
                            timeout.as_secs()
                        ));
                    }
                    sleep(Duration::from_millis(100));
                }
            },
            Err(e) => {
                if start.elapsed() > timeout {
                    return Err(anyhow::anyhow!(
                        "timeout opening migration lock file {}: {}",
                        lock_path.display(),
                        e
                    ));
                }
                tracing::debug!(
                    "open migration lock {} failed (will retry): {}",
                    lock_path.display(),
                    e
                );
                sleep(Duration::from_millis(100));
            }
        }
    }
}

#[cfg(windows)]
type LockGuard = windows_lock::NamedMutexGuard;
#[cfg(unix)]
type LockGuard = (std::fs::File, PathBuf);

/// Unified cross-platform migration lock guard.
struct MigrationLockGuard(LockGuard);

fn open_db_connection(db_path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening sqlite db at {}", db_path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "busy_timeout", 5000i64).ok();
    Ok(conn)
}

impl MigrationLockGuard {
    fn new(lock_path: &Path, timeout: Duration) -> anyhow::Result<Self> {
        #[cfg(windows)]
        {
            let guard = windows_lock::acquire(lock_path, timeout)
                .with_context(|| format!("acquiring named mutex for {}", lock_path.display()))?;
            tracing::debug!("Acquired Windows named-mutex for {}", lock_path.display());
            Ok(MigrationLockGuard(guard))
        }
        #[cfg(unix)]
        {
            let file = open_lock_file_with_retry(lock_path, timeout)?;
            tracing::debug!("Acquired Unix file lock for {}", lock_path.display());
            Ok(MigrationLockGuard((file, lock_path.to_path_buf())))
        }
    }
}

impl Drop for MigrationLockGuard {
    fn drop(&mut self) {
        #[cfg(windows)]
        {
            // NamedMutexGuard handles cleanup on drop.
        }
        #[cfg(unix)]
        {
            let (file, path) = &self.0;
            let _ = file.unlock();
            let _ = fs::remove_file(path);
        }
    }
}

fn apply_migrations(db_path: &Path, migrations_dir: Option<&str>) -> anyhow::Result<()> {
    if let Some(dir) = migrations_dir {
        let dir_path = PathBuf::from(dir);
        if !dir_path.exists() {
            tracing::warn!(
                "GAFAELFAWR_MIGRATIONS_DIR {} does not exist; skipping filesystem migrations",
                dir_path.display()
            );
            return Ok(());
        }

        tracing::info!("Applying filesystem migrations from {}", dir);
        let migrations = refinery::load_sql_migrations(&dir_path)
            .with_context(|| format!("loading migrations from {}", dir_path.display()))?;

        let mut conn = open_db_connection(db_path)?;
        let runner = Runner::new(&migrations)
            .set_abort_divergent(true)
            .set_abort_missing(true);
        runner
            .run(&mut conn)
            .with_context(|| "applying filesystem migrations via refinery")?;
    } else {
        tracing::info!("Applying embedded refinery migrations");
        let mut conn = open_db_connection(db_path)?;
        migrations::runner()
            .run(&mut conn)
            .with_context(|| "applying embedded migrations")?;
    }
    Ok(())
}

/// SQLite-backed key-value store handle.
#[derive(Clone, Debug)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    pub fn new() -> Result<Self> {
        let path = resolve_db_path()?;
        Self::with_path(path)
    }

    pub fn with_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tracing::debug!("Initializing store at path: {}", path.display());
        ensure_parent_dir(&path)?;
        let store = Self { db_path: path.clone() };
        store.run_bootstrap_migrations()?;

        if path.exists() {
            set_secure_file_permissions(&path).with_context(|| {
                format!("setting secure permissions on database file {}", path.display())
            })?;
        }
        Ok(store)
    }

    fn run_bootstrap_migrations(&self) -> Result<()> {
        let auto =
            std::env::var("GAFAELFAWR_AUTO_APPLY_MIGRATIONS").unwrap_or_else(|_| "true".into());
        if auto.to_lowercase() == "false" {
            tracing::info!(
                "Automatic migration application disabled via GAFAELFAWR_AUTO_APPLY_MIGRATIONS"
            );
            return Ok(());
        }

        let _guard = MigrationLockGuard::new(
            &self.db_path.with_extension("migrate.lock"),
            Duration::from_secs(30),
        )?;
        let migrations_dir = std::env::var("GAFAELFAWR_MIGRATIONS_DIR").ok();
        apply_migrations(&self.db_path, migrations_dir.as_deref())?;
        Ok(())
    }

    // ---------------- Session store  ----------------

    /// `store(session, handle)`. Seals the record with `handle.secret` and
    /// upserts it keyed by `handle.key`. A non-positive TTL is a no-op
    /// returning success.
    pub async fn store_session(&self, handle: &Handle, record: SessionRecord, now: i64) -> Result<()> {
        let ttl = record.expires_on - now;
        if ttl <= 0 {
            return Ok(());
        }
        let db_path = self.db_path.clone();
        let key = handle.key.clone();
        let secret = handle.secret.clone();
        let payload = serde_json::to_vec(&record)?;
        let sealed = crypto::seal(secret.as_bytes(), &payload)
            .map_err(|e| anyhow::anyhow!("sealing session record: {e}"))?;
        let expiry_epoch = record.expires_on;

        task::spawn_blocking(move || -> Result<()> {
            let conn = open_db_connection(&db_path)?;
            conn.execute(
                r#"
                INSERT INTO sessions(handle_key, sealed_payload, expiry_epoch)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(handle_key) DO UPDATE SET
                    sealed_payload = excluded.sealed_payload,
                    expiry_epoch = excluded.expiry_epoch
                "#,
                params![key, sealed, expiry_epoch],
            )?;
            Ok(())
        })
        .await?
    }

    /// `get(handle)`. Returns `None` on missing key, decrypt failure, or
    /// corrupt JSON — callers must not distinguish these cases.
    pub async fn get_session(&self, handle: &Handle) -> Result<Option<SessionRecord>> {
        let db_path = self.db_path.clone();
        let key = handle.key.clone();
        let secret = handle.secret.clone();

        let sealed: Option<String> = task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = open_db_connection(&db_path)?;
            let mut stmt =
                conn.prepare(r#"SELECT sealed_payload FROM sessions WHERE handle_key = ?1"#)?;
            match stmt.query_row(params![key], |row| row.get::<_, String>(0)) {
                Ok(v) => Ok(Some(v)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await??;

        let Some(sealed) = sealed else {
            return Ok(None);
        };
        let Ok(plaintext) = crypto::open(secret.as_bytes(), &sealed) else {
            return Ok(None);
        };
        Ok(serde_json::from_slice(&plaintext).ok())
    }

    /// `delete(handle)`.
    pub async fn delete_session(&self, handle_key: &str) -> Result<bool> {
        let db_path = self.db_path.clone();
        let key = handle_key.to_string();
        task::spawn_blocking(move || -> Result<bool> {
            let conn = open_db_connection(&db_path)?;
            let n = conn.execute(
                r#"DELETE FROM sessions WHERE handle_key = ?1"#,
                params![key],
            )?;
            Ok(n > 0)
        })
        .await?
    }

    /// Cheap liveness probe for `/readyz`: opens a connection and runs a
    /// trivial query, without touching any table's contents.
    pub async fn is_healthy(&self) -> bool {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = open_db_connection(&db_path)?;
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
        .is_ok_and(|r| r.is_ok())
    }

    /// Periodic sweep: removes sessions whose `expiry_epoch` has passed.
    pub async fn cleanup_expired_sessions(&self, now: i64) -> Result<usize> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<usize> {
            let conn = open_db_connection(&db_path)?;
            let n = conn.execute(
                r#"DELETE FROM sessions WHERE expiry_epoch <= ?1"#,
                params![now],
            )?;
            Ok(n)
        })
        .await?
    }

    // ---------------- User-token index  ----------------

    /// Pipelined write: stores the session record and adds the user-token
    /// index entry in a single transaction, satisfying the "store session +
    /// add to user index" atomicity requirement.
    pub async fn issue_and_index(
        &self,
        uid: &str,
        handle: &Handle,
        record: SessionRecord,
        entry: TokenIndexEntry,
    ) -> Result<()> {
        let db_path = self.db_path.clone();
        let uid = uid.to_string();
        let key = handle.key.clone();
        let secret = handle.secret.clone();
        let payload = serde_json::to_vec(&record)?;
        let sealed = crypto::seal(secret.as_bytes(), &payload)
            .map_err(|e| anyhow::anyhow!("sealing session record: {e}"))?;
        let expiry_epoch = record.expires_on;

        task::spawn_blocking(move || -> Result<()> {
            let mut conn = open_db_connection(&db_path)?;
            let txn = conn.transaction()?;
            txn.execute(
                r#"
                INSERT INTO sessions(handle_key, sealed_payload, expiry_epoch)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(handle_key) DO UPDATE SET
                    sealed_payload = excluded.sealed_payload,
                    expiry_epoch = excluded.expiry_epoch
                "#,
                params![key, sealed, expiry_epoch],
            )?;
            txn.execute(
                r#"
                INSERT INTO user_tokens(uid, handle_key, scope, created_epoch, expiry_epoch)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(uid, handle_key) DO UPDATE SET
                    scope = excluded.scope,
                    expiry_epoch = excluded.expiry_epoch
                "#,
                params![uid, entry.handle_key, entry.scope, entry.created, entry.expires],
            )?;
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    /// `get_all(uid)`.
    pub async fn get_all_tokens(&self, uid: &str) -> Result<Vec<TokenIndexEntry>> {
        let db_path = self.db_path.clone();
        let uid = uid.to_string();
        task::spawn_blocking(move || -> Result<Vec<TokenIndexEntry>> {
            let conn = open_db_connection(&db_path)?;
            let mut stmt = conn.prepare(
                r#"SELECT handle_key, scope, created_epoch, expiry_epoch FROM user_tokens WHERE uid = ?1 ORDER BY created_epoch DESC"#,
            )?;
            let mut out = Vec::new();
            let mut rows = stmt.query(params![uid])?;
            while let Some(row) = rows.next()? {
                out.push(TokenIndexEntry {
                    handle_key: row.get(0)?,
                    scope: row.get(1)?,
                    created: row.get(2)?,
                    expires: row.get(3)?,
                });
            }
            Ok(out)
        })
        .await?
    }

    /// `revoke(uid, handle_key, txn)`. Authoritative: removes both the index
    /// entry and the session record in one transaction.
    pub async fn revoke_token(&self, uid: &str, handle_key: &str) -> Result<bool> {
        let db_path = self.db_path.clone();
        let uid = uid.to_string();
        let handle_key = handle_key.to_string();
        task::spawn_blocking(move || -> Result<bool> {
            let mut conn = open_db_connection(&db_path)?;
            let txn = conn.transaction()?;
            let removed = txn.execute(
                r#"DELETE FROM user_tokens WHERE uid = ?1 AND handle_key = ?2"#,
                params![uid, handle_key],
            )?;
            if removed > 0 {
                txn.execute(
                    r#"DELETE FROM sessions WHERE handle_key = ?1"#,
                    params![handle_key],
                )?;
            }
            txn.commit()?;
            Ok(removed > 0)
        })
        .await?
    }

    /// `expire(uid)`. Idempotent sweep removing index entries whose session
    /// has expired or no longer exists.
    pub async fn expire_tokens(&self, uid: &str, now: i64) -> Result<usize> {
        let db_path = self.db_path.clone();
        let uid = uid.to_string();
        task::spawn_blocking(move || -> Result<usize> {
            let conn = open_db_connection(&db_path)?;
            let n = conn.execute(
                r#"
                DELETE FROM user_tokens
                WHERE uid = ?1
                  AND (
                      expiry_epoch <= ?2
                      OR handle_key NOT IN (SELECT handle_key FROM sessions)
                  )
                "#,
                params![uid, now],
            )?;
            Ok(n)
        })
        .await?
    }

    // ---------------- Login transient state (part of C9) ----------------

    pub async fn put_login_state(&self, state: &str, record: LoginState, ttl_secs: i64, now: i64) -> Result<()> {
        let db_path = self.db_path.clone();
        let state = state.to_string();
        let expiry_epoch = now + ttl_secs;
        task::spawn_blocking(move || -> Result<()> {
            let conn = open_db_connection(&db_path)?;
            conn.execute(
                r#"
                INSERT INTO login_state(state, return_url, pkce_verifier, created_epoch, expiry_epoch)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(state) DO UPDATE SET
                    return_url = excluded.return_url,
                    pkce_verifier = excluded.pkce_verifier,
                    created_epoch = excluded.created_epoch,
                    expiry_epoch = excluded.expiry_epoch
                "#,
                params![state, record.return_url, record.pkce_verifier, record.created_at, expiry_epoch],
            )?;
            Ok(())
        })
        .await?
    }

    /// Single-use: deletes the state row as part of the same lookup.
    pub async fn take_login_state(&self, state: &str, now: i64) -> Result<Option<LoginState>> {
        let db_path = self.db_path.clone();
        let state = state.to_string();
        task::spawn_blocking(move || -> Result<Option<LoginState>> {
            let mut conn = open_db_connection(&db_path)?;
            let txn = conn.transaction()?;
            let row: Option<(String, Option<String>, i64, i64)> = match txn.query_row(
                r#"SELECT return_url, pkce_verifier, created_epoch, expiry_epoch FROM login_state WHERE state = ?1"#,
                params![state],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            ) {
                Ok(v) => Some(v),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };
            txn.execute(r#"DELETE FROM login_state WHERE state = ?1"#, params![state])?;
            txn.commit()?;

            Ok(row.and_then(|(return_url, pkce_verifier, created_at, expiry_epoch)| {
                if expiry_epoch <= now {
                    None
                } else {
                    Some(LoginState { return_url, pkce_verifier, created_at })
                }
            }))
        })
        .await?
    }
}

fn resolve_db_path() -> Result<PathBuf> {
    if let Ok(p) = env::var("GAFAELFAWR_DB_PATH") {
        return Ok(PathBuf::from(p));
    }

    #[cfg(target_os = "windows")]
    {
        let program_data =
            env::var("PROGRAMDATA").unwrap_or_else(|_| r"C:\ProgramData".to_string());
        Ok(Path::new(&program_data).join("gafaelfawr").join("gafaelfawr.db"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        Ok(PathBuf::from("/var/gafaelfawr/gafaelfawr.db"))
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating parent dir {}", parent.display()))?;

        let test_file = parent.join(".gafaelfawr_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&test_file)
        {
            Ok(mut f) => {
                use std::io::Write;
                if let Err(e) = f.write_all(b"ok") {
                    let _ = std::fs::remove_file(&test_file);
                    return Err(anyhow::anyhow!(
                        "parent dir not writable {}: {}",
                        parent.display(),
                        e
                    ));
                }
                let _ = std::fs::remove_file(&test_file);
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "parent dir not writable {}: {}",
                    parent.display(),
                    e
                ));
            }
        }

        if let Err(e) = set_secure_dir_permissions(parent) {
            return Err(anyhow::anyhow!(
                "setting secure permissions on {}: {}",
                parent.display(),
                e
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.db");
        let store = Store::with_path(&path).expect("store");
        (store, dir)
    }

    #[tokio::test]
    async fn session_round_trips_with_matching_secret() {
        let (store, _dir) = temp_store();
        let handle = Handle::new();
        let now = 1_700_000_000;
        let record = SessionRecord::new("encoded-jwt", Some("user@example.com".into()), now, now + 3600);
        store.store_session(&handle, record.clone(), now).await.unwrap();

        let fetched = store.get_session(&handle).await.unwrap();
        assert_eq!(fetched, Some(record));
    }

    #[tokio::test]
    async fn session_get_returns_none_for_tampered_secret() {
        let (store, _dir) = temp_store();
        let handle = Handle::new();
        let now = 1_700_000_000;
        let record = SessionRecord::new("encoded-jwt", None, now, now + 3600);
        store.store_session(&handle, record, now).await.unwrap();

        let mut tampered = handle.clone();
        tampered.secret = Handle::new().secret;
        let fetched = store.get_session(&tampered).await.unwrap();
        assert_eq!(fetched, None);
    }

    #[tokio::test]
    async fn store_is_noop_for_already_expired_session() {
        let (store, _dir) = temp_store();
        let handle = Handle::new();
        let now = 1_700_000_000;
        let record = SessionRecord::new("encoded-jwt", None, now - 10, now - 1);
        store.store_session(&handle, record, now).await.unwrap();
        assert_eq!(store.get_session(&handle).await.unwrap(), None);
    }

    #[tokio::test]
    async fn revoke_removes_index_and_session() {
        let (store, _dir) = temp_store();
        let handle = Handle::new();
        let now = 1_700_000_000;
        let record = SessionRecord::new("encoded-jwt", None, now, now + 3600);
        let entry = TokenIndexEntry {
            handle_key: handle.key.clone(),
            scope: "read:all".into(),
            created: now,
            expires: now + 3600,
        };
        store.issue_and_index("uid-1", &handle, record, entry).await.unwrap();

        assert_eq!(store.get_all_tokens("uid-1").await.unwrap().len(), 1);
        let revoked = store.revoke_token("uid-1", &handle.key).await.unwrap();
        assert!(revoked);
        assert!(store.get_all_tokens("uid-1").await.unwrap().is_empty());
        assert_eq!(store.get_session(&handle).await.unwrap(), None);
    }

    #[tokio::test]
    async fn login_state_is_single_use() {
        let (store, _dir) = temp_store();
        let now = 1_700_000_000;
        let state = LoginState {
            return_url: "https://example.com/".into(),
            pkce_verifier: None,
            created_at: now,
        };
        store.put_login_state("state-abc", state.clone(), 900, now).await.unwrap();

        let first = store.take_login_state("state-abc", now).await.unwrap();
        assert_eq!(first, Some(state));
        let second = store.take_login_state("state-abc", now).await.unwrap();
        assert_eq!(second, None);
    }
}
