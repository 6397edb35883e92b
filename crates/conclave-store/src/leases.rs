use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, OptionalExtension};

use conclave_core::error::{ConclaveError, Result};

use crate::db::{db_err, fmt_ts, now, Database};

/// The lease held by the process that executes agents and workflows.
pub const EXECUTION_LEASE: &str = "execution";

/// Named, expiring ownership rows. A holder keeps its lease by renewing it
/// before `expires_at`; an expired lease can be taken by anyone.
#[derive(Clone)]
pub struct LeaseStore {
    db: Arc<Database>,
}

impl LeaseStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Take `name` for `holder` if it is free, expired, or already held by
    /// `holder`. Returns whether `holder` owns it afterwards.
    pub fn acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = now();
        let expires_at = now + to_chrono(ttl)?;
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "INSERT INTO leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE
                    SET holder = excluded.holder, expires_at = excluded.expires_at
                  WHERE leases.expires_at < ?4 OR leases.holder = excluded.holder",
                params![name, holder, fmt_ts(&expires_at), fmt_ts(&now)],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Push the expiry forward. False when `holder` no longer owns `name`.
    pub fn renew(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let expires_at = now() + to_chrono(ttl)?;
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "UPDATE leases SET expires_at = ?3 WHERE name = ?1 AND holder = ?2",
                params![name, holder, fmt_ts(&expires_at)],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    pub fn release(&self, name: &str, holder: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "DELETE FROM leases WHERE name = ?1 AND holder = ?2",
                params![name, holder],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Current holder, expired or not.
    pub fn holder(&self, name: &str) -> Result<Option<String>> {
        let conn = self.db.conn()?;
        conn.query_row(
            "SELECT holder FROM leases WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }
}

fn to_chrono(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl).map_err(|e| ConclaveError::Database(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LeaseStore {
        LeaseStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn test_live_lease_is_exclusive() {
        let leases = store();
        let ttl = Duration::from_secs(60);
        assert!(leases.acquire(EXECUTION_LEASE, "p1", ttl).unwrap());
        assert!(!leases.acquire(EXECUTION_LEASE, "p2", ttl).unwrap());
        // Re-acquiring your own lease is a renewal
        assert!(leases.acquire(EXECUTION_LEASE, "p1", ttl).unwrap());
        assert_eq!(leases.holder(EXECUTION_LEASE).unwrap().as_deref(), Some("p1"));

        assert!(!leases.renew(EXECUTION_LEASE, "p2", ttl).unwrap());
        assert!(leases.renew(EXECUTION_LEASE, "p1", ttl).unwrap());
    }

    #[test]
    fn test_expired_lease_can_be_taken() {
        let leases = store();
        assert!(leases.acquire(EXECUTION_LEASE, "p1", Duration::ZERO).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(leases.acquire(EXECUTION_LEASE, "p2", Duration::from_secs(60)).unwrap());
        assert_eq!(leases.holder(EXECUTION_LEASE).unwrap().as_deref(), Some("p2"));
        assert!(!leases.renew(EXECUTION_LEASE, "p1", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_release_frees_the_lease() {
        let leases = store();
        let ttl = Duration::from_secs(60);
        leases.acquire(EXECUTION_LEASE, "p1", ttl).unwrap();
        assert!(!leases.release(EXECUTION_LEASE, "p2").unwrap());
        assert!(leases.release(EXECUTION_LEASE, "p1").unwrap());
        assert!(leases.holder(EXECUTION_LEASE).unwrap().is_none());
        assert!(leases.acquire(EXECUTION_LEASE, "p2", ttl).unwrap());
    }
}
