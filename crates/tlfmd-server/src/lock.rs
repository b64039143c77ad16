//! Lease-based folder locks.
//!
//! A record lives until its holder releases it or it expires. Replacing or
//! removing a record drops its `watch::Sender`, which is what wakes tasks
//! waiting in GetRange/Lock.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tlfmd_core::{LockId, TlfId};
use uuid::Uuid;

struct LockRecord {
    expires_at: SystemTime,
    holder: Uuid,
    released: watch::Sender<()>,
}

/// Handed to a caller that must wait for another holder.
#[derive(Debug)]
pub(crate) struct LockWait {
    pub released: watch::Receiver<()>,
    pub expires_at: SystemTime,
}

#[derive(Default)]
pub(crate) struct LockTable {
    locks: HashMap<(TlfId, LockId), LockRecord>,
}

impl LockTable {
    /// Live lock held by `holder`.
    pub fn is_held_by(&self, tlf: TlfId, lock_id: LockId, holder: Uuid, now: SystemTime) -> bool {
        self.locks
            .get(&(tlf, lock_id))
            .map(|r| r.expires_at > now && r.holder == holder)
            .unwrap_or(false)
    }

    /// Take the lock for `holder`, or return what to wait on.
    ///
    /// Re-acquiring a lock already held by `holder` succeeds without
    /// extending its lease.
    pub fn acquire(
        &mut self,
        tlf: TlfId,
        lock_id: LockId,
        holder: Uuid,
        now: SystemTime,
        ttl: Duration,
    ) -> Option<LockWait> {
        let key = (tlf, lock_id);
        match self.locks.get(&key) {
            Some(r) if r.expires_at > now => {
                if r.holder == holder {
                    None
                } else {
                    Some(LockWait {
                        released: r.released.subscribe(),
                        expires_at: r.expires_at,
                    })
                }
            }
            _ => {
                let (released, _) = watch::channel(());
                // Dropping an expired record's sender wakes its waiters.
                self.locks.insert(
                    key,
                    LockRecord {
                        expires_at: now + ttl,
                        holder,
                        released,
                    },
                );
                None
            }
        }
    }

    /// Release if `holder` owns the record. Returns whether anything was
    /// released.
    pub fn release(&mut self, tlf: TlfId, lock_id: LockId, holder: Uuid) -> bool {
        let key = (tlf, lock_id);
        match self.locks.get(&key) {
            Some(r) if r.holder == holder => {
                self.locks.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.locks.clear();
    }
}
