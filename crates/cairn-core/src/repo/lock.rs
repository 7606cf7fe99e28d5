use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use cairn_types::{CairnError, Result};

use crate::backend::Distributor;

const STALE_LOCK_SECS: i64 = 6 * 60 * 60;

/// Advisory lock payload identifying the holder.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockEntry {
    pub hostname: String,
    pub pid: u32,
    pub time: DateTime<Utc>,
}

impl LockEntry {
    fn current() -> Self {
        Self {
            hostname: hostname(),
            pid: std::process::id(),
            time: Utc::now(),
        }
    }

    fn is_stale(&self) -> bool {
        Utc::now() - self.time > Duration::seconds(STALE_LOCK_SECS)
    }

    fn describe(&self) -> String {
        format!("{}:{} since {}", self.hostname, self.pid, self.time.to_rfc3339())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Acquire the advisory repository lock on all backends. A lock left
/// behind by a killed process is broken once it is older than six
/// hours; a live lock fails with `Locked`.
pub fn acquire(distributor: &Distributor) -> Result<()> {
    let payload = rmp_serde::to_vec(&LockEntry::current())?;
    match distributor.lock_repository(&payload)? {
        None => Ok(()),
        Some(existing) => {
            let holder: LockEntry = rmp_serde::from_slice(&existing)
                .map_err(|_| CairnError::Locked("unreadable lock entry".into()))?;
            if !holder.is_stale() {
                return Err(CairnError::Locked(holder.describe()));
            }
            warn!(holder = holder.describe(), "breaking stale repository lock");
            distributor.unlock_repository()?;
            match distributor.lock_repository(&payload)? {
                None => Ok(()),
                Some(other) => {
                    let holder: LockEntry = rmp_serde::from_slice(&other)
                        .map_err(|_| CairnError::Locked("unreadable lock entry".into()))?;
                    Err(CairnError::Locked(holder.describe()))
                }
            }
        }
    }
}

pub fn release(distributor: &Distributor) -> Result<()> {
    distributor.unlock_repository()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::testutil::MemoryBackend;

    fn distributor() -> (MemoryBackend, Distributor) {
        let memory = MemoryBackend::new("mem");
        let dist =
            Distributor::new(vec![Box::new(memory.clone()) as Box<dyn Backend>]).unwrap();
        (memory, dist)
    }

    #[test]
    fn acquire_and_release() {
        let (_memory, dist) = distributor();
        acquire(&dist).unwrap();
        release(&dist).unwrap();
        acquire(&dist).unwrap();
    }

    #[test]
    fn live_lock_blocks_second_acquire() {
        let (_memory, dist) = distributor();
        acquire(&dist).unwrap();
        assert!(matches!(acquire(&dist).unwrap_err(), CairnError::Locked(_)));
    }

    #[test]
    fn stale_lock_is_broken() {
        let (memory, dist) = distributor();
        let stale = LockEntry {
            hostname: "gone".into(),
            pid: 1,
            time: Utc::now() - Duration::seconds(STALE_LOCK_SECS + 60),
        };
        memory
            .lock_repository(&rmp_serde::to_vec(&stale).unwrap())
            .unwrap();

        acquire(&dist).unwrap();
    }
}
