//! Top-level transaction boundary for graph writes.

use tracing::{debug, warn};

use crate::session::SqlSession;
use crate::Result;

/// Commit/rollback scope around one top-level save or delete.
///
/// A session already in manual-commit mode belongs to the caller: the scope
/// then neither commits nor rolls back.
#[derive(Debug)]
#[must_use = "a transaction scope must be finished"]
pub struct TransactionScope {
    owned: bool,
}

impl TransactionScope {
    /// Switches auto-commit off when it was on.
    pub async fn begin(session: &mut dyn SqlSession) -> Result<Self> {
        let owned = session.auto_commit();
        if owned {
            session.set_auto_commit(false).await?;
            debug!("Transaction scope opened");
        }
        Ok(Self { owned })
    }

    /// True when this scope opened the transaction.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Commits on `Ok`, rolls back on `Err`, and restores auto-commit.
    ///
    /// A failed rollback is logged and the original error is returned.
    pub async fn finish<T>(self, session: &mut dyn SqlSession, result: Result<T>) -> Result<T> {
        if !self.owned {
            return result;
        }

        let outcome = match result {
            Ok(value) => match session.commit().await {
                Ok(()) => Ok(value),
                Err(e) => {
                    if let Err(rollback_err) = session.rollback().await {
                        warn!(error = %rollback_err, "Rollback after failed commit failed");
                    }
                    Err(e)
                }
            },
            Err(e) => {
                debug!(error = %e, "Rolling back transaction");
                if let Err(rollback_err) = session.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        };

        let restored = session.set_auto_commit(true).await;
        match (outcome, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(restore_err)) => {
                warn!(error = %restore_err, "Failed to restore auto-commit");
                Err(e)
            }
        }
    }
}
