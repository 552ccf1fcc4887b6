use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::domain::UserId;

use super::AppError;

/// Per-user write sections.
///
/// Every operation that changes a user's balance holds that user's lock from
/// the funds check until the write is committed. Locks for several users are
/// always taken in ascending id order, so two opposite transfers cannot
/// deadlock. Reads never go through here.
///
/// Only users with a held or awaited section have an entry; idle entries are
/// pruned when the last section is released.
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

/// Held write sections. Released on drop.
#[derive(Debug)]
pub struct WriteSection<'a> {
    locks: &'a UserLocks,
    guards: Vec<(UserId, OwnedMutexGuard<()>)>,
}

impl Drop for WriteSection<'_> {
    fn drop(&mut self) {
        for (user_id, guard) in self.guards.drain(..).rev() {
            drop(guard);
            self.locks.prune(user_id);
        }
    }
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.locks.entry(user_id).or_default().value().clone()
    }

    /// Drop the entry of `user_id` if nobody holds or awaits it.
    /// The shard lock makes the count check and the removal one step.
    fn prune(&self, user_id: UserId) {
        self.locks
            .remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of users with a tracked lock.
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }

    /// Acquire the write sections of all `users`, waiting at most `timeout` in total.
    pub async fn acquire(
        &self,
        users: &[UserId],
        timeout: Duration,
    ) -> Result<WriteSection<'_>, AppError> {
        let mut ordered = users.to_vec();
        ordered.sort();
        ordered.dedup();

        let deadline = Instant::now() + timeout;
        // Dropped on early return, releasing whatever was already taken.
        let mut section = WriteSection {
            locks: self,
            guards: Vec::with_capacity(ordered.len()),
        };

        for user_id in ordered {
            let lock = self.lock_for(user_id);
            let acquired = tokio::time::timeout_at(deadline, lock.lock_owned()).await;
            let Ok(guard) = acquired else {
                self.prune(user_id);
                return Err(AppError::StoreUnavailable(format!(
                    "timed out waiting for write section of user {}",
                    user_id
                )));
            };
            tracing::debug!(%user_id, "acquired write section");
            section.guards.push((user_id, guard));
        }

        Ok(section)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn test_second_writer_waits_for_first() {
        let locks = UserLocks::new();
        let user = Uuid::new_v4();

        let held = locks.acquire(&[user], Duration::from_secs(1)).await.unwrap();
        let blocked = locks.acquire(&[user], Duration::from_millis(20)).await;
        assert!(matches!(blocked, Err(AppError::StoreUnavailable(_))));

        drop(held);
        assert!(locks.acquire(&[user], Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_other_users_are_not_blocked() {
        let locks = UserLocks::new();

        let _held = locks
            .acquire(&[Uuid::new_v4()], Duration::from_secs(1))
            .await
            .unwrap();

        assert!(
            locks
                .acquire(&[Uuid::new_v4()], Duration::from_millis(20))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_duplicate_ids_lock_once() {
        let locks = UserLocks::new();
        let user = Uuid::new_v4();

        // Would self-deadlock if the same mutex were taken twice.
        let section = locks.acquire(&[user, user], Duration::from_millis(50)).await;
        assert!(section.is_ok());
    }

    #[tokio::test]
    async fn test_released_sections_are_pruned() {
        let locks = UserLocks::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let section = locks.acquire(&[a, b], Duration::from_secs(1)).await.unwrap();
        assert_eq!(locks.tracked(), 2);

        // A timed-out waiter keeps nothing alive either.
        let blocked = locks.acquire(&[a], Duration::from_millis(20)).await;
        assert!(blocked.is_err());
        assert_eq!(locks.tracked(), 2);

        drop(section);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_entry_kept_while_another_writer_waits() {
        let locks = Arc::new(UserLocks::new());
        let user = Uuid::new_v4();
        let (acquired_tx, acquired_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = locks.acquire(&[user], Duration::from_secs(1)).await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _section = locks.acquire(&[user], Duration::from_secs(5)).await?;
                let _ = acquired_tx.send(());
                let _ = release_rx.await;
                Ok::<_, AppError>(())
            })
        };
        tokio::task::yield_now().await;

        // Releasing with a waiter queued must not discard the shared mutex.
        drop(first);
        acquired_rx.await.unwrap();
        let third = locks.acquire(&[user], Duration::from_millis(20)).await;
        assert!(matches!(third, Err(AppError::StoreUnavailable(_))));

        release_tx.send(()).unwrap();
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opposite_order_requests_do_not_deadlock() {
        let locks = Arc::new(UserLocks::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut handles = Vec::new();
        for i in 0..50 {
            let locks = locks.clone();
            let users = if i % 2 == 0 { [a, b] } else { [b, a] };
            handles.push(tokio::spawn(async move {
                let _section = locks.acquire(&users, Duration::from_secs(5)).await?;
                tokio::task::yield_now().await;
                Ok::<_, AppError>(())
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }
}
