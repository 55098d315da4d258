//! Leader-first execution of one-time setup work

use crate::{ProcessGroup, Result};
use std::future::Future;
use tracing::debug;

/// Two-phase barrier protocol: the leader runs a critical section while
/// followers wait, then followers run theirs while the leader waits.
///
/// Keeps processes from racing on a shared, possibly network-mounted,
/// resource such as a download cache.
pub struct RankOrdered<'a> {
    group: &'a dyn ProcessGroup,
    is_leader: bool,
}

impl<'a> RankOrdered<'a> {
    pub fn new(group: &'a dyn ProcessGroup, is_leader: bool) -> Self {
        Self { group, is_leader }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Phase one: the leader executes `f`, then everyone meets at a barrier
    pub async fn run_if_leader<T, F, Fut>(&self, f: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let output = if self.is_leader {
            debug!(rank = self.group.rank(), "Running leader section");
            Some(f().await?)
        } else {
            None
        };
        self.group.barrier().await?;
        Ok(output)
    }

    /// Phase two: followers execute `f`, then everyone meets at a barrier
    pub async fn run_if_follower<T, F, Fut>(&self, f: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let output = if self.is_leader {
            None
        } else {
            debug!(rank = self.group.rank(), "Running follower section");
            Some(f().await?)
        };
        self.group.barrier().await?;
        Ok(output)
    }

    /// Run the same section on every rank, leader first
    pub async fn run<T, F, Fut>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let leader = self.run_if_leader(&mut f).await?;
        let follower = self.run_if_follower(&mut f).await?;
        leader.or(follower).ok_or_else(|| crate::Error::Internal {
            message: "rank-ordered section produced no output".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalProcessGroup;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_leader_runs_before_followers() {
        let groups = LocalProcessGroup::create(3).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for group in groups {
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                let rank = group.rank();
                let ordered = RankOrdered::new(&group, rank == 0);
                ordered
                    .run(|| {
                        let log = Arc::clone(&log);
                        async move {
                            log.lock().push(rank);
                            Ok(rank * 10)
                        }
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut outputs = Vec::new();
        for handle in handles {
            outputs.push(handle.await.unwrap());
        }
        outputs.sort();
        assert_eq!(outputs, vec![0, 10, 20]);

        let log = log.lock();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0], 0);
    }

    #[tokio::test]
    async fn test_leader_only_section() {
        let group = crate::SingleProcessGroup;
        let ordered = RankOrdered::new(&group, true);

        let out = ordered.run_if_leader(|| async { Ok("cache") }).await.unwrap();
        assert_eq!(out, Some("cache"));

        let out = ordered
            .run_if_follower(|| async { Ok("cache") })
            .await
            .unwrap();
        assert_eq!(out, None);
    }
}
