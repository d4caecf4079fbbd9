//! Barrier and winner cache shared by every connection.
//!
//! The draw opens once every expected agency has reported `ALL_SENT`. The
//! winner set is then computed by the first query to arrive and served from
//! the cache for the rest of the server's lifetime.

use std::{collections::HashSet, sync::Arc};

use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::info;

use crate::{
    bet::{Bet, WinPredicate},
    store::{BetStoreGateway, StorageError},
};

#[derive(Debug, Error)]
pub enum DrawError {
    #[error("the draw is not ready: {finished} of {total} agencies finished")]
    NotReady { finished: usize, total: usize },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What happened when an agency reported it had no more batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Recorded { finished: usize },
    AlreadyFinished,
    /// Every expected agency had already finished; nothing was counted.
    BarrierFull,
}

pub struct DrawCoordinator {
    total_agencies: usize,
    finished: Mutex<HashSet<u32>>,
    winners: OnceCell<Arc<[Bet]>>,
    predicate: Arc<dyn WinPredicate>,
}

impl DrawCoordinator {
    pub fn new(total_agencies: usize, predicate: impl WinPredicate + 'static) -> Self {
        Self {
            total_agencies,
            finished: Mutex::new(HashSet::new()),
            winners: OnceCell::new(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn total_agencies(&self) -> usize {
        self.total_agencies
    }

    /// Counts `agency` as finished. Each agency id counts at most once.
    pub async fn mark_finished(&self, agency: u32) -> FinishOutcome {
        let mut finished = self.finished.lock().await;

        if finished.contains(&agency) {
            return FinishOutcome::AlreadyFinished;
        }
        if finished.len() >= self.total_agencies {
            return FinishOutcome::BarrierFull;
        }

        finished.insert(agency);
        FinishOutcome::Recorded {
            finished: finished.len(),
        }
    }

    pub async fn finished_count(&self) -> usize {
        self.finished.lock().await.len()
    }

    /// True once every expected agency has finished. Never reverts.
    pub async fn is_ready(&self) -> bool {
        self.finished_count().await == self.total_agencies
    }

    /// False only when `agency` certainly has not reported `ALL_SENT` yet.
    pub async fn may_have_finished(&self, agency: u32) -> bool {
        let finished = self.finished.lock().await;
        finished.contains(&agency) || finished.len() == self.total_agencies
    }

    /// Returns the winner set, scanning the store on the first call only.
    ///
    /// Concurrent callers wait for the single in-flight computation. A failed
    /// scan leaves the cache empty so a later query can retry.
    pub async fn compute_winners_once(
        &self,
        store: &BetStoreGateway,
    ) -> Result<Arc<[Bet]>, DrawError> {
        if let Some(winners) = self.winners.get() {
            return Ok(Arc::clone(winners));
        }

        let finished = self.finished_count().await;
        if finished != self.total_agencies {
            return Err(DrawError::NotReady {
                finished,
                total: self.total_agencies,
            });
        }

        let winners = self
            .winners
            .get_or_try_init(|| async {
                let bets = store.read_all().await?;
                let total = bets.len();
                let winners: Arc<[Bet]> = bets
                    .into_iter()
                    .filter(|bet| self.predicate.is_winner(bet))
                    .collect();
                info!(
                    bets = total,
                    winners = winners.len(),
                    "action: sorteo | result: success"
                );
                Ok::<_, StorageError>(winners)
            })
            .await?;
        Ok(Arc::clone(winners))
    }

    /// Winners that belong to `agency`.
    pub async fn winners_for(
        &self,
        agency: u32,
        store: &BetStoreGateway,
    ) -> Result<Vec<Bet>, DrawError> {
        let winners = self.compute_winners_once(store).await?;
        Ok(winners
            .iter()
            .filter(|bet| bet.agency == agency)
            .cloned()
            .collect())
    }
}
