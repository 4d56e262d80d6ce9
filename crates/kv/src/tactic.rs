//! Fan-out tactics: how a farm contacts its replicas.

use crate::farm::FarmError;
use crate::replica::Replica;
use futures::stream::BoxStream;
use futures::StreamExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-replica channel headroom before a contributor waits on the reader.
const FAN_OUT_BUFFER: usize = 64;

/// Merged contributions of one fan-out. Each item is tagged with the index
/// of the replica that produced it; the channel closes once every
/// contribution has finished.
#[derive(Debug)]
pub struct FanOut<T> {
    pub rx: mpsc::Receiver<(usize, T)>,
    /// Number of replicas actually invoked.
    pub contacted: usize,
}

#[derive(Clone)]
pub enum Tactic {
    /// Contact nothing. Used to switch a farm off.
    Blocking,
    /// Contact every replica concurrently.
    NonBlocking,
    /// Like `NonBlocking`, behind a token bucket sized in elements.
    RateLimited(Arc<DefaultDirectRateLimiter>),
}

impl std::fmt::Debug for Tactic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocking => f.write_str("Blocking"),
            Self::NonBlocking => f.write_str("NonBlocking"),
            Self::RateLimited(_) => f.write_str("RateLimited"),
        }
    }
}

impl Tactic {
    pub fn rate_limited(per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        let quota = Quota::per_second(per_second).allow_burst(burst);
        Self::RateLimited(Arc::new(RateLimiter::direct(quota)))
    }

    /// The same tactic without admission control. A farm that follows
    /// another farm's admitted writes (a counter farm) uses this so it never
    /// shares or exhausts the leader's token bucket.
    pub fn unmetered(&self) -> Self {
        match self {
            Self::Blocking => Self::Blocking,
            Self::NonBlocking | Self::RateLimited(_) => Self::NonBlocking,
        }
    }

    /// Reject up front if `elements` exceeds the current budget. Nothing is
    /// queued: a request larger than the burst can never pass.
    fn admit(&self, elements: usize) -> Result<(), FarmError> {
        let Self::RateLimited(limiter) = self else {
            return Ok(());
        };
        let Some(n) = NonZeroU32::new(u32::try_from(elements).unwrap_or(u32::MAX)) else {
            return Ok(());
        };
        match limiter.check_n(n) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(FarmError::RateLimited {
                requested: elements,
            }),
        }
    }

    /// Invoke `f` against the replicas according to the tactic and merge
    /// the resulting streams into one channel.
    pub fn fan_out<T, F>(
        &self,
        replicas: &[Arc<dyn Replica>],
        elements: usize,
        f: F,
    ) -> Result<FanOut<T>, FarmError>
    where
        T: Send + 'static,
        F: Fn(&Arc<dyn Replica>) -> BoxStream<'static, T>,
    {
        if matches!(self, Self::Blocking) {
            let (_tx, rx) = mpsc::channel(1);
            return Ok(FanOut { rx, contacted: 0 });
        }
        self.admit(elements)?;

        let (tx, rx) = mpsc::channel(replicas.len().max(1) * FAN_OUT_BUFFER);
        for (idx, replica) in replicas.iter().enumerate() {
            let mut contribution = f(replica);
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(item) = contribution.next().await {
                    if tx.send((idx, item)).await.is_err() {
                        break;
                    }
                }
            });
        }
        Ok(FanOut {
            rx,
            contacted: replicas.len(),
        })
    }
}
