//! Quorum replication and anti-entropy over a set of storage replicas.
//!
//! Provides: the [`Replica`](replica::Replica) contract, fan-out tactics,
//! read strategies, the [`Farm`](farm::Farm) that applies writes and reads
//! across replicas, repair, cardinality bookkeeping and the expiry sweeper.

pub mod chaos;
pub mod counter;
pub mod farm;
pub mod local;
pub mod pool;
pub mod repair;
pub mod replica;
pub mod strategy;
pub mod sweeper;
pub mod tactic;

pub use counter::CounterFarm;
pub use farm::{Farm, FarmError};
pub use pool::TaskPool;
pub use replica::{Replica, ReplicaError};
pub use strategy::ReadStrategy;
pub use sweeper::{ExpiryIndex, Sweeper};
pub use tactic::Tactic;
