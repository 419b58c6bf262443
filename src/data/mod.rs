pub mod change;
pub mod resolver;
pub mod shared_booking;
pub mod snapshot;
pub mod zeroworld;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::FetchError;
use shared_booking::FetchResult;

/// Upstream availability source for one activity.
#[async_trait]
pub trait SlotSource: Send + Sync {
    /// Public listing and hidden reservation map for one date.
    async fn fetch(&self, date: NaiveDate) -> Result<FetchResult, FetchError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), FetchError> {
        Ok(())
    }
}
