//! Tracker state wiring.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::domain::{AppError, LedgerGateway, OperationRecord, OperationStore, StatusEvent};

use super::config::TrackerConfig;
use super::redemption::RedemptionTracker;
use super::scheduler::PollScheduler;
use super::transfer::TransferEngine;

/// Capacity of the status-event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared tracker state: the engines, their collaborators, and the
/// subscriber notification channel
#[derive(Clone)]
pub struct TrackerState {
    pub transfers: Arc<TransferEngine>,
    pub redemptions: Arc<RedemptionTracker>,
    pub scheduler: Arc<PollScheduler>,
    pub store: Arc<dyn OperationStore>,
    pub gateway: Arc<dyn LedgerGateway>,
    events: broadcast::Sender<StatusEvent>,
}

impl TrackerState {
    /// Wire the engines against a store and gateway
    #[must_use]
    pub fn new(
        store: Arc<dyn OperationStore>,
        gateway: Arc<dyn LedgerGateway>,
        config: TrackerConfig,
    ) -> Self {
        let scheduler = Arc::new(PollScheduler::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let transfers = Arc::new(TransferEngine::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&scheduler),
            config.clone(),
            events.clone(),
        ));
        let redemptions = Arc::new(RedemptionTracker::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&scheduler),
            config,
            events.clone(),
        ));

        Self {
            transfers,
            redemptions,
            scheduler,
            store,
            gateway,
            events,
        }
    }

    /// Subscribe to status-change notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Re-register polling for every non-terminal record in the store.
    /// Called on process start so monitoring resumes without user action.
    #[instrument(skip(self))]
    pub async fn resume_active(&self) -> Result<usize, AppError> {
        let records = self.store.list_active().await?;
        let count = records.len();

        for record in records {
            match record {
                OperationRecord::Transfer(transfer) => self.transfers.watch(&transfer.id),
                OperationRecord::DelayedRequest(request) => self.redemptions.watch(&request.id),
            }
        }

        if count > 0 {
            info!(count, "Resumed monitoring for in-flight operations");
        }
        Ok(count)
    }
}
