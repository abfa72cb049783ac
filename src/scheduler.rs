use crate::prelude::*;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::coordinator::Coordinator;
use crate::energy::EnergyTotals;
use crate::store::EnergyStore;

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    /// Persist now instead of waiting for the next tick.
    Flush,
    Shutdown,
}

/// Periodic housekeeping: saves energy totals when they moved and ages out
/// stale packs. The only place storage I/O happens.
#[derive(Clone)]
pub struct Scheduler {
    config: ConfigWrapper,
    channels: Channels,
    coordinator: Coordinator,
    store: Arc<dyn EnergyStore>,
}

impl Scheduler {
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        coordinator: Coordinator,
        store: Arc<dyn EnergyStore>,
    ) -> Self {
        Self {
            config,
            channels,
            coordinator,
            store,
        }
    }

    pub async fn start(&self) -> Result<()> {
        use broadcast::error::RecvError;

        let mut receiver = self.channels.to_scheduler.subscribe();
        let mut interval = tokio::time::interval(self.config.energy().persist_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // totals as last written; restored values count as already saved
        let mut saved = Some(self.coordinator.energy_totals());

        info!("persisting energy totals to {}", self.store.describe());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.coordinator.refresh(chrono::Utc::now());
                    self.persist(&mut saved).await;
                }
                message = receiver.recv() => {
                    match message {
                        Ok(ChannelData::Flush) => {
                            self.persist(&mut saved).await;
                        }
                        Ok(ChannelData::Shutdown) | Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(_)) => {}
                    }
                }
            }
        }

        self.flush(&mut saved).await;

        info!("scheduler loop exiting");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_scheduler.send(ChannelData::Shutdown);
    }

    /// One attempt; a failure leaves `saved` untouched so the next tick
    /// tries again.
    async fn persist(&self, saved: &mut Option<EnergyTotals>) -> bool {
        let totals = self.coordinator.energy_totals();
        if saved.as_ref() == Some(&totals) {
            trace!("energy totals unchanged, nothing to persist");
            return true;
        }

        match self.store.save(&totals).await {
            Ok(()) => {
                *saved = Some(totals);
                true
            }
            Err(err) => {
                error!("saving energy totals failed, retrying next cycle: {:#}", err);
                false
            }
        }
    }

    // final write on shutdown, there is no next cycle to fall back on
    async fn flush(&self, saved: &mut Option<EnergyTotals>) {
        let max_retries = 3;
        let mut backoff = 1;

        for attempt in 1..=max_retries {
            if self.persist(saved).await {
                info!("energy totals flushed");
                return;
            }
            if attempt < max_retries {
                info!("retrying flush in {}s", backoff);
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff *= 2;
            }
        }

        error!("failed to flush energy totals after {} attempts", max_retries);
    }
}
