use crate::prelude::*;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::aggregator::{Aggregator, Snapshot};
use crate::ecoflow::payload::EmsMessage;
use crate::ecoflow::{frame, Dispatch, RecordCommon, Registry};
use crate::energy::{EnergyAccumulator, EnergyChannel, EnergyTotals};
use crate::liveness::{ConnectionState, Liveness};

#[derive(Default, Debug, Clone)]
pub struct FrameStats {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub frames_lagged: u64,
    pub headers_received: u64,
    // Decoded message counters
    pub heartbeats_received: u64,
    pub battery_reports_received: u64,
    pub energy_streams_received: u64,
    // Skipped / dropped
    pub unknown_messages: u64,
    pub empty_payloads: u64,
    pub payloads_dropped: u64,
    pub stale_readings: u64,
    pub records_applied: u64,
    // Connection stats
    pub connects: u64,
    pub disconnects: u64,
}

impl FrameStats {
    pub fn print_summary(&self) {
        info!("Frame Statistics:");
        info!("  Total frames received: {}", self.frames_received);
        info!("  Frames dropped (malformed): {}", self.frames_dropped);
        info!("  Frames lost (lagged): {}", self.frames_lagged);
        info!("  Headers received: {}", self.headers_received);
        info!("  Decoded Message Types:");
        info!("    EMS heartbeat: {}", self.heartbeats_received);
        info!("    Battery status: {}", self.battery_reports_received);
        info!("    Energy stream: {}", self.energy_streams_received);
        info!("  Skipped:");
        info!("    Unknown message types: {}", self.unknown_messages);
        info!("    Empty payloads: {}", self.empty_payloads);
        info!("    Malformed payloads: {}", self.payloads_dropped);
        info!("    Out-of-order readings: {}", self.stale_readings);
        info!("  Readings applied: {}", self.records_applied);
        info!("  Connection Stats:");
        info!("    Connects: {}", self.connects);
        info!("    Disconnects: {}", self.disconnects);
    }
}

/// What happened to one delivered frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub frame_dropped: bool,
    pub headers: usize,
    pub applied: usize,
    pub stale: usize,
    pub unknown: usize,
    pub empty: usize,
    pub malformed_payloads: usize,
}

struct Engine {
    aggregator: Aggregator,
    energy: EnergyAccumulator,
}

/// Owns the device state and energy counters. Frames are folded under one
/// lock; readers get the last published snapshot and never see a partial
/// update.
#[derive(Clone)]
pub struct Coordinator {
    channels: Channels,
    engine: Arc<Mutex<Engine>>,
    snapshot: Arc<watch::Sender<Arc<Snapshot>>>,
    totals: Arc<watch::Sender<EnergyTotals>>,
    liveness: Liveness,
    pub stats: Arc<Mutex<FrameStats>>,
}

impl Coordinator {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        let engine = Engine {
            aggregator: Aggregator::new(config.device().aggregator_config()),
            energy: match config.energy().max_gap() {
                Some(max_gap) => EnergyAccumulator::with_max_gap(max_gap),
                None => EnergyAccumulator::new(),
            },
        };

        let (snapshot, _) = watch::channel(Arc::new(engine.aggregator.snapshot().clone()));
        let (totals, _) = watch::channel(engine.energy.totals());

        Self {
            channels,
            engine: Arc::new(Mutex::new(engine)),
            snapshot: Arc::new(snapshot),
            totals: Arc::new(totals),
            liveness: Liveness::new(),
            stats: Arc::new(Mutex::new(FrameStats::default())),
        }
    }

    fn engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> MutexGuard<'_, FrameStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds the counters from persisted totals. Call before the first frame.
    pub fn restore(&self, totals: &EnergyTotals) {
        let mut engine = self.engine();
        engine.energy.restore(totals);
        self.totals.send_replace(engine.energy.totals());

        for channel in EnergyChannel::ALL {
            info!("restored {} = {} kWh", channel, engine.energy.cumulative(channel));
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.transport_receiver().await
    }

    pub fn stop(&self) {
        let _ = self.channels.from_mqtt.send(mqtt::ChannelData::Shutdown);
    }

    // transport -> engine
    async fn transport_receiver(&self) -> Result<()> {
        use broadcast::error::RecvError;

        let mut receiver = self.channels.from_mqtt.subscribe();

        loop {
            match receiver.recv().await {
                Ok(mqtt::ChannelData::Frame(bytes)) => {
                    self.deliver_frame(&bytes);
                }
                Ok(mqtt::ChannelData::Connected) => self.on_connect(),
                Ok(mqtt::ChannelData::Disconnected) => self.on_disconnect(),
                Ok(mqtt::ChannelData::Shutdown) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(n)) => {
                    warn!("coordinator fell behind, {} frames lost", n);
                    self.stats().frames_lagged += n;
                }
            }
        }

        self.print_summary();
        info!("coordinator loop exiting");
        Ok(())
    }

    pub fn deliver_frame(&self, raw: &[u8]) -> Delivery {
        self.deliver_frame_at(raw, Utc::now())
    }

    /// Decodes one transport message and folds every usable header, stamping
    /// readings with `received_at`. Never fails: problems are logged, counted
    /// and reported in the returned `Delivery`.
    pub fn deliver_frame_at(&self, raw: &[u8], received_at: DateTime<Utc>) -> Delivery {
        let mut delivery = Delivery::default();

        let messages = match frame::decode(raw) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("dropping frame of {} bytes: {}", raw.len(), e);
                delivery.frame_dropped = true;
                self.count(&delivery, &[]);
                return delivery;
            }
        };
        delivery.headers = messages.len();

        let mut kinds = Vec::new();
        let mut guard = self.engine();
        let engine = &mut *guard;

        for message in &messages {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    warn!("{}", e);
                    delivery.malformed_payloads += 1;
                    continue;
                }
            };

            match Registry::decode(message) {
                Ok(Dispatch::Record(record)) => {
                    kinds.push(record.message());

                    let fold = engine.aggregator.apply(record, received_at);
                    delivery.applied += fold.applied;
                    delivery.stale += fold.stale;

                    if fold.power_updated {
                        let flow = engine.aggregator.snapshot().power_flow();
                        if let Some(flow) = flow {
                            engine.energy.observe_flow(&flow, received_at);
                        }
                    }
                }
                Ok(Dispatch::Empty(kind)) => {
                    trace!("{:?} with empty payload", kind);
                    delivery.empty += 1;
                }
                Ok(Dispatch::Unknown {
                    type_family,
                    type_id,
                }) => {
                    trace!("ignoring message {}/{}", type_family, type_id);
                    delivery.unknown += 1;
                }
                Err(e) => {
                    warn!("{}", e);
                    delivery.malformed_payloads += 1;
                }
            }
        }

        if delivery.applied > 0 {
            self.publish(engine);
        }
        drop(guard);

        self.count(&delivery, &kinds);
        delivery
    }

    /// Re-evaluates pack staleness against `now` and publishes if the
    /// active pack count moved.
    pub fn refresh(&self, now: DateTime<Utc>) {
        let mut guard = self.engine();
        let engine = &mut *guard;
        if engine.aggregator.refresh(now) {
            debug!(
                "active packs now {}",
                engine.aggregator.snapshot().active_pack_count
            );
            self.publish(engine);
        }
    }

    // callers hold the engine lock, which keeps publishes in fold order
    fn publish(&self, engine: &Engine) {
        self.snapshot
            .send_replace(Arc::new(engine.aggregator.snapshot().clone()));

        let totals = engine.energy.totals();
        self.totals.send_if_modified(|current| {
            if *current == totals {
                false
            } else {
                *current = totals;
                true
            }
        });
    }

    fn count(&self, delivery: &Delivery, kinds: &[EmsMessage]) {
        let mut stats = self.stats();
        stats.frames_received += 1;
        if delivery.frame_dropped {
            stats.frames_dropped += 1;
        }
        stats.headers_received += delivery.headers as u64;
        stats.unknown_messages += delivery.unknown as u64;
        stats.empty_payloads += delivery.empty as u64;
        stats.payloads_dropped += delivery.malformed_payloads as u64;
        stats.stale_readings += delivery.stale as u64;
        stats.records_applied += delivery.applied as u64;

        for kind in kinds {
            match kind {
                EmsMessage::Heartbeat => stats.heartbeats_received += 1,
                EmsMessage::BatteryStatus => stats.battery_reports_received += 1,
                EmsMessage::EnergyStream => stats.energy_streams_received += 1,
            }
        }
    }

    pub fn on_connect(&self) {
        self.liveness.on_connect();
        self.stats().connects += 1;
    }

    pub fn on_disconnect(&self) {
        self.liveness.on_disconnect();
        self.stats().disconnects += 1;
        self.print_summary();
    }

    pub fn print_summary(&self) {
        self.stats().print_summary();
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn energy_totals(&self) -> EnergyTotals {
        self.totals.borrow().clone()
    }

    pub fn cumulative(&self, channel: EnergyChannel) -> f64 {
        self.totals.borrow().get(channel)
    }

    pub fn connected(&self) -> bool {
        self.liveness.connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.liveness.state()
    }

    /// Woken after every fold that changed the snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot.subscribe()
    }

    pub fn subscribe_energy(&self) -> watch::Receiver<EnergyTotals> {
        self.totals.subscribe()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.liveness.subscribe()
    }
}
