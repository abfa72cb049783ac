use crate::prelude::*;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ecoflow::payload::{
    BatteryPackReading, BatteryReport, EnergyStreamReading, InverterReading, Record,
    RecordCommon,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocPolicy {
    #[default]
    Mean,
    /// Weight each pack by nominal capacity scaled by its state of health.
    CapacityWeighted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AggregatorConfig {
    pub expected_packs: u8,
    pub staleness: Duration,
    pub soc_policy: SocPolicy,
    pub nominal_pack_capacity_wh: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            expected_packs: 2,
            staleness: Duration::from_secs(300),
            soc_policy: SocPolicy::Mean,
            nominal_pack_capacity_wh: 5120.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Timestamped<T> {
    pub reading: T,
    pub received_at: DateTime<Utc>,
}

/// System-wide power flow in watts. `grid` is positive while importing,
/// `battery` positive while discharging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PowerFlow {
    pub solar: f64,
    pub grid: f64,
    pub battery: f64,
    pub load: f64,
}

impl From<&EnergyStreamReading> for PowerFlow {
    fn from(r: &EnergyStreamReading) -> Self {
        Self {
            solar: r.solar_power,
            grid: r.grid_power,
            battery: r.battery_total_power,
            load: r.load_power,
        }
    }
}

impl From<&InverterReading> for PowerFlow {
    fn from(r: &InverterReading) -> Self {
        let solar = r.solar_power();
        let grid = r.grid_power();
        let battery = r.battery_inverter_power;
        Self {
            solar,
            grid,
            battery,
            load: (solar + battery + grid).max(0.0),
        }
    }
}

/// Merged device view handed to readers. Never mutated once published.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub packs: BTreeMap<u8, Timestamped<BatteryPackReading>>,
    pub energy_stream: Option<Timestamped<EnergyStreamReading>>,
    pub inverter: Option<Timestamped<InverterReading>>,

    pub total_soc: Option<f64>,
    pub total_remaining_energy: f64,
    pub active_pack_count: usize,
    pub expected_pack_count: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn pack(&self, index: u8) -> Option<&BatteryPackReading> {
        self.packs.get(&index).map(|p| &p.reading)
    }

    /// Expected packs that are not currently active.
    pub fn missing_pack_count(&self) -> usize {
        self.expected_pack_count
            .saturating_sub(self.active_pack_count)
    }

    /// Power flow from whichever source reported last. The energy stream
    /// wins a tie since it carries measured load.
    pub fn power_flow(&self) -> Option<PowerFlow> {
        match (&self.energy_stream, &self.inverter) {
            (Some(s), Some(i)) if i.received_at > s.received_at => Some((&i.reading).into()),
            (Some(s), _) => Some((&s.reading).into()),
            (None, Some(i)) => Some((&i.reading).into()),
            (None, None) => None,
        }
    }
}

/// Result of one `apply`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Fold {
    pub applied: usize,
    pub stale: usize,
    /// A power source (energy stream or heartbeat) was replaced.
    pub power_updated: bool,
}

impl Fold {
    pub fn changed(&self) -> bool {
        self.applied > 0
    }
}

pub struct Aggregator {
    config: AggregatorConfig,
    snapshot: Snapshot,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let snapshot = Snapshot {
            expected_pack_count: usize::from(config.expected_packs),
            ..Default::default()
        };
        Self { config, snapshot }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Folds one record stamped with its arrival time. A reading older than
    /// the one already held for the same pack or singleton is dropped.
    pub fn apply(&mut self, record: Record, received_at: DateTime<Utc>) -> Fold {
        trace!("apply {}", record.summary());

        let mut fold = Fold::default();
        match record {
            Record::BatteryPacks(report) => self.apply_packs(report, received_at, &mut fold),
            Record::EnergyStream(reading) => {
                if replace(&mut self.snapshot.energy_stream, reading, received_at) {
                    fold.applied += 1;
                    fold.power_updated = true;
                } else {
                    fold.stale += 1;
                }
            }
            Record::Inverter(reading) => {
                if replace(&mut self.snapshot.inverter, reading, received_at) {
                    fold.applied += 1;
                    fold.power_updated = true;
                } else {
                    fold.stale += 1;
                }
            }
        }

        if fold.changed() {
            self.snapshot.updated_at = Some(received_at);
            self.recompute(received_at);
        }
        if fold.stale > 0 {
            debug!("ignored {} out-of-order reading(s)", fold.stale);
        }

        fold
    }

    fn apply_packs(&mut self, report: BatteryReport, received_at: DateTime<Utc>, fold: &mut Fold) {
        for reading in report.packs {
            let index = reading.pack_index;
            if index >= self.config.expected_packs {
                debug!(
                    "pack {} reported beyond the {} configured",
                    index, self.config.expected_packs
                );
            }

            if let Some(existing) = self.snapshot.packs.get(&index) {
                if existing.received_at > received_at {
                    fold.stale += 1;
                    continue;
                }
            }

            self.snapshot.packs.insert(
                index,
                Timestamped {
                    reading,
                    received_at,
                },
            );
            fold.applied += 1;
        }
    }

    /// Re-evaluates staleness without a new record, e.g. from a timer.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        let before = self.snapshot.active_pack_count;
        self.recompute(now);
        before != self.snapshot.active_pack_count
    }

    fn recompute(&mut self, now: DateTime<Utc>) {
        let packs = &self.snapshot.packs;

        self.snapshot.total_remaining_energy =
            packs.values().map(|p| p.reading.remaining_energy).sum();

        self.snapshot.active_pack_count = packs
            .values()
            .filter(|p| is_fresh(p.received_at, now, self.config.staleness))
            .count();

        self.snapshot.total_soc = self.total_soc();
    }

    fn total_soc(&self) -> Option<f64> {
        let packs = &self.snapshot.packs;
        if packs.is_empty() {
            return None;
        }

        let mean = || {
            packs
                .values()
                .map(|p| f64::from(p.reading.state_of_charge))
                .sum::<f64>()
                / packs.len() as f64
        };

        match self.config.soc_policy {
            SocPolicy::Mean => Some(mean()),
            SocPolicy::CapacityWeighted => {
                let (weighted, weights) =
                    packs.values().fold((0.0, 0.0), |(weighted, weights), p| {
                        let weight = self.config.nominal_pack_capacity_wh
                            * f64::from(p.reading.state_of_health)
                            / 100.0;
                        (
                            weighted + f64::from(p.reading.state_of_charge) * weight,
                            weights + weight,
                        )
                    });

                if weights > 0.0 {
                    Some(weighted / weights)
                } else {
                    Some(mean())
                }
            }
        }
    }
}

fn replace<T>(slot: &mut Option<Timestamped<T>>, reading: T, received_at: DateTime<Utc>) -> bool {
    if let Some(existing) = slot {
        if existing.received_at > received_at {
            return false;
        }
    }
    *slot = Some(Timestamped {
        reading,
        received_at,
    });
    true
}

fn is_fresh(received_at: DateTime<Utc>, now: DateTime<Utc>, staleness: Duration) -> bool {
    match (now - received_at).to_std() {
        Ok(age) => age <= staleness,
        // stamped in the future relative to `now`
        Err(_) => true,
    }
}
