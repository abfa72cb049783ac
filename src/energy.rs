use crate::prelude::*;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregator::PowerFlow;

const WATT_SECONDS_PER_KWH: f64 = 3_600_000.0;

/// One directional accounting counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyChannel {
    Solar,
    GridImport,
    GridExport,
    BatteryCharge,
    BatteryDischarge,
    Load,
}

impl EnergyChannel {
    pub const ALL: [EnergyChannel; 6] = [
        Self::Solar,
        Self::GridImport,
        Self::GridExport,
        Self::BatteryCharge,
        Self::BatteryDischarge,
        Self::Load,
    ];

    /// Stable identifier used by the persistence stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Solar => "solar",
            Self::GridImport => "grid_import",
            Self::GridExport => "grid_export",
            Self::BatteryCharge => "battery_charge",
            Self::BatteryDischarge => "battery_discharge",
            Self::Load => "load",
        }
    }
}

impl std::fmt::Display for EnergyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EnergyChannel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| anyhow!("unknown energy channel {}", s))
    }
}

/// Cumulative kWh per channel, as published to readers and persisted.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EnergyTotals {
    pub channels: BTreeMap<EnergyChannel, f64>,
}

impl EnergyTotals {
    pub fn get(&self, channel: EnergyChannel) -> f64 {
        self.channels.get(&channel).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, channel: EnergyChannel, kwh: f64) {
        self.channels.insert(channel, kwh);
    }

    /// Builds totals from stored `(channel id, kWh)` pairs, skipping
    /// unknown ids and unusable values.
    pub fn from_records<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: AsRef<str>,
    {
        let mut totals = Self::default();
        for (id, kwh) in records {
            let id = id.as_ref();
            match EnergyChannel::from_str(id) {
                Ok(channel) if kwh.is_finite() && kwh >= 0.0 => totals.set(channel, kwh),
                Ok(_) => warn!("ignoring stored value {} for energy channel {}", kwh, id),
                Err(e) => warn!("ignoring stored energy record: {}", e),
            }
        }
        totals
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Sample {
    at: DateTime<Utc>,
    power: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct ChannelState {
    cumulative_kwh: f64,
    last_sample: Option<Sample>,
}

/// Turns power samples into monotonic kWh counters using left-endpoint
/// rectangles: the power held since the previous sample is credited for
/// the elapsed interval.
#[derive(Clone, Debug, Default)]
pub struct EnergyAccumulator {
    channels: BTreeMap<EnergyChannel, ChannelState>,
    max_gap: Option<Duration>,
}

impl EnergyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intervals longer than `max_gap` are not integrated; the channel starts
    /// a new first-observation cycle instead.
    pub fn with_max_gap(max_gap: Duration) -> Self {
        Self {
            channels: BTreeMap::new(),
            max_gap: Some(max_gap),
        }
    }

    /// Loads persisted totals. Sample history is cleared so nothing is
    /// back-filled across the restart.
    pub fn restore(&mut self, totals: &EnergyTotals) {
        for (channel, kwh) in &totals.channels {
            self.channels.insert(
                *channel,
                ChannelState {
                    cumulative_kwh: *kwh,
                    last_sample: None,
                },
            );
        }
        for state in self.channels.values_mut() {
            state.last_sample = None;
        }
    }

    /// Feeds one sample and returns the kWh added.
    pub fn observe(&mut self, channel: EnergyChannel, power_watts: f64, at: DateTime<Utc>) -> f64 {
        if !power_watts.is_finite() {
            warn!("ignoring non-finite {} sample {}", channel, power_watts);
            return 0.0;
        }

        let max_gap = self.max_gap;
        let state = self.channels.entry(channel).or_default();
        let sample = Sample {
            at,
            power: power_watts,
        };

        let Some(previous) = state.last_sample else {
            state.last_sample = Some(sample);
            return 0.0;
        };

        if at <= previous.at {
            trace!("ignoring {} sample at {}, not after {}", channel, at, previous.at);
            return 0.0;
        }

        let elapsed = at - previous.at;
        if let Some(max_gap) = max_gap {
            if elapsed.to_std().map(|e| e > max_gap).unwrap_or(false) {
                debug!("{} gap of {}s, restarting integration", channel, elapsed.num_seconds());
                state.last_sample = Some(sample);
                return 0.0;
            }
        }

        let seconds = elapsed.num_milliseconds() as f64 / 1000.0;
        let delta = previous.power.max(0.0) * seconds / WATT_SECONDS_PER_KWH;

        state.cumulative_kwh += delta;
        state.last_sample = Some(sample);
        delta
    }

    /// Splits a power flow across the directional channels.
    pub fn observe_flow(&mut self, flow: &PowerFlow, at: DateTime<Utc>) -> f64 {
        [
            (EnergyChannel::Solar, flow.solar),
            (EnergyChannel::GridImport, flow.grid),
            (EnergyChannel::GridExport, -flow.grid),
            (EnergyChannel::BatteryDischarge, flow.battery),
            (EnergyChannel::BatteryCharge, -flow.battery),
            (EnergyChannel::Load, flow.load),
        ]
        .into_iter()
        .map(|(channel, power)| self.observe(channel, power, at))
        .sum()
    }

    pub fn cumulative(&self, channel: EnergyChannel) -> f64 {
        self.channels
            .get(&channel)
            .map(|s| s.cumulative_kwh)
            .unwrap_or(0.0)
    }

    pub fn totals(&self) -> EnergyTotals {
        let mut totals = EnergyTotals::default();
        for channel in EnergyChannel::ALL {
            totals.set(channel, self.cumulative(channel));
        }
        totals
    }
}
