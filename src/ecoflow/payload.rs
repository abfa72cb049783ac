use crate::prelude::*;

use base64::prelude::*;
use enum_dispatch::enum_dispatch;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

use super::frame::Message;
use super::wire::{Fields, WireError};

/// `cmd_func` of everything the PowerOcean EMS reports.
pub const TYPE_FAMILY_EMS: u32 = 96;

/// Packs report a 1-based source index; anything past this is not a pack.
pub const MAX_PACKS: u8 = 9;

pub const MAX_MPPT_STRINGS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum EmsMessage {
    Heartbeat = 1,
    BatteryStatus = 7,
    EnergyStream = 33,
}

// Battery pack (bpSta) {{{
mod bp {
    pub const PACKS: u32 = 1;

    pub const PWR: u32 = 1;
    pub const SOC: u32 = 2;
    pub const SOH: u32 = 3;
    pub const VOL: u32 = 9;
    pub const AMP: u32 = 10;
    pub const DSRC: u32 = 15;
    pub const SN: u32 = 16;
    pub const CYCLES: u32 = 17;
    pub const HV_MOS_TEMP: u32 = 19;
    pub const ENV_TEMP: u32 = 25;
    pub const REAL_SOC: u32 = 38;
    pub const CHG_DSG_STA: u32 = 50;
    pub const REMAIN_WATTH: u32 = 54;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BatteryPackReading {
    pub pack_index: u8,
    pub serial_number: String,
    pub state_of_charge: u8,
    pub real_soc: f64,
    pub state_of_health: u8,
    /// Watts, positive while discharging.
    pub power: f64,
    pub remaining_energy: f64,
    pub temperature: f64,
    pub mosfet_temperature: f64,
    pub cycle_count: u32,
    pub voltage: f64,
    pub current: f64,
    pub is_charging: bool,
}

impl BatteryPackReading {
    /// `None` when the entry is not a real pack (source index 0 or past the
    /// last pack slot).
    fn decode(fields: &Fields) -> Option<Self> {
        let source = fields.uint(bp::DSRC).unwrap_or(0);
        if source == 0 || source > u64::from(MAX_PACKS) {
            return None;
        }

        Some(Self {
            pack_index: (source - 1) as u8,
            serial_number: fields.string(bp::SN).map(|sn| pack_serial(&sn)).unwrap_or_default(),
            state_of_charge: percent(fields.uint(bp::SOC)),
            real_soc: fields.float(bp::REAL_SOC).unwrap_or(0.0).clamp(0.0, 100.0),
            state_of_health: percent(fields.uint(bp::SOH)),
            power: fields.float(bp::PWR).unwrap_or(0.0),
            remaining_energy: fields.float(bp::REMAIN_WATTH).unwrap_or(0.0).max(0.0),
            temperature: fields.float(bp::ENV_TEMP).unwrap_or(0.0),
            mosfet_temperature: fields.float(bp::HV_MOS_TEMP).unwrap_or(0.0),
            cycle_count: fields
                .uint(bp::CYCLES)
                .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
                .unwrap_or(0),
            voltage: fields.float(bp::VOL).unwrap_or(0.0).max(0.0),
            current: fields.float(bp::AMP).unwrap_or(0.0),
            is_charging: fields.uint(bp::CHG_DSG_STA) == Some(1),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BatteryReport {
    pub packs: Vec<BatteryPackReading>,
}

impl BatteryReport {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let fields = Fields::parse(payload)?;

        let mut packs = Vec::new();
        for pack in fields.messages(bp::PACKS)? {
            match BatteryPackReading::decode(&pack) {
                Some(reading) => packs.push(reading),
                None => trace!("skipping bpSta entry without a pack source index"),
            }
        }

        Ok(Self { packs })
    }
} // }}}

// Energy stream {{{
mod stream {
    pub const LOAD: u32 = 1;
    pub const GRID: u32 = 2;
    pub const SOLAR: u32 = 3;
    pub const BATTERY: u32 = 4;
    pub const SOC: u32 = 5;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EnergyStreamReading {
    pub solar_power: f64,
    /// Positive while importing.
    pub grid_power: f64,
    pub load_power: f64,
    /// Positive while discharging.
    pub battery_total_power: f64,
    pub soc: Option<u8>,
}

impl EnergyStreamReading {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let fields = Fields::parse(payload)?;

        Ok(Self {
            solar_power: fields.float(stream::SOLAR).unwrap_or(0.0).max(0.0),
            grid_power: fields.float(stream::GRID).unwrap_or(0.0),
            load_power: fields.float(stream::LOAD).unwrap_or(0.0).max(0.0),
            battery_total_power: fields.float(stream::BATTERY).unwrap_or(0.0),
            soc: fields.uint(stream::SOC).map(|v| percent(Some(v))),
        })
    }
} // }}}

// EMS heartbeat {{{
mod hb {
    pub const PHASES: [u32; 3] = [1, 2, 3];
    pub const MPPT: u32 = 4;
    pub const AC_FREQ: u32 = 5;
    pub const BP_POWER: u32 = 59;

    pub const PHASE_VOLT: u32 = 1;
    pub const PHASE_AMP: u32 = 2;
    pub const PHASE_ACT_PWR: u32 = 3;
    pub const PHASE_REACT_PWR: u32 = 4;
    pub const PHASE_APPARENT_PWR: u32 = 5;

    pub const MPPT_PV: u32 = 1;
    pub const PV_VOL: u32 = 1;
    pub const PV_AMP: u32 = 2;
    pub const PV_PWR: u32 = 3;
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PhaseReading {
    pub voltage: f64,
    pub current: f64,
    pub active_power: f64,
    pub reactive_power: f64,
    pub apparent_power: f64,
}

impl PhaseReading {
    fn decode(fields: &Fields) -> Self {
        Self {
            voltage: fields.float(hb::PHASE_VOLT).unwrap_or(0.0),
            current: fields.float(hb::PHASE_AMP).unwrap_or(0.0),
            active_power: fields.float(hb::PHASE_ACT_PWR).unwrap_or(0.0),
            reactive_power: fields.float(hb::PHASE_REACT_PWR).unwrap_or(0.0),
            apparent_power: fields.float(hb::PHASE_APPARENT_PWR).unwrap_or(0.0),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MpptString {
    pub power: f64,
    pub voltage: f64,
    pub current: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct InverterReading {
    /// L1, L2, L3
    pub phases: [PhaseReading; 3],
    pub grid_frequency: f64,
    /// Watts, positive while discharging.
    pub battery_inverter_power: f64,
    pub mppt_strings: Vec<MpptString>,
}

impl InverterReading {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let fields = Fields::parse(payload)?;

        let mut phases: [PhaseReading; 3] = Default::default();
        for (phase, number) in phases.iter_mut().zip(hb::PHASES) {
            if let Some(inner) = fields.message(number)? {
                *phase = PhaseReading::decode(&inner);
            }
        }

        let mut mppt_strings = Vec::new();
        if let Some(mppt) = fields.message(hb::MPPT)? {
            let strings = mppt.messages(hb::MPPT_PV)?;
            if strings.len() > MAX_MPPT_STRINGS {
                debug!(
                    "heartbeat carries {} mppt strings, keeping the first {}",
                    strings.len(),
                    MAX_MPPT_STRINGS
                );
            }
            mppt_strings = strings
                .iter()
                .take(MAX_MPPT_STRINGS)
                .map(|pv| MpptString {
                    power: pv.float(hb::PV_PWR).unwrap_or(0.0).max(0.0),
                    voltage: pv.float(hb::PV_VOL).unwrap_or(0.0),
                    current: pv.float(hb::PV_AMP).unwrap_or(0.0),
                })
                .collect();
        }

        Ok(Self {
            phases,
            grid_frequency: fields.float(hb::AC_FREQ).unwrap_or(0.0),
            battery_inverter_power: fields.float(hb::BP_POWER).unwrap_or(0.0),
            mppt_strings,
        })
    }

    pub fn solar_power(&self) -> f64 {
        self.mppt_strings.iter().map(|s| s.power).sum()
    }

    pub fn grid_power(&self) -> f64 {
        self.phases.iter().map(|p| p.active_power).sum()
    }
} // }}}

/// `bpSn` is base64 text. Anything that does not decode to UTF-8 is kept
/// as sent.
fn pack_serial(raw: &str) -> String {
    BASE64_STANDARD
        .decode(raw.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| raw.to_owned())
}

fn percent(value: Option<u64>) -> u8 {
    value.unwrap_or(0).min(100) as u8
}

#[enum_dispatch]
pub trait RecordCommon {
    fn message(&self) -> EmsMessage;

    /// Short description for trace logging.
    fn summary(&self) -> String;
}

impl RecordCommon for BatteryReport {
    fn message(&self) -> EmsMessage {
        EmsMessage::BatteryStatus
    }

    fn summary(&self) -> String {
        let indexes: Vec<String> = self.packs.iter().map(|p| p.pack_index.to_string()).collect();
        format!("battery packs [{}]", indexes.join(","))
    }
}

impl RecordCommon for EnergyStreamReading {
    fn message(&self) -> EmsMessage {
        EmsMessage::EnergyStream
    }

    fn summary(&self) -> String {
        format!(
            "energy stream solar={}W grid={}W battery={}W load={}W",
            self.solar_power, self.grid_power, self.battery_total_power, self.load_power
        )
    }
}

impl RecordCommon for InverterReading {
    fn message(&self) -> EmsMessage {
        EmsMessage::Heartbeat
    }

    fn summary(&self) -> String {
        format!(
            "heartbeat {:.2}Hz pv={}W grid={}W battery={}W",
            self.grid_frequency,
            self.solar_power(),
            self.grid_power(),
            self.battery_inverter_power
        )
    }
}

#[enum_dispatch(RecordCommon)]
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    Inverter(InverterReading),
    BatteryPacks(BatteryReport),
    EnergyStream(EnergyStreamReading),
}

/// Outcome of looking a message up in the registry.
#[derive(Clone, Debug, PartialEq)]
pub enum Dispatch {
    Record(Record),
    /// Known type carrying no payload bytes; nothing to fold.
    Empty(EmsMessage),
    /// The device sends plenty we have no use for.
    Unknown { type_family: u32, type_id: u32 },
}

pub struct Registry;

impl Registry {
    pub fn lookup(type_family: u32, type_id: u32) -> Option<EmsMessage> {
        if type_family != TYPE_FAMILY_EMS {
            return None;
        }
        EmsMessage::try_from(type_id).ok()
    }

    pub fn decode(message: &Message) -> Result<Dispatch, DecodeError> {
        let Some(kind) = Self::lookup(message.type_family, message.type_id) else {
            return Ok(Dispatch::Unknown {
                type_family: message.type_family,
                type_id: message.type_id,
            });
        };

        if message.payload.is_empty() {
            return Ok(Dispatch::Empty(kind));
        }

        let payload = &message.payload[..];
        let record: Result<Record, WireError> = match kind {
            EmsMessage::Heartbeat => InverterReading::decode(payload).map(Record::from),
            EmsMessage::BatteryStatus => BatteryReport::decode(payload).map(Record::from),
            EmsMessage::EnergyStream => EnergyStreamReading::decode(payload).map(Record::from),
        };

        record
            .map(Dispatch::Record)
            .map_err(|e| DecodeError::payload(message.type_family, message.type_id, e))
    }
}
