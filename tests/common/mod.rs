#![allow(dead_code)]

pub use powerocean_bridge::coordinator::Coordinator;
pub use powerocean_bridge::prelude::*;

use chrono::{DateTime, TimeZone, Utc};
use powerocean_bridge::ecoflow::payload::TYPE_FAMILY_EMS;
use powerocean_bridge::ecoflow::wire::FieldWriter;
use powerocean_bridge::ecoflow::{Frame, Header};

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fixed base time so tests can step through readings deterministically.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(secs)
}

/// One `bpSta` entry as the device sends it.
#[derive(Clone, Debug)]
pub struct Pack {
    /// 1-based source index; 0 marks a non-pack entry.
    pub source: u64,
    pub soc: u64,
    pub soh: u64,
    pub power: f32,
    pub remaining_wh: f32,
    pub serial: String,
}

impl Pack {
    pub fn new(source: u64, soc: u64, remaining_wh: f32) -> Self {
        Self {
            source,
            soc,
            soh: 100,
            power: 0.0,
            remaining_wh,
            serial: format!("BP{:03}", source),
        }
    }

    pub fn power(mut self, watts: f32) -> Self {
        self.power = watts;
        self
    }

    fn writer(&self) -> FieldWriter {
        FieldWriter::new()
            .float(1, self.power)
            .varint(2, self.soc)
            .varint(3, self.soh)
            .float(9, 51.2)
            .varint(15, self.source)
            .string(16, &self.serial)
            .varint(17, 42)
            .float(25, 21.5)
            .float(54, self.remaining_wh)
    }
}

pub struct Factory;

impl Factory {
    pub fn config() -> ConfigWrapper {
        Self::config_yaml("")
    }

    /// Transport disabled; `extra` is appended to the YAML document.
    pub fn config_yaml(extra: &str) -> ConfigWrapper {
        let yaml = format!("mqtt:\n  enabled: false\n  serial: TEST0001\n{}", extra);
        ConfigWrapper::from_config(Config::from_yaml(&yaml).unwrap())
    }

    pub fn battery_status(packs: &[Pack]) -> Vec<u8> {
        packs
            .iter()
            .fold(FieldWriter::new(), |w, pack| w.message(1, pack.writer()))
            .finish()
    }

    pub fn energy_stream(solar: f32, grid: f32, battery: f32, load: f32) -> Vec<u8> {
        FieldWriter::new()
            .float(1, load)
            .float(2, grid)
            .float(3, solar)
            .float(4, battery)
            .varint(5, 55)
            .finish()
    }

    /// Three phases sharing `grid` equally, one MPPT string carrying `solar`.
    pub fn heartbeat(solar: f32, grid: f32, battery: f32) -> Vec<u8> {
        let phase = || {
            FieldWriter::new()
                .float(1, 230.0)
                .float(2, 1.0)
                .float(3, grid / 3.0)
        };
        FieldWriter::new()
            .message(1, phase())
            .message(2, phase())
            .message(3, phase())
            .message(
                4,
                FieldWriter::new().message(
                    1,
                    FieldWriter::new().float(1, 400.0).float(2, 1.0).float(3, solar),
                ),
            )
            .float(5, 50.0)
            .float(59, battery)
            .finish()
    }

    pub fn header(type_id: u32, sequence: u64, plaintext: &[u8]) -> Header {
        Header::encrypted(TYPE_FAMILY_EMS, type_id, sequence, plaintext)
    }

    pub fn frame(headers: Vec<Header>) -> Vec<u8> {
        Frame::new(headers).encode()
    }

    pub fn packs_frame(sequence: u64, packs: &[Pack]) -> Vec<u8> {
        Self::frame(vec![Self::header(7, sequence, &Self::battery_status(packs))])
    }

    pub fn stream_frame(sequence: u64, solar: f32, grid: f32, battery: f32, load: f32) -> Vec<u8> {
        Self::frame(vec![Self::header(
            33,
            sequence,
            &Self::energy_stream(solar, grid, battery, load),
        )])
    }

    pub fn coordinator() -> Coordinator {
        Coordinator::new(Self::config(), Channels::new())
    }
}
