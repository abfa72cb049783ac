use crate::prelude::*;

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::aggregator::{AggregatorConfig, SocPolicy};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub mqtt: Mqtt,

    #[serde(default)]
    pub device: Device,

    #[serde(default)]
    pub energy: Energy,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    /// Optional path to append published snapshots as JSON lines
    pub datalog_file: Option<String>,
}

// Mqtt {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_mqtt_host")]
    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    #[serde(default = "Config::default_enabled")]
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,

    /// Device serial number; selects the property topic.
    pub serial: String,
    /// Account id, enables the data request after each connect.
    pub user_id: Option<String>,

    pub keep_alive_secs: Option<u64>,
    pub reconnect_delay_secs: Option<u64>,

    /// How often the data request is repeated while connected.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "request_interval_secs", default = "Config::default_request_interval")]
    pub request_interval: Duration,
}
impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("powerocean-bridge-{}", self.serial))
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn user_id(&self) -> &Option<String> {
        &self.user_id
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.unwrap_or(60))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs.unwrap_or(5))
    }

    pub fn request_interval(&self) -> Duration {
        self.request_interval
    }

    pub fn property_topic(&self) -> String {
        format!("/app/device/property/{}", self.serial)
    }

    pub fn get_topic(&self) -> Option<String> {
        self.user_id
            .as_ref()
            .map(|user| format!("/app/{}/{}/thing/property/get", user, self.serial))
    }
} // }}}

// Device {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Device {
    #[serde(default = "Config::default_num_battery_packs")]
    pub num_battery_packs: u8,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "staleness_secs", default = "Config::default_staleness")]
    pub staleness: Duration,

    #[serde(default)]
    pub soc_policy: SocPolicy,

    #[serde(default = "Config::default_nominal_pack_capacity_wh")]
    pub nominal_pack_capacity_wh: f64,
}
impl Default for Device {
    fn default() -> Self {
        Self {
            num_battery_packs: Config::default_num_battery_packs(),
            staleness: Config::default_staleness(),
            soc_policy: SocPolicy::default(),
            nominal_pack_capacity_wh: Config::default_nominal_pack_capacity_wh(),
        }
    }
}
impl Device {
    pub fn num_battery_packs(&self) -> u8 {
        self.num_battery_packs
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    pub fn soc_policy(&self) -> SocPolicy {
        self.soc_policy
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            expected_packs: self.num_battery_packs,
            staleness: self.staleness,
            soc_policy: self.soc_policy,
            nominal_pack_capacity_wh: self.nominal_pack_capacity_wh,
        }
    }
} // }}}

// Energy {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Energy {
    #[serde(default = "Config::default_state_file")]
    pub state_file: PathBuf,

    /// Takes precedence over `state_file` when set.
    pub database_url: Option<String>,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "persist_interval_secs", default = "Config::default_persist_interval")]
    pub persist_interval: Duration,

    /// Intervals longer than this are not integrated. Off unless set.
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(rename = "max_gap_secs", default)]
    pub max_gap: Option<Duration>,
}
impl Default for Energy {
    fn default() -> Self {
        Self {
            state_file: Config::default_state_file(),
            database_url: None,
            persist_interval: Config::default_persist_interval(),
            max_gap: None,
        }
    }
}
impl Energy {
    pub fn state_file(&self) -> &PathBuf {
        &self.state_file
    }

    pub fn database_url(&self) -> &Option<String> {
        &self.database_url
    }

    pub fn persist_interval(&self) -> Duration {
        self.persist_interval
    }

    pub fn max_gap(&self) -> Option<Duration> {
        self.max_gap
    }
} // }}}

#[derive(Clone, Debug)]
pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mqtt(&self) -> Mqtt {
        self.lock().mqtt.clone()
    }

    pub fn device(&self) -> Device {
        self.lock().device.clone()
    }

    pub fn energy(&self) -> Energy {
        self.lock().energy.clone()
    }

    pub fn loglevel(&self) -> String {
        self.lock().loglevel.clone()
    }

    pub fn datalog_file(&self) -> Option<String> {
        self.lock().datalog_file.clone()
    }

    pub fn log(&self) {
        self.lock().log();
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("config.rs:error reading {}: {}", file, err))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn log(&self) {
        info!("Configuration loaded successfully:");

        info!("  MQTT: {}", if self.mqtt.enabled { "enabled" } else { "disabled" });
        if self.mqtt.enabled {
            info!("    Host: {}", self.mqtt.host);
            info!("    Port: {}", self.mqtt.port);
            info!("    TLS: {}", self.mqtt.tls);
            info!("    Client ID: {}", self.mqtt.client_id());
            info!("    Serial: {}", self.mqtt.serial);
            match self.mqtt.user_id {
                Some(_) => info!("    Data request: every {}s", self.mqtt.request_interval.as_secs()),
                None => info!("    Data request: disabled"),
            }
            info!("    Keep Alive: {}s", self.mqtt.keep_alive().as_secs());
            info!("    Reconnect Delay: {}s", self.mqtt.reconnect_delay().as_secs());
        }

        info!("  Device:");
        info!("    Battery Packs: {}", self.device.num_battery_packs);
        info!("    Staleness: {}s", self.device.staleness.as_secs());
        info!("    SOC Policy: {:?}", self.device.soc_policy);
        info!("    Nominal Pack Capacity: {}Wh", self.device.nominal_pack_capacity_wh);

        info!("  Energy:");
        match &self.energy.database_url {
            Some(url) => info!("    Store: database {}", url),
            None => info!("    Store: file {}", self.energy.state_file.display()),
        }
        info!("    Persist Interval: {}s", self.energy.persist_interval.as_secs());
        match self.energy.max_gap {
            Some(gap) => info!("    Max Gap: {}s", gap.as_secs()),
            None => info!("    Max Gap: disabled"),
        }

        info!("  Datalog File: {}", self.datalog_file.as_deref().unwrap_or("disabled"));
        info!("  Log Level: {}", self.loglevel);
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                return Err(anyhow!("config.rs:MQTT host cannot be empty"));
            }
            if self.mqtt.serial.is_empty() {
                return Err(anyhow!("config.rs:MQTT serial cannot be empty"));
            }
        }

        if !(1..=crate::ecoflow::payload::MAX_PACKS).contains(&self.device.num_battery_packs) {
            bail!(
                "device.num_battery_packs must be between 1 and {}",
                crate::ecoflow::payload::MAX_PACKS
            );
        }
        if self.device.staleness.is_zero() {
            return Err(anyhow!("config.rs:device.staleness_secs cannot be 0"));
        }
        let capacity = self.device.nominal_pack_capacity_wh;
        if capacity.is_nan() || capacity <= 0.0 {
            return Err(anyhow!("config.rs:device.nominal_pack_capacity_wh must be positive"));
        }

        if let Some(db) = &self.energy.database_url {
            if let Err(e) = url::Url::parse(db) {
                return Err(anyhow!("config.rs:Invalid database URL: {}", e));
            }
        }
        if self.energy.persist_interval.is_zero() {
            return Err(anyhow!("config.rs:energy.persist_interval_secs cannot be 0"));
        }
        if self.energy.max_gap.is_some_and(|gap| gap.is_zero()) {
            return Err(anyhow!("config.rs:energy.max_gap_secs cannot be 0"));
        }
        if self.mqtt.request_interval.is_zero() {
            return Err(anyhow!("config.rs:mqtt.request_interval_secs cannot be 0"));
        }

        Ok(())
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_mqtt_host() -> String {
        "mqtt-e.ecoflow.com".to_string()
    }

    fn default_mqtt_port() -> u16 {
        8883
    }

    fn default_request_interval() -> Duration {
        Duration::from_secs(300)
    }

    fn default_num_battery_packs() -> u8 {
        2
    }

    fn default_staleness() -> Duration {
        Duration::from_secs(300)
    }

    fn default_nominal_pack_capacity_wh() -> f64 {
        5120.0
    }

    fn default_state_file() -> PathBuf {
        PathBuf::from("energy_state.json")
    }

    fn default_persist_interval() -> Duration {
        Duration::from_secs(60)
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}
