pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::io::Write;
pub use std::str::FromStr;
pub use tokio::sync::{broadcast, watch};

pub use crate::{
    aggregator, channels::Channels, config, config::Config, config::ConfigWrapper, coordinator,
    datalog_writer, ecoflow, energy, error::DecodeError, liveness, mqtt, options::Options,
    scheduler, store,
};
