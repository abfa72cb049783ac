use crate::prelude::*;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::aggregator::Snapshot;
use crate::coordinator::Coordinator;
use crate::energy::EnergyTotals;
use crate::liveness::ConnectionState;

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Shutdown,
}

/// Appends every published snapshot to a file as one JSON line.
#[derive(Debug, Clone)]
pub struct DatalogWriter {
    file: Arc<Mutex<std::fs::File>>,
    path: String,
    channels: Channels,
    records_written: Arc<Mutex<u64>>,
}

impl DatalogWriter {
    pub fn new(path: &str, channels: Channels) -> Result<Self> {
        info!("Opening datalog file at {}", path);

        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                error!("Failed to open datalog file {}: {}", path, e);
                return Err(e.into());
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)) {
                error!("Failed to set permissions on datalog file {}: {}", path, e);
                return Err(e.into());
            }
        }

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: path.to_string(),
            channels,
            records_written: Arc::new(Mutex::new(0)),
        })
    }

    pub fn write_snapshot(
        &self,
        serial: &str,
        connection: ConnectionState,
        snapshot: &Snapshot,
        totals: &EnergyTotals,
    ) -> Result<()> {
        let line = serde_json::json!({
            "utc_timestamp": chrono::Utc::now().timestamp(),
            "serial": serial,
            "connection": connection,
            "snapshot": snapshot,
            "energy_kwh": totals.channels,
        });
        let json_string = serde_json::to_string(&line)?;

        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("Failed to lock datalog file"))?;
        if let Err(e) = writeln!(file, "{}", json_string).and_then(|_| file.flush()) {
            error!("Failed to write to datalog file {}: {}", self.path, e);
            return Err(e.into());
        }

        let mut written = self
            .records_written
            .lock()
            .map_err(|_| anyhow!("Failed to lock records counter"))?;
        *written += 1;
        debug!("Total snapshots stored in datalog file: {}", *written);

        Ok(())
    }

    /// Writes a line after every snapshot change until shutdown.
    pub async fn start(&self, coordinator: Coordinator, serial: String) -> Result<()> {
        let mut control = self.channels.to_datalog.subscribe();
        let mut snapshots = coordinator.subscribe();

        loop {
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    if let Err(e) = self.write_snapshot(
                        &serial,
                        coordinator.connection_state(),
                        &snapshot,
                        &coordinator.energy_totals(),
                    ) {
                        warn!("datalog write failed: {}", e);
                    }
                }
                _ = control.recv() => break,
            }
        }

        info!("datalog writer exiting");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_datalog.send(ChannelData::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecoflow::payload::BatteryPackReading;
    use crate::aggregator::Timestamped;
    use crate::energy::EnergyChannel;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_snapshot() -> Result<()> {
        let temp_file = NamedTempFile::new()?;
        let writer = DatalogWriter::new(temp_file.path().to_str().unwrap(), Channels::new())?;

        let mut snapshot = Snapshot {
            total_soc: Some(55.0),
            total_remaining_energy: 2816.0,
            ..Default::default()
        };
        snapshot.packs.insert(
            0,
            Timestamped {
                reading: BatteryPackReading {
                    state_of_charge: 55,
                    remaining_energy: 2816.0,
                    ..Default::default()
                },
                received_at: chrono::Utc::now(),
            },
        );
        let mut totals = EnergyTotals::default();
        totals.set(EnergyChannel::Solar, 1.25);

        writer.write_snapshot("HJ31", ConnectionState::Connected, &snapshot, &totals)?;
        writer.write_snapshot("HJ31", ConnectionState::Disconnected, &snapshot, &totals)?;

        let contents = std::fs::read_to_string(temp_file.path())?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let json: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(json["serial"], "HJ31");
        assert_eq!(json["connection"], "connected");
        assert_eq!(json["snapshot"]["total_soc"], 55.0);
        assert_eq!(json["snapshot"]["packs"]["0"]["reading"]["state_of_charge"], 55);
        assert_eq!(json["energy_kwh"]["solar"], 1.25);

        let json: serde_json::Value = serde_json::from_str(lines[1])?;
        assert_eq!(json["connection"], "disconnected");

        Ok(())
    }
}
