use crate::prelude::*;
use crate::energy::{EnergyChannel, EnergyTotals};
use crate::{file_error, file_error_with_source};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyConnectOptions, Any, Pool, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Durable home of the cumulative energy counters.
#[async_trait]
pub trait EnergyStore: Send + Sync {
    fn describe(&self) -> String;

    /// Stored totals; an empty store loads as all-zero.
    async fn load(&self) -> Result<EnergyTotals>;

    async fn save(&self, totals: &EnergyTotals) -> Result<()>;
}

/// Opens the store selected by the `energy` config section.
pub async fn open(config: &config::Energy) -> Result<Arc<dyn EnergyStore>> {
    match config.database_url() {
        Some(url) => Ok(Arc::new(DatabaseStore::connect(url).await?)),
        None => Ok(Arc::new(FileStore::new(config.state_file()))),
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct StoredChannel {
    channel: String,
    cumulative_kwh: f64,
}

// FileStore {{{
#[derive(Clone, Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[async_trait]
impl EnergyStore for FileStore {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn load(&self) -> Result<EnergyTotals> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no energy state at {}, starting from zero", self.path.display());
                return Ok(EnergyTotals::default());
            }
            Err(e) => {
                return Err(file_error_with_source!(e, "reading {}", self.path.display()));
            }
        };

        let stored: Vec<StoredChannel> = serde_json::from_str(&content)
            .map_err(|e| file_error_with_source!(e, "parsing {}", self.path.display()))?;

        Ok(EnergyTotals::from_records(
            stored.into_iter().map(|s| (s.channel, s.cumulative_kwh)),
        ))
    }

    async fn save(&self, totals: &EnergyTotals) -> Result<()> {
        let stored: Vec<StoredChannel> = totals
            .channels
            .iter()
            .map(|(channel, kwh)| StoredChannel {
                channel: channel.as_str().to_owned(),
                cumulative_kwh: *kwh,
            })
            .collect();
        let json = serde_json::to_string_pretty(&stored)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // write-then-rename so a crash never leaves a half-written file
        let temp = self.temp_path();
        tokio::fs::write(&temp, json)
            .await
            .map_err(|e| file_error_with_source!(e, "writing {}", temp.display()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| file_error_with_source!(e, "renaming to {}", self.path.display()))?;

        debug!("saved energy totals to {}", self.path.display());
        Ok(())
    }
} // }}}

// DatabaseStore {{{
enum DatabaseType {
    MySQL,
    Postgres,
    SQLite,
}

#[derive(Clone, Debug)]
pub struct DatabaseStore {
    url: String,
    pool: Pool<Any>,
}

impl DatabaseStore {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("connecting to energy database");
        sqlx::any::install_default_drivers();

        let options = AnyConnectOptions::from_str(url)?;
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let store = Self {
            url: url.to_owned(),
            pool,
        };
        store.migrate().await?;

        Ok(store)
    }

    fn database(&self) -> Result<DatabaseType> {
        let prefix: Vec<&str> = self.url.splitn(2, ':').collect();
        match prefix[0] {
            "sqlite" => Ok(DatabaseType::SQLite),
            "mysql" => Ok(DatabaseType::MySQL),
            "postgres" | "postgresql" => Ok(DatabaseType::Postgres),
            _ => Err(file_error!("unsupported database {}", self.url)),
        }
    }

    async fn migrate(&self) -> Result<()> {
        // validates the url scheme before touching the schema
        self.database()?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS energy_totals (\
             channel VARCHAR(64) PRIMARY KEY, \
             cumulative_kwh DOUBLE PRECISION NOT NULL, \
             updated_at BIGINT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn upsert_for_mysql() -> &'static str {
        "INSERT INTO energy_totals (channel, cumulative_kwh, updated_at) VALUES (?, ?, ?) \
         ON DUPLICATE KEY UPDATE cumulative_kwh = VALUES(cumulative_kwh), updated_at = VALUES(updated_at)"
    }

    fn upsert_for_not_mysql() -> &'static str {
        "INSERT INTO energy_totals (channel, cumulative_kwh, updated_at) VALUES ($1, $2, $3) \
         ON CONFLICT (channel) DO UPDATE SET cumulative_kwh = excluded.cumulative_kwh, updated_at = excluded.updated_at"
    }
}

#[async_trait]
impl EnergyStore for DatabaseStore {
    fn describe(&self) -> String {
        let scheme = self.url.split(':').next().unwrap_or_default();
        format!("{} database", scheme)
    }

    async fn load(&self) -> Result<EnergyTotals> {
        let rows = sqlx::query("SELECT channel, cumulative_kwh FROM energy_totals")
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let channel: String = row.try_get("channel")?;
            let kwh: f64 = row.try_get("cumulative_kwh")?;
            records.push((channel, kwh));
        }

        Ok(EnergyTotals::from_records(records))
    }

    async fn save(&self, totals: &EnergyTotals) -> Result<()> {
        let query = match self.database()? {
            DatabaseType::MySQL => Self::upsert_for_mysql(),
            _ => Self::upsert_for_not_mysql(),
        };
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        for channel in EnergyChannel::ALL {
            sqlx::query(query)
                .bind(channel.as_str())
                .bind(totals.get(channel))
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!("saved energy totals to {}", self.describe());
        Ok(())
    }
} // }}}
