//! JSON station catalog
//!
//! A single JSON file holding stations, their weekly schedules and program
//! titles:
//!
//! ```json
//! {
//!   "stations": [
//!     {
//!       "id": "radio-one",
//!       "name": "Radio One",
//!       "stream_url": "http://stream.example/live",
//!       "timezone": "+03:00",
//!       "schedule": { "monday": [{ "program_id": "news", "start_time": "09:00", "end_time": "10:00" }] }
//!     }
//!   ],
//!   "programs": { "news": "Morning News" }
//! }
//! ```
//!
//! The file is re-read on every call so edits apply without a restart.

use super::{ScheduleStore, StationSource, StoreError};
use crate::schedule::{Station, WeeklySchedule};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub stations: Vec<CatalogStation>,

    /// Program id to display title
    #[serde(default)]
    pub programs: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogStation {
    #[serde(flatten)]
    pub station: Station,

    #[serde(default)]
    pub schedule: WeeklySchedule,
}

/// Catalog stored as a JSON file
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    path: PathBuf,
}

impl JsonCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the catalog file
    pub async fn load(&self) -> Result<CatalogFile, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!(
                    "station catalog {}",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let catalog: CatalogFile = serde_json::from_str(&content)?;
        tracing::debug!(
            "Loaded {} stations from {:?}",
            catalog.stations.len(),
            self.path
        );
        Ok(catalog)
    }

    async fn find(&self, station_id: &str) -> Result<Option<CatalogStation>, StoreError> {
        Ok(self
            .load()
            .await?
            .stations
            .into_iter()
            .find(|entry| entry.station.id == station_id))
    }
}

#[async_trait]
impl StationSource for JsonCatalog {
    async fn list_active_stations(&self) -> Result<Vec<Station>, StoreError> {
        Ok(self
            .load()
            .await?
            .stations
            .into_iter()
            .map(|entry| entry.station)
            .filter(|station| station.is_active)
            .collect())
    }

    async fn get_station(&self, station_id: &str) -> Result<Option<Station>, StoreError> {
        Ok(self.find(station_id).await?.map(|entry| entry.station))
    }
}

#[async_trait]
impl ScheduleStore for JsonCatalog {
    async fn get_schedule(&self, station_id: &str) -> Result<Option<WeeklySchedule>, StoreError> {
        Ok(self.find(station_id).await?.map(|entry| entry.schedule))
    }

    async fn program_title(&self, program_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.load().await?.programs.remove(program_id))
    }
}
