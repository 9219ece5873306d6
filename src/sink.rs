use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::warn;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{schema::Observation, util};

#[derive(Debug, Error)]
pub enum LogWriteError {
    #[error("log file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not encode observation: {0}")]
    Encode(#[from] serde_json::Error),
}

/// LogSink durably appends observations.
///
/// CONTRACT:
/// - `append` is all-or-nothing: a reader never sees a half record
/// - Errors are returned, never retried by the sink
///
#[async_trait::async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, output_dir: &Path, observation: &Observation) -> Result<(), LogWriteError>;
}

// ------------------------------------------------------------
// JSON file sink
// ------------------------------------------------------------
//
// One pretty-printed JSON array per market per local day:
//
//     <output_dir>/<safe_slug>_<YYYY-MM-DD>.json
//
// Each append rewrites the array through a temp file + rename,
// so the file on disk is always a complete array.
//
#[derive(Default)]
pub struct JsonFileSink {
    write_lock: Mutex<()>,
}

impl JsonFileSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_for(output_dir: &Path, instrument_key: &str, date: &str) -> PathBuf {
        output_dir.join(format!("{}_{}.json", util::safe_file_stem(instrument_key), date))
    }
}

#[async_trait::async_trait]
impl LogSink for JsonFileSink {
    async fn append(&self, output_dir: &Path, observation: &Observation) -> Result<(), LogWriteError> {
        let _guard = self.write_lock.lock().await;

        let path = Self::file_for(output_dir, &observation.instrument_key, &util::today());
        let io_err = |source: std::io::Error| LogWriteError::Io {
            path: path.display().to_string(),
            source,
        };

        tokio::fs::create_dir_all(output_dir).await.map_err(io_err)?;

        let mut records: Vec<serde_json::Value> = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    warn!("[SINK] {} is not a JSON array ({}), starting a fresh one", path.display(), e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(io_err(e)),
        };

        records.push(serde_json::to_value(observation)?);
        let encoded = serde_json::to_vec_pretty(&records)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &encoded).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;

        Ok(())
    }
}
