use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use homectl_common::{PersistedSettings, RuntimeConfig};

#[derive(Debug, Default, Serialize, Deserialize)]
struct AlarmFile {
    #[serde(default)]
    alarms: Vec<String>,
}

/// JSON files under the data directory. One lock serialises every read and write.
#[derive(Clone)]
pub struct AppStore {
    runtime_path: Arc<PathBuf>,
    alarms_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("HOMECTL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.homectl"));
        Self::new(data_dir)
    }

    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            alarms_path: Arc::new(data_dir.join("alarms.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        self.read_runtime().await
    }

    pub async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        self.write_runtime(runtime).await
    }

    /// Replaces the persisted settings and keeps the rest of the runtime file.
    pub async fn update_settings(&self, settings: PersistedSettings) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut runtime = self.read_runtime().await?;
        runtime.settings = settings;
        self.write_runtime(&runtime).await
    }

    /// Stored alarm strings, or `None` when no alarm file exists yet.
    pub async fn load_alarms(&self) -> anyhow::Result<Option<Vec<String>>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.alarms_path.as_ref()).await {
            Ok(raw) => {
                let file = serde_json::from_slice::<AlarmFile>(&raw)
                    .with_context(|| format!("invalid {}", self.alarms_path.display()))?;
                Ok(Some(file.alarms))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes the alarm list sorted and deduplicated, replacing the previous file
    /// in one rename.
    pub async fn save_alarms(&self, alarms: &[String]) -> anyhow::Result<()> {
        let mut alarms = alarms.to_vec();
        alarms.sort();
        alarms.dedup();

        let _guard = self.lock.lock().await;
        let payload = serde_json::to_vec_pretty(&AlarmFile { alarms })?;
        write_replacing(self.alarms_path.as_ref(), &payload).await
    }

    async fn read_runtime(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid {}", self.runtime_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_runtime(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let payload = serde_json::to_vec_pretty(runtime)?;
        write_replacing(self.runtime_path.as_ref(), &payload).await
    }
}

async fn write_replacing(path: &Path, payload: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, payload)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
