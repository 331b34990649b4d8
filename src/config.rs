use crate::error::{Result, SegmentError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BUCKET: &str = "tomographies";
pub const DEFAULT_PREFIX: &str = "ct-overlays";
pub const DEFAULT_UPLOAD_ENDPOINT: &str = "https://storage.googleapis.com/upload/storage/v1/b";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub model_config: ModelConfig,
    pub storage_config: StorageConfig,
    pub fetch_config: FetchConfig,
    pub scratch_dir: PathBuf,
    /// Bounds how long `/segment` waits for the pipeline. `None` waits forever.
    pub pipeline_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    pub device: DevicePreference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Auto,
    Cpu,
    Cuda,
}

impl std::str::FromStr for DevicePreference {
    type Err = SegmentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(SegmentError::Config(format!(
                "INFERENCE_DEVICE must be one of auto, cpu, cuda (got `{}`)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Gcs,
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = SegmentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gcs" => Ok(Self::Gcs),
            "memory" => Ok(Self::Memory),
            other => Err(SegmentError::Config(format!(
                "STORAGE_BACKEND must be gcs or memory (got `{}`)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub credentials_path: PathBuf,
    pub bucket: String,
    pub prefix: String,
    /// Bucket that signed upload URLs point at.
    pub upload_bucket: String,
    pub upload_timeout_secs: u64,
    /// Base of the JSON API media upload endpoint; objects go to `{endpoint}/{bucket}/o`.
    pub upload_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_volume_bytes: u64,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_volume_bytes: 1024 * 1024 * 1024, // 1GB
        }
    }
}

impl StorageConfig {
    /// In-memory storage rooted at the default bucket; used by local runs and tests.
    pub fn memory() -> Self {
        Self {
            backend: StorageBackend::Memory,
            credentials_path: PathBuf::from("gcp_credentials.json"),
            bucket: DEFAULT_BUCKET.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            upload_bucket: DEFAULT_BUCKET.to_string(),
            upload_timeout_secs: 60,
            upload_endpoint: DEFAULT_UPLOAD_ENDPOINT.to_string(),
        }
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let api_port = parse_or("API_PORT", 8000u16);

        // Model configuration
        let model_path = env::var("MODEL_PATH").unwrap_or_else(|_| "model_v2.onnx".to_string());
        let device = env::var("INFERENCE_DEVICE")
            .unwrap_or_else(|_| "auto".to_string())
            .parse()?;

        // Storage configuration
        let backend = env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "gcs".to_string())
            .parse()?;
        let credentials_path =
            env::var("GCP_CREDENTIALS_PATH").unwrap_or_else(|_| "gcp_credentials.json".to_string());
        let bucket = env::var("GCS_BUCKET").unwrap_or_else(|_| DEFAULT_BUCKET.to_string());
        let prefix = env::var("GCS_PREFIX").unwrap_or_else(|_| DEFAULT_PREFIX.to_string());
        let upload_bucket = env::var("UPLOAD_BUCKET").unwrap_or_else(|_| bucket.clone());
        let upload_endpoint = env::var("GCS_UPLOAD_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_UPLOAD_ENDPOINT.to_string());

        let fetch_defaults = FetchConfig::default();

        let scratch_dir = env::var("SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir());

        let pipeline_timeout_secs = env::var("PIPELINE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .filter(|&secs: &u64| secs > 0);

        Ok(Self {
            api_host,
            api_port,
            model_config: ModelConfig {
                model_path: PathBuf::from(model_path),
                device,
            },
            storage_config: StorageConfig {
                backend,
                credentials_path: PathBuf::from(credentials_path),
                bucket,
                prefix: prefix.trim_matches('/').to_string(),
                upload_bucket,
                upload_timeout_secs: parse_or("UPLOAD_TIMEOUT_SECS", 60),
                upload_endpoint: upload_endpoint.trim_end_matches('/').to_string(),
            },
            fetch_config: FetchConfig {
                timeout_secs: parse_or("DOWNLOAD_TIMEOUT_SECS", fetch_defaults.timeout_secs),
                max_volume_bytes: parse_or("MAX_VOLUME_BYTES", fetch_defaults.max_volume_bytes),
            },
            scratch_dir,
            pipeline_timeout_secs,
        })
    }

    pub fn pipeline_timeout(&self) -> Option<Duration> {
        self.pipeline_timeout_secs.map(Duration::from_secs)
    }
}
