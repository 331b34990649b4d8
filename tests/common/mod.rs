//! Shared helpers for the HTTP and pipeline integration tests.
#![allow(dead_code)]

use axum::body::Bytes;
use axum::routing::get;
use axum::Router;
use ct_lesion_service::api::{self, AppState};
use ct_lesion_service::config::{Config, DevicePreference, FetchConfig, ModelConfig, StorageConfig};
use ct_lesion_service::gate::InferenceGate;
use ct_lesion_service::inference::Segmenter;
use ct_lesion_service::metrics;
use ct_lesion_service::pipeline::Pipeline;
use ct_lesion_service::storage::ObjectStore;
use ct_lesion_service::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array3, ArrayView5, Axis};
use std::io::Write;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

/// Intensity (HU) used for lesion voxels in synthetic scans. Maps to 1.0.
pub const LESION_HU: f32 = 300.0;

/// Voxel spacing equal to the preprocessing target, so no resampling happens.
pub const NATIVE_SPACING: [f32; 3] = [1.5, 1.5, 2.0];

/// Serialise `data` as an uncompressed single-file NIfTI-1 (`n+1`) volume.
/// With `srow` the header carries an sform; otherwise the affine is taken from
/// `pixdim`.
pub fn nifti_bytes(data: &Array3<f32>, pixdim: [f32; 3], srow: Option<[[f32; 4]; 3]>) -> Vec<u8> {
    let mut out = vec![0u8; 352];
    let put_i16 = |buf: &mut Vec<u8>, at: usize, v: i16| buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    let put_f32 = |buf: &mut Vec<u8>, at: usize, v: f32| buf[at..at + 4].copy_from_slice(&v.to_le_bytes());

    out[0..4].copy_from_slice(&348i32.to_le_bytes());
    let (nx, ny, nz) = data.dim();
    let dims = [3i16, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1];
    for (i, d) in dims.iter().enumerate() {
        put_i16(&mut out, 40 + 2 * i, *d);
    }
    put_i16(&mut out, 70, 16); // float32
    put_i16(&mut out, 72, 32);
    put_f32(&mut out, 76, 1.0);
    for (i, p) in pixdim.iter().enumerate() {
        put_f32(&mut out, 80 + 4 * i, *p);
    }
    put_f32(&mut out, 108, 352.0);
    put_f32(&mut out, 112, 1.0);

    if let Some(rows) = srow {
        put_i16(&mut out, 254, 1);
        for (r, row) in rows.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                put_f32(&mut out, 280 + 16 * r + 4 * c, *v);
            }
        }
    }
    out[344..348].copy_from_slice(b"n+1\0");

    // x varies fastest on disk
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                out.extend_from_slice(&data[[x, y, z]].to_le_bytes());
            }
        }
    }
    out
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// Soft-tissue background with the given voxels set to [`LESION_HU`].
pub fn scan_with_lesions(shape: (usize, usize, usize), lesions: &[[usize; 3]]) -> Array3<f32> {
    let mut data = Array3::<f32>::zeros(shape);
    for &[x, y, z] in lesions {
        data[[x, y, z]] = LESION_HU;
    }
    data
}

/// Serve `body` at `path` on an ephemeral port; returns the full URL.
pub async fn serve_file(path: &'static str, body: Vec<u8>) -> String {
    let body = Bytes::from(body);
    let app = Router::new().route(
        path,
        get(move || {
            let body = body.clone();
            async move { body }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}{}", addr, path)
}

/// Labels every voxel whose preprocessed intensity exceeds `threshold` as 1.
pub struct ThresholdSegmenter {
    pub threshold: f32,
}

impl Default for ThresholdSegmenter {
    fn default() -> Self {
        Self { threshold: 0.9 }
    }
}

impl Segmenter for ThresholdSegmenter {
    fn segment(&self, input: ArrayView5<'_, f32>) -> Result<Array3<u8>> {
        let image = input.index_axis_move(Axis(0), 0).index_axis_move(Axis(0), 0);
        Ok(image.mapv(|v| u8::from(v > self.threshold)))
    }
}

/// Blocks inside `segment` until the test releases it.
pub struct GatedSegmenter {
    pub entered: Arc<Notify>,
    release: Mutex<mpsc::Receiver<()>>,
    inner: ThresholdSegmenter,
}

impl GatedSegmenter {
    pub fn new() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                entered: Arc::new(Notify::new()),
                release: Mutex::new(rx),
                inner: ThresholdSegmenter::default(),
            },
            tx,
        )
    }
}

impl Segmenter for GatedSegmenter {
    fn segment(&self, input: ArrayView5<'_, f32>) -> Result<Array3<u8>> {
        self.entered.notify_one();
        let _ = self.release.lock().unwrap().recv();
        self.inner.segment(input)
    }
}

pub fn test_config(scratch: &Path) -> Config {
    Config {
        api_host: "127.0.0.1".to_string(),
        api_port: 0,
        model_config: ModelConfig {
            model_path: "model_v2.onnx".into(),
            device: DevicePreference::Cpu,
        },
        storage_config: StorageConfig::memory(),
        fetch_config: FetchConfig::default(),
        scratch_dir: scratch.to_path_buf(),
        pipeline_timeout_secs: None,
    }
}

pub struct TestApp {
    pub base_url: String,
    pub client: reqwest::Client,
    pub scratch: TempDir,
}

impl TestApp {
    pub async fn segment(&self, image_url: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/segment", self.base_url))
            .json(&serde_json::json!({ "image_url": image_url }))
            .send()
            .await
            .unwrap()
    }

    pub async fn health(&self) -> serde_json::Value {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Poll `/health` until the gate is free.
    pub async fn wait_until_idle(&self) {
        for _ in 0..200 {
            if self.health().await["busy"] == false {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        panic!("gate still held after 5s");
    }

    /// Files left behind in the scratch directory.
    pub fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.scratch.path()).unwrap().count()
    }
}

pub async fn spawn_app(segmenter: Arc<dyn Segmenter>, store: Arc<dyn ObjectStore>) -> TestApp {
    spawn_app_with_timeout(segmenter, store, None).await
}

pub async fn spawn_app_with_timeout(
    segmenter: Arc<dyn Segmenter>,
    store: Arc<dyn ObjectStore>,
    pipeline_timeout_secs: Option<u64>,
) -> TestApp {
    metrics::init_metrics();
    let scratch = tempfile::tempdir().unwrap();
    let mut config = test_config(scratch.path());
    config.pipeline_timeout_secs = pipeline_timeout_secs;

    let pipeline = Pipeline::new(&config, segmenter, store).unwrap();
    let state = AppState {
        gate: InferenceGate::new(),
        pipeline: Arc::new(pipeline),
        upload_bucket: config.storage_config.upload_bucket.clone(),
        pipeline_timeout: config.pipeline_timeout(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{}", addr),
        client: reqwest::Client::new(),
        scratch,
    }
}
