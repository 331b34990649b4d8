//! Segmentation Inference Module
//!
//! Runs the pretrained 3D segmentation network (exported to ONNX) over a
//! preprocessed volume:
//! - Windows of [`ROI_SIZE`] are scanned across the volume with 25% overlap
//! - Each window is run through ONNX Runtime (batch size 1)
//! - Per-class logits are accumulated and collapsed to one label per voxel
//!
//! The network is loaded once per process and shared read-only by every
//! request; see [`SharedModel`].

use crate::config::{DevicePreference, ModelConfig};
use crate::error::{Result, SegmentError};
use ndarray::{s, Array3, Array4, Array5, ArrayView3, ArrayView5, Axis};
use once_cell::sync::OnceCell;
use ort::session::Session;
use ort::value::TensorRef;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Spatial window the network was trained on.
pub const ROI_SIZE: [usize; 3] = [96, 96, 64];

/// Background plus six anatomical/lesion classes.
pub const NUM_CLASSES: usize = 7;

/// Fraction of each window shared with its neighbour.
pub const WINDOW_OVERLAP: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda => write!(f, "cuda"),
        }
    }
}

/// Resolve the execution device once, at startup.
pub fn resolve_device(preference: DevicePreference) -> Device {
    match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => {
            if !cuda_available() {
                warn!("CUDA requested but not available; ONNX Runtime will fall back to CPU");
            }
            Device::Cuda
        }
        DevicePreference::Auto => {
            if cuda_available() {
                Device::Cuda
            } else {
                Device::Cpu
            }
        }
    }
}

#[cfg(feature = "cuda")]
fn cuda_available() -> bool {
    use ort::execution_providers::ExecutionProvider;
    ort::execution_providers::CUDAExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
}

#[cfg(not(feature = "cuda"))]
fn cuda_available() -> bool {
    false
}

/// Anything that turns a `[1, 1, X, Y, Z]` input tensor into an `[X, Y, Z]`
/// label volume.
pub trait Segmenter: Send + Sync {
    fn segment(&self, input: ArrayView5<'_, f32>) -> Result<Array3<u8>>;

    /// Whether the underlying model is loaded and ready.
    fn is_ready(&self) -> bool {
        true
    }

    fn device(&self) -> Device {
        Device::Cpu
    }
}

/// Start offsets of windows of length `roi` covering `size` (`size >= roi`).
pub fn window_starts(size: usize, roi: usize, overlap: f64) -> Vec<usize> {
    if size <= roi {
        return vec![0];
    }
    let interval = ((roi as f64 * (1.0 - overlap)) as usize).max(1);
    let count = (size - roi).div_ceil(interval) + 1;
    let mut starts: Vec<usize> = (0..count).map(|i| (i * interval).min(size - roi)).collect();
    starts.dedup();
    starts
}

/// Sliding-window segmentation of `image` with a window predictor.
///
/// `predict` receives windows shaped `[1, 1, rx, ry, rz]` and must return
/// logits shaped `[1, num_classes, rx, ry, rz]`. Axes shorter than the window
/// are zero-padded symmetrically and cropped back afterwards. Returns the label
/// volume and the number of windows evaluated.
pub fn sliding_window_segment<F>(
    image: ArrayView3<'_, f32>,
    roi: [usize; 3],
    overlap: f64,
    num_classes: usize,
    mut predict: F,
) -> Result<(Array3<u8>, usize)>
where
    F: FnMut(Array5<f32>) -> Result<Array5<f32>>,
{
    let shape = image.shape();
    let mut padded_shape = [0usize; 3];
    let mut pad_before = [0usize; 3];
    for axis in 0..3 {
        if shape[axis] == 0 {
            return Err(SegmentError::InvalidVolume(format!("empty axis in shape {:?}", shape)));
        }
        padded_shape[axis] = shape[axis].max(roi[axis]);
        pad_before[axis] = (padded_shape[axis] - shape[axis]) / 2;
    }

    let mut padded = Array3::<f32>::zeros(padded_shape);
    padded
        .slice_mut(s![
            pad_before[0]..pad_before[0] + shape[0],
            pad_before[1]..pad_before[1] + shape[1],
            pad_before[2]..pad_before[2] + shape[2]
        ])
        .assign(&image);

    let starts: Vec<Vec<usize>> = (0..3)
        .map(|axis| window_starts(padded_shape[axis], roi[axis], overlap))
        .collect();

    let mut logits = Array4::<f32>::zeros((num_classes, padded_shape[0], padded_shape[1], padded_shape[2]));
    let mut windows = 0usize;

    for &x in &starts[0] {
        for &y in &starts[1] {
            for &z in &starts[2] {
                let window = padded
                    .slice(s![x..x + roi[0], y..y + roi[1], z..z + roi[2]])
                    .to_owned()
                    .insert_axis(Axis(0))
                    .insert_axis(Axis(0));

                let output = predict(window)?;
                let expected = [1, num_classes, roi[0], roi[1], roi[2]];
                if output.shape() != expected {
                    return Err(SegmentError::Inference(format!(
                        "network returned shape {:?}, expected {:?}",
                        output.shape(),
                        expected
                    )));
                }

                let mut target = logits.slice_mut(s![.., x..x + roi[0], y..y + roi[1], z..z + roi[2]]);
                target += &output.index_axis(Axis(0), 0);
                windows += 1;
            }
        }
    }

    // Every class at a voxel is summed over the same windows, so argmax over
    // the sums equals argmax over the averaged logits.
    let labels = Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
        let (pi, pj, pk) = (i + pad_before[0], j + pad_before[1], k + pad_before[2]);
        let mut best = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for class in 0..num_classes {
            let score = logits[[class, pi, pj, pk]];
            if score > best_score {
                best_score = score;
                best = class;
            }
        }
        best as u8
    });

    Ok((labels, windows))
}

/// ONNX Runtime backed segmenter.
pub struct OnnxSegmenter {
    session: Mutex<Session>,
    model_path: PathBuf,
    device: Device,
}

impl OnnxSegmenter {
    pub fn load(config: &ModelConfig, device: Device) -> Result<Self> {
        let start = Instant::now();
        if !config.model_path.exists() {
            return Err(SegmentError::Model(format!(
                "weights file not found: {}",
                config.model_path.display()
            )));
        }

        let builder = Session::builder()
            .map_err(|e| SegmentError::Model(format!("failed to create session builder: {}", e)))?;
        let builder = match device {
            Device::Cpu => builder
                .with_execution_providers([ort::execution_providers::CPUExecutionProvider::default().build()]),
            Device::Cuda => builder.with_execution_providers([
                ort::execution_providers::CUDAExecutionProvider::default().build(),
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ]),
        }
        .map_err(|e| SegmentError::Model(format!("failed to register execution provider: {}", e)))?;

        let session = builder.commit_from_file(&config.model_path).map_err(|e| {
            SegmentError::Model(format!(
                "failed to load {}: {}",
                config.model_path.display(),
                e
            ))
        })?;

        info!(
            model_path = %config.model_path.display(),
            device = %device,
            latency_ms = start.elapsed().as_millis() as u64,
            "Segmentation model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            model_path: config.model_path.clone(),
            device,
        })
    }

    fn run_window(session: &mut Session, window: Array5<f32>) -> Result<Array5<f32>> {
        let dims: Vec<i64> = window.shape().iter().map(|&d| d as i64).collect();
        let data = window
            .as_slice()
            .ok_or_else(|| SegmentError::Inference("window tensor is not contiguous".to_string()))?;
        let tensor = TensorRef::from_array_view((dims, data))?;

        let outputs = session.run(ort::inputs![tensor])?;
        let (shape, values) = outputs[0].try_extract_tensor::<f32>()?;

        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        if dims.len() != 5 {
            return Err(SegmentError::Inference(format!(
                "network returned a rank-{} tensor, expected rank 5",
                dims.len()
            )));
        }
        Array5::from_shape_vec((dims[0], dims[1], dims[2], dims[3], dims[4]), values.to_vec())
            .map_err(|e| SegmentError::Inference(e.to_string()))
    }
}

impl Segmenter for OnnxSegmenter {
    fn segment(&self, input: ArrayView5<'_, f32>) -> Result<Array3<u8>> {
        let start = Instant::now();
        if input.shape()[0] != 1 || input.shape()[1] != 1 {
            return Err(SegmentError::Inference(format!(
                "expected a [1, 1, X, Y, Z] input, got {:?}",
                input.shape()
            )));
        }
        let image = input.index_axis_move(Axis(0), 0).index_axis_move(Axis(0), 0);

        let mut session = self
            .session
            .lock()
            .map_err(|_| SegmentError::Inference("model session lock poisoned".to_string()))?;

        debug!(model_path = %self.model_path.display(), shape = ?image.shape(), "Starting sliding-window inference");

        let (labels, windows) = sliding_window_segment(image, ROI_SIZE, WINDOW_OVERLAP, NUM_CLASSES, |window| {
            Self::run_window(&mut session, window)
        })?;

        crate::metrics::INFERENCE_WINDOWS.inc_by(windows as u64);
        info!(
            windows = windows,
            device = %self.device,
            latency_ms = start.elapsed().as_millis() as u64,
            "Inference completed successfully"
        );
        Ok(labels)
    }

    fn device(&self) -> Device {
        self.device
    }
}

/// Process-wide model handle.
///
/// Loading is attempted eagerly through [`SharedModel::warm_up`]; when that
/// fails (weights not yet mounted, for instance) each request retries.
pub struct SharedModel {
    config: ModelConfig,
    device: Device,
    model: OnceCell<OnnxSegmenter>,
}

impl SharedModel {
    pub fn new(config: ModelConfig, device: Device) -> Self {
        Self {
            config,
            device,
            model: OnceCell::new(),
        }
    }

    pub fn warm_up(&self) -> Result<()> {
        self.get().map(|_| ())
    }

    fn get(&self) -> Result<&OnnxSegmenter> {
        self.model
            .get_or_try_init(|| OnnxSegmenter::load(&self.config, self.device))
    }
}

impl Segmenter for SharedModel {
    fn segment(&self, input: ArrayView5<'_, f32>) -> Result<Array3<u8>> {
        self.get()?.segment(input)
    }

    fn is_ready(&self) -> bool {
        self.model.get().is_some()
    }

    fn device(&self) -> Device {
        self.device
    }
}

// ============================================================================
// Tests
// ============================================================================
