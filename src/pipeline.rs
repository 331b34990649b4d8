//! Segmentation Pipeline
//!
//! One request end to end: fetch → preprocess → infer → select & render →
//! upload. CPU-bound stages run on the blocking pool; the caller is expected
//! to already hold the inference gate.

use crate::config::Config;
use crate::error::{Result, SegmentError};
use crate::fetch::Fetcher;
use crate::inference::Segmenter;
use crate::metrics::{Timer, OVERLAYS_UPLOADED};
use crate::overlay::{render_plane, Plane, SliceArea};
use crate::preprocess::{load_and_prepare, PreparedVolume};
use crate::storage::{overlay_object_name, ObjectStore};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Public overlay URLs grouped by plane, most lesion area first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationResult {
    pub axial: Vec<String>,
    pub coronal: Vec<String>,
    pub sagittal: Vec<String>,
}

impl SegmentationResult {
    pub fn plane_mut(&mut self, plane: Plane) -> &mut Vec<String> {
        match plane {
            Plane::Axial => &mut self.axial,
            Plane::Coronal => &mut self.coronal,
            Plane::Sagittal => &mut self.sagittal,
        }
    }
}

/// A rendered slice ready for upload.
#[derive(Debug, Clone)]
pub struct RenderedSlice {
    pub plane: Plane,
    pub slice: SliceArea,
    pub png: Vec<u8>,
}

/// Select and encode the top slices of every plane, in plane order.
pub fn render_overlays(prepared: &PreparedVolume, labels: &Array3<u8>) -> Result<Vec<RenderedSlice>> {
    if prepared.image.shape() != labels.shape() {
        return Err(SegmentError::Inference(format!(
            "label volume {:?} does not match image {:?}",
            labels.shape(),
            prepared.image.shape()
        )));
    }

    let mut rendered = Vec::new();
    for plane in Plane::ALL {
        for (slice, overlay) in render_plane(prepared.image.view(), labels.view(), plane) {
            debug!(plane = %plane, index = slice.index, area = slice.area, "Selected slice");
            rendered.push(RenderedSlice {
                plane,
                slice,
                png: overlay.encode_png()?,
            });
        }
    }
    Ok(rendered)
}

pub struct Pipeline {
    fetcher: Fetcher,
    segmenter: Arc<dyn Segmenter>,
    store: Arc<dyn ObjectStore>,
    prefix: String,
    scratch_dir: PathBuf,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        segmenter: Arc<dyn Segmenter>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        Ok(Self {
            fetcher: Fetcher::new(&config.fetch_config, config.scratch_dir.clone())?,
            segmenter,
            store,
            prefix: config.storage_config.prefix.clone(),
            scratch_dir: config.scratch_dir.clone(),
        })
    }

    pub fn segmenter(&self) -> &Arc<dyn Segmenter> {
        &self.segmenter
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub async fn run(&self, url: &str) -> Result<SegmentationResult> {
        let total = Timer::new();
        info!(url = %url, "Starting segmentation");

        let timer = Timer::new();
        let scratch = self.fetcher.fetch(url).await?;
        timer.observe_stage("fetch");

        let segmenter = Arc::clone(&self.segmenter);
        let rendered = tokio::task::spawn_blocking(move || -> Result<Vec<RenderedSlice>> {
            let timer = Timer::new();
            let prepared = load_and_prepare(scratch.path())?;
            // The downloaded file is no longer needed once it is in memory.
            drop(scratch);
            timer.observe_stage("preprocess");

            let timer = Timer::new();
            let labels = segmenter.segment(prepared.to_input_tensor().view())?;
            timer.observe_stage("inference");

            let timer = Timer::new();
            let rendered = render_overlays(&prepared, &labels)?;
            timer.observe_stage("render");
            Ok(rendered)
        })
        .await??;

        let timer = Timer::new();
        let result = self.upload(rendered).await?;
        timer.observe_stage("upload");

        info!(
            url = %url,
            axial = result.axial.len(),
            coronal = result.coronal.len(),
            sagittal = result.sagittal.len(),
            latency_ms = total.elapsed_ms(),
            "Segmentation completed"
        );
        Ok(result)
    }

    async fn upload(&self, rendered: Vec<RenderedSlice>) -> Result<SegmentationResult> {
        let mut result = SegmentationResult::default();
        for item in rendered {
            let file = tempfile::Builder::new()
                .prefix("overlay-")
                .suffix(".png")
                .tempfile_in(&self.scratch_dir)?;
            tokio::fs::write(file.path(), &item.png).await?;

            let object = overlay_object_name(&self.prefix, item.plane.as_str(), &uuid::Uuid::new_v4());
            self.store.put_file(&object, file.path(), "image/png").await?;
            OVERLAYS_UPLOADED.with_label_values(&[item.plane.as_str()]).inc();

            let url = self.store.public_url(&object);
            debug!(plane = %item.plane, index = item.slice.index, url = %url, "Uploaded overlay");
            result.plane_mut(item.plane).push(url);
        }
        Ok(result)
    }
}
