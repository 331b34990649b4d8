//! Model input preparation.
//!
//! Runs the fixed transform chain over a loaded [`Volume`]: resample to the
//! training spacing, reorient to RAS, then window the intensities to [0, 1].

use crate::error::{Result, SegmentError};
use crate::volume::{Affine, Volume};
use ndarray::{Array3, Array5, Axis};
use std::path::Path;
use tracing::debug;

/// Target voxel spacing in millimetres.
pub const TARGET_SPACING: [f64; 3] = [1.5, 1.5, 2.0];

/// Soft-tissue intensity window (HU) mapped onto [0, 1].
pub const INTENSITY_MIN: f32 = -57.0;
pub const INTENSITY_MAX: f32 = 164.0;

/// Output of preprocessing: the normalised volume plus the affine it lives in.
#[derive(Debug, Clone)]
pub struct PreparedVolume {
    pub image: Array3<f32>,
    pub affine: Affine,
}

impl PreparedVolume {
    /// Model input with batch and channel axes, `[1, 1, X, Y, Z]`.
    pub fn to_input_tensor(&self) -> Array5<f32> {
        self.image.clone().insert_axis(Axis(0)).insert_axis(Axis(0))
    }
}

pub fn load_and_prepare(path: &Path) -> Result<PreparedVolume> {
    let volume = Volume::open(path)?;
    debug!(shape = ?volume.shape(), spacing = ?volume.spacing(), "Loaded volume");
    prepare(volume)
}

pub fn prepare(volume: Volume) -> Result<PreparedVolume> {
    if volume.data.iter().any(|v| !v.is_finite()) {
        return Err(SegmentError::InvalidVolume(
            "volume contains NaN or infinite intensities".to_string(),
        ));
    }

    let resampled = resample(&volume, TARGET_SPACING);
    let oriented = reorient_to_ras(&resampled)?;
    let image = scale_intensity(oriented.data, INTENSITY_MIN, INTENSITY_MAX);

    debug!(shape = ?image.shape(), "Prepared model input");
    Ok(PreparedVolume {
        image,
        affine: oriented.affine,
    })
}

/// Trilinear resampling onto `target` spacing. The output keeps the first
/// voxel centre and covers `round((n - 1) * old / new) + 1` voxels per axis
/// (ties to even); sample positions beyond the grid clamp to the border.
pub fn resample(volume: &Volume, target: [f64; 3]) -> Volume {
    let spacing = volume.spacing();
    let shape = volume.shape();

    let mut out_shape = [0usize; 3];
    let mut step = [0f64; 3];
    for axis in 0..3 {
        // extent measured between the centres of the first and last voxel
        let span = shape[axis].saturating_sub(1) as f64 * spacing[axis] / target[axis];
        out_shape[axis] = span.round_ties_even() as usize + 1;
        step[axis] = target[axis] / spacing[axis];
    }

    if out_shape == shape && step.iter().all(|s| (s - 1.0).abs() < 1e-9) {
        return volume.clone();
    }

    let src = &volume.data;
    let coords: Vec<Vec<(usize, usize, f32)>> = (0..3)
        .map(|axis| {
            (0..out_shape[axis])
                .map(|o| lerp_coord(o as f64 * step[axis], shape[axis]))
                .collect()
        })
        .collect();

    let data = Array3::from_shape_fn(out_shape, |(i, j, k)| {
        let (x0, x1, fx) = coords[0][i];
        let (y0, y1, fy) = coords[1][j];
        let (z0, z1, fz) = coords[2][k];

        let c00 = src[[x0, y0, z0]] * (1.0 - fx) + src[[x1, y0, z0]] * fx;
        let c10 = src[[x0, y1, z0]] * (1.0 - fx) + src[[x1, y1, z0]] * fx;
        let c01 = src[[x0, y0, z1]] * (1.0 - fx) + src[[x1, y0, z1]] * fx;
        let c11 = src[[x0, y1, z1]] * (1.0 - fx) + src[[x1, y1, z1]] * fx;

        let c0 = c00 * (1.0 - fy) + c10 * fy;
        let c1 = c01 * (1.0 - fy) + c11 * fy;
        c0 * (1.0 - fz) + c1 * fz
    });

    let mut affine = volume.affine;
    for (axis, s) in step.iter().enumerate() {
        for row in affine.iter_mut() {
            row[axis] *= s;
        }
    }

    Volume::new(data, affine)
}

fn lerp_coord(pos: f64, len: usize) -> (usize, usize, f32) {
    let max = (len - 1) as f64;
    let pos = pos.clamp(0.0, max);
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(len - 1);
    (lo, hi, (pos - lo as f64) as f32)
}

/// Permute and flip voxel axes so that axis 0 points Right, 1 Anterior and
/// 2 Superior.
pub fn reorient_to_ras(volume: &Volume) -> Result<Volume> {
    let affine = &volume.affine;

    // world axis each voxel axis is most aligned with, and its direction
    let mut world_of = [0usize; 3];
    let mut flip = [false; 3];
    let mut taken = [false; 3];
    for voxel_axis in 0..3 {
        let (world, value) = (0..3)
            .filter(|w| !taken[*w])
            .map(|w| (w, affine[w][voxel_axis]))
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .ok_or_else(|| SegmentError::InvalidVolume("degenerate affine".to_string()))?;
        if value == 0.0 {
            return Err(SegmentError::InvalidVolume(
                "affine has a zero direction column".to_string(),
            ));
        }
        taken[world] = true;
        world_of[voxel_axis] = world;
        flip[voxel_axis] = value < 0.0;
    }

    let mut data = volume.data.clone();
    let mut new_affine = *affine;
    let shape = volume.shape();
    for voxel_axis in 0..3 {
        if flip[voxel_axis] {
            data.invert_axis(Axis(voxel_axis));
            // new index i corresponds to old index (n - 1 - i)
            let n = (shape[voxel_axis] - 1) as f64;
            for row in new_affine.iter_mut() {
                row[3] += row[voxel_axis] * n;
                row[voxel_axis] = -row[voxel_axis];
            }
        }
    }

    // output axis w takes the voxel axis that maps to world axis w
    let mut perm = [0usize; 3];
    for (voxel_axis, &world) in world_of.iter().enumerate() {
        perm[world] = voxel_axis;
    }
    let data = data.permuted_axes(perm).as_standard_layout().into_owned();

    let mut affine_out = [[0.0; 4]; 3];
    for row in 0..3 {
        for (out_axis, &src_axis) in perm.iter().enumerate() {
            affine_out[row][out_axis] = new_affine[row][src_axis];
        }
        affine_out[row][3] = new_affine[row][3];
    }

    Ok(Volume::new(data, affine_out))
}

/// Clip to `[a_min, a_max]` and map linearly onto `[0, 1]`.
pub fn scale_intensity(mut data: Array3<f32>, a_min: f32, a_max: f32) -> Array3<f32> {
    let range = a_max - a_min;
    data.mapv_inplace(|v| ((v - a_min) / range).clamp(0.0, 1.0));
    data
}
