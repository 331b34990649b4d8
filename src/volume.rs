//! CT volumes and their NIfTI-1 loader.

use crate::error::{Result, SegmentError};
use ndarray::{Array3, ArrayD, IxDyn};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;

/// Row-major 3x4 voxel to world (RAS+ millimetre) transform.
pub type Affine = [[f64; 4]; 3];

pub const IDENTITY_AFFINE: Affine = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

/// A single-channel 3D intensity volume indexed `[x, y, z]`.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: Array3<f32>,
    pub affine: Affine,
}

impl Volume {
    pub fn new(data: Array3<f32>, affine: Affine) -> Self {
        Self { data, affine }
    }

    /// Volume with 1mm isotropic RAS voxels.
    pub fn with_identity(data: Array3<f32>) -> Self {
        Self::new(data, IDENTITY_AFFINE)
    }

    pub fn shape(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }

    /// Physical voxel size along each voxel axis (length of the affine columns).
    pub fn spacing(&self) -> [f64; 3] {
        let mut out = [0.0; 3];
        for (axis, sp) in out.iter_mut().enumerate() {
            *sp = (0..3)
                .map(|row| self.affine[row][axis].powi(2))
                .sum::<f64>()
                .sqrt();
        }
        out
    }

    /// Open a `.nii` or `.nii.gz` file. Gzip is detected from the extension.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let affine = affine_from_header(obj.header());

        let raw = obj.into_volume().into_ndarray::<f32>()?;
        // Rebuild in our own ndarray; logical order is preserved by `iter`.
        let shape = raw.shape().to_vec();
        let values: Vec<f32> = raw.iter().copied().collect();
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| SegmentError::InvalidVolume(e.to_string()))?;

        Ok(Self::new(ensure_single_channel(data)?, affine))
    }
}

/// Accept `[x, y, z]` or `[x, y, z, 1]`; anything else is not a single-channel CT.
pub fn ensure_single_channel(data: ArrayD<f32>) -> Result<Array3<f32>> {
    match data.ndim() {
        3 => data
            .into_dimensionality()
            .map_err(|e| SegmentError::InvalidVolume(e.to_string())),
        4 if data.shape()[3] == 1 => data
            .index_axis_move(ndarray::Axis(3), 0)
            .into_dimensionality()
            .map_err(|e| SegmentError::InvalidVolume(e.to_string())),
        4 => Err(SegmentError::InvalidVolume(format!(
            "expected a single channel, found {} in shape {:?}",
            data.shape()[3],
            data.shape()
        ))),
        n => Err(SegmentError::InvalidVolume(format!(
            "expected a 3D volume, found {} dimensions (shape {:?})",
            n,
            data.shape()
        ))),
    }
}

/// Voxel to world transform following the NIfTI-1 precedence: sform, then
/// qform, then pixdim scaling.
pub fn affine_from_header(header: &NiftiHeader) -> Affine {
    let pix = |i: usize| {
        let v = header.pixdim[i] as f64;
        if v > 0.0 { v } else { 1.0 }
    };

    if header.sform_code > 0 {
        let row = |r: [f32; 4]| [r[0] as f64, r[1] as f64, r[2] as f64, r[3] as f64];
        return [row(header.srow_x), row(header.srow_y), row(header.srow_z)];
    }

    if header.qform_code > 0 {
        let (b, c, d) = (
            header.quatern_b as f64,
            header.quatern_c as f64,
            header.quatern_d as f64,
        );
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let rot = [
            [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
            [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
            [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - b * b - c * c],
        ];
        let scale = [pix(1), pix(2), qfac * pix(3)];
        let offset = [
            header.quatern_x as f64,
            header.quatern_y as f64,
            header.quatern_z as f64,
        ];
        let mut out = [[0.0; 4]; 3];
        for r in 0..3 {
            for col in 0..3 {
                out[r][col] = rot[r][col] * scale[col];
            }
            out[r][3] = offset[r];
        }
        return out;
    }

    [
        [pix(1), 0.0, 0.0, 0.0],
        [0.0, pix(2), 0.0, 0.0],
        [0.0, 0.0, pix(3), 0.0],
    ]
}
