//! Slice selection and overlay rendering.

use crate::error::Result;
use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{ArrayView2, ArrayView3, Axis};
use serde::Serialize;
use std::io::Cursor;

/// Label value treated as lesion.
pub const LESION_LABEL: u8 = 1;

/// Overlays rendered per plane.
pub const TOP_SLICES: usize = 3;

/// Guards the per-slice normalisation against flat slices.
const NORM_EPSILON: f32 = 1e-8;

pub const RED: [f32; 3] = [1.0, 0.0, 0.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Plane {
    Axial,
    Coronal,
    Sagittal,
}

impl Plane {
    pub const ALL: [Plane; 3] = [Plane::Axial, Plane::Coronal, Plane::Sagittal];

    /// Volume axis held constant while slicing (volume is `[x, y, z]` RAS).
    pub fn axis(self) -> Axis {
        match self {
            Plane::Axial => Axis(2),
            Plane::Coronal => Axis(1),
            Plane::Sagittal => Axis(0),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Plane::Axial => "axial",
            Plane::Coronal => "coronal",
            Plane::Sagittal => "sagittal",
        }
    }
}

impl std::fmt::Display for Plane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceArea {
    pub index: usize,
    pub area: usize,
}

/// Per-slice count of voxels equal to `label` along `plane`'s axis.
pub fn slice_areas(labels: ArrayView3<'_, u8>, plane: Plane, label: u8) -> Vec<SliceArea> {
    labels
        .axis_iter(plane.axis())
        .enumerate()
        .map(|(index, slice)| SliceArea {
            index,
            area: slice.iter().filter(|&&v| v == label).count(),
        })
        .collect()
}

/// The `limit` slices with the largest nonzero lesion area, largest first.
/// Equal areas keep ascending index order.
pub fn select_top_slices(labels: ArrayView3<'_, u8>, plane: Plane, limit: usize) -> Vec<SliceArea> {
    let mut areas: Vec<SliceArea> = slice_areas(labels, plane, LESION_LABEL)
        .into_iter()
        .filter(|s| s.area > 0)
        .collect();
    // sort_by is stable
    areas.sort_by(|a, b| b.area.cmp(&a.area));
    areas.truncate(limit);
    areas
}

/// RGB raster with channels in `[0, 1]`, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<[f32; 3]>,
}

impl Overlay {
    pub fn pixel(&self, row: usize, col: usize) -> [f32; 3] {
        self.pixels[row * self.width + col]
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        // truncates, not rounds
        let quantize = |v: f32| (v.clamp(0.0, 1.0) * 255.0) as u8;
        RgbImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let [r, g, b] = self.pixel(y as usize, x as usize);
            Rgb([quantize(r), quantize(g), quantize(b)])
        })
    }

    pub fn encode_png(&self) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        self.to_rgb_image().write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    }
}

/// Grayscale intensity normalised by the slice's own range, with lesion
/// pixels painted pure red. Rows follow the slice's first axis.
pub fn render_overlay(image: ArrayView2<'_, f32>, mask: ArrayView2<'_, u8>) -> Overlay {
    debug_assert_eq!(image.shape(), mask.shape());
    let (height, width) = image.dim();

    let (min, max) = image
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min + NORM_EPSILON;

    let mut pixels = Vec::with_capacity(height * width);
    for (&v, &m) in image.iter().zip(mask.iter()) {
        if m == LESION_LABEL {
            pixels.push(RED);
        } else {
            let g = (v - min) / range;
            pixels.push([g, g, g]);
        }
    }

    Overlay { width, height, pixels }
}

/// Top lesion slices of one plane, rendered.
pub fn render_plane(
    image: ArrayView3<'_, f32>,
    labels: ArrayView3<'_, u8>,
    plane: Plane,
) -> Vec<(SliceArea, Overlay)> {
    select_top_slices(labels, plane, TOP_SLICES)
        .into_iter()
        .map(|selected| {
            let img = image.index_axis(plane.axis(), selected.index);
            let mask = labels.index_axis(plane.axis(), selected.index);
            (selected, render_overlay(img, mask))
        })
        .collect()
}
