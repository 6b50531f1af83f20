//! Footprints: the pixel region shared by a blend of sources, plus its peaks.
//!
//! # Coordinate conventions
//!
//! - **Image coordinates**: absolute integer pixel positions `(x, y)` in the parent
//!   exposure. +X is right (increasing column), +Y is down (increasing row).
//! - **Grid coordinates**: positions relative to the footprint's bounding-box origin,
//!   so `(0, 0)` is the top-left pixel of the box.
//! - **Flat index**: grid pixel `(x, y)` maps to `y * width + x`. Every data, intensity
//!   and operator matrix in this crate uses this row-major ordering.

use std::ops::Range;

use crate::error::{DeblendError, Result};

/// Height and width of a footprint's pixel grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    /// Number of rows.
    pub height: usize,
    /// Number of columns.
    pub width: usize,
}

impl GridShape {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// Total number of pixels (`height * width`).
    pub fn pixels(&self) -> usize {
        self.height * self.width
    }

    /// Row-major flat index of grid pixel `(x, y)`.
    #[inline]
    pub fn index(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }
}

impl std::fmt::Display for GridShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// Axis-aligned bounding box in image coordinates.
///
/// The origin is the top-left pixel; the box covers columns
/// `x0..x0 + width` and rows `y0..y0 + height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x0: i32,
    pub y0: i32,
    pub width: usize,
    pub height: usize,
}

impl BoundingBox {
    pub fn new(x0: i32, y0: i32, width: usize, height: usize) -> Self {
        Self {
            x0,
            y0,
            width,
            height,
        }
    }

    pub fn shape(&self) -> GridShape {
        GridShape::new(self.height, self.width)
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    /// One past the last column.
    pub fn x_end(&self) -> i64 {
        self.x0 as i64 + self.width as i64
    }

    /// One past the last row.
    pub fn y_end(&self) -> i64 {
        self.y0 as i64 + self.height as i64
    }

    /// Returns `true` if the image pixel `(x, y)` lies inside the box.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        (x as i64) >= self.x0 as i64
            && (x as i64) < self.x_end()
            && (y as i64) >= self.y0 as i64
            && (y as i64) < self.y_end()
    }

    /// Returns `true` if `other` lies entirely inside this box.
    pub fn contains_box(&self, other: &BoundingBox) -> bool {
        other.x0 >= self.x0
            && other.y0 >= self.y0
            && other.x_end() <= self.x_end()
            && other.y_end() <= self.y_end()
    }

    /// Grid coordinates of an image pixel, or `None` if it lies outside the box.
    pub fn relative(&self, x: i32, y: i32) -> Option<(usize, usize)> {
        if !self.contains(x, y) {
            return None;
        }
        Some(((x - self.x0) as usize, (y - self.y0) as usize))
    }

    /// Clipped overlap between this box and `other`.
    ///
    /// Returns `None` when the boxes do not intersect. Otherwise returns the column
    /// and row ranges of the overlap expressed in both boxes' grid coordinates.
    pub fn overlap(&self, other: &BoundingBox) -> Option<Overlap> {
        let x_lo = (self.x0 as i64).max(other.x0 as i64);
        let y_lo = (self.y0 as i64).max(other.y0 as i64);
        let x_hi = self.x_end().min(other.x_end());
        let y_hi = self.y_end().min(other.y_end());
        if x_lo >= x_hi || y_lo >= y_hi {
            return None;
        }

        let span = |lo: i64, hi: i64, origin: i32| -> Range<usize> {
            (lo - origin as i64) as usize..(hi - origin as i64) as usize
        };

        Some(Overlap {
            self_cols: span(x_lo, x_hi, self.x0),
            self_rows: span(y_lo, y_hi, self.y0),
            other_cols: span(x_lo, x_hi, other.x0),
            other_rows: span(y_lo, y_hi, other.y0),
        })
    }
}

/// Overlap of two bounding boxes in each box's own grid coordinates.
///
/// `self_cols.len() == other_cols.len()` and `self_rows.len() == other_rows.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlap {
    pub self_cols: Range<usize>,
    pub self_rows: Range<usize>,
    pub other_cols: Range<usize>,
    pub other_rows: Range<usize>,
}

/// A detected local maximum marking one source, in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peak {
    pub x: i32,
    pub y: i32,
}

impl Peak {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// A blended detection: bounding box plus the ordered peaks inside it.
///
/// Source `k` of every factorization built for this footprint corresponds to
/// `peaks()[k]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    bbox: BoundingBox,
    peaks: Vec<Peak>,
}

impl Footprint {
    /// Create a footprint, checking that the box is non-empty and every peak lies inside it.
    pub fn new(bbox: BoundingBox, peaks: Vec<Peak>) -> Result<Self> {
        if bbox.width == 0 || bbox.height == 0 {
            return Err(DeblendError::InvalidArgument(format!(
                "footprint bounding box is empty ({}x{})",
                bbox.width, bbox.height
            )));
        }
        if let Some(p) = peaks.iter().find(|p| !bbox.contains(p.x, p.y)) {
            return Err(DeblendError::InvalidArgument(format!(
                "peak ({}, {}) lies outside the footprint box [{}..{}) x [{}..{})",
                p.x,
                p.y,
                bbox.x0,
                bbox.x_end(),
                bbox.y0,
                bbox.y_end()
            )));
        }
        Ok(Self { bbox, peaks })
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn shape(&self) -> GridShape {
        self.bbox.shape()
    }

    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }

    pub fn num_peaks(&self) -> usize {
        self.peaks.len()
    }

    /// Peak positions in grid coordinates, in peak order.
    pub fn relative_peaks(&self) -> Vec<(usize, usize)> {
        self.peaks
            .iter()
            .map(|p| ((p.x - self.bbox.x0) as usize, (p.y - self.bbox.y0) as usize))
            .collect()
    }
}
