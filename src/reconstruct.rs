//! Per-source templates and fit diagnostics from a solved factorization.
//!
//! The template of source `s` in band `b` is `W[b, s] · H[s, :]`. If the data
//! were shifted by a positivity offset, the background source absorbed that
//! shift, so the offset is subtracted from the background template only.
//!
//! A peak template can also be cut into a child footprint
//! ([`Reconstruction::template_footprint`]): the connected region of pixels above
//! a threshold, in image coordinates, carrying the source's peak.

use std::collections::VecDeque;

use nalgebra::{DMatrix, DVector};

use crate::error::{DeblendError, Result};
use crate::footprint::{BoundingBox, Footprint, GridShape, Peak};
use crate::solver::{Factorization, SourceKind};

/// Default threshold for [`Reconstruction::template_footprint`].
pub const DEFAULT_FOOTPRINT_THRESHOLD: f64 = 1e-13;

/// Fit quality for one band.
#[derive(Debug, Clone, PartialEq)]
pub struct BandDiagnostics {
    pub band: usize,
    /// `Σ|W·H − A| / Σ|A|` over the band's pixels.
    pub residual_fraction: f64,
    /// Largest signed value of `W·H − A`.
    pub max_difference: f64,
    /// Smallest data value in the band.
    pub data_min: f64,
    /// Largest data value in the band.
    pub data_max: f64,
}

/// Child footprint cut from one source template.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateFootprint {
    /// Tight box around the region and the peak, in image coordinates.
    pub bbox: BoundingBox,
    /// The source's peak.
    pub peak: Peak,
    /// Template value at the peak.
    pub peak_value: f64,
    /// Region pixels `(x, y, value)` in image coordinates, row-major.
    pub pixels: Vec<(i32, i32, f64)>,
}

impl TemplateFootprint {
    /// Number of pixels in the region.
    pub fn area(&self) -> usize {
        self.pixels.len()
    }

    /// Summed template value over the region.
    pub fn flux(&self) -> f64 {
        self.pixels.iter().map(|p| p.2).sum()
    }
}

/// Read-only view of a solved factorization together with the data it models.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    data: DMatrix<f64>,
    factors: Factorization,
    offset: f64,
    shape: Option<GridShape>,
}

impl Reconstruction {
    /// `shape` is only needed for [`Reconstruction::template_image`]; when given it
    /// must match the number of pixels.
    pub fn new(
        data: DMatrix<f64>,
        factors: Factorization,
        offset: f64,
        shape: Option<GridShape>,
    ) -> Result<Self> {
        if data.shape() != (factors.num_bands(), factors.num_pixels()) {
            return Err(DeblendError::shape(
                "reconstruction data",
                format!("{}x{}", factors.num_bands(), factors.num_pixels()),
                format!("{}x{}", data.nrows(), data.ncols()),
            ));
        }
        if let Some(s) = shape {
            if s.pixels() != factors.num_pixels() {
                return Err(DeblendError::shape(
                    "reconstruction grid",
                    factors.num_pixels(),
                    format!("{} ({} pixels)", s, s.pixels()),
                ));
            }
        }
        Ok(Self {
            data,
            factors,
            offset,
            shape,
        })
    }

    pub fn factors(&self) -> &Factorization {
        &self.factors
    }

    pub fn data(&self) -> &DMatrix<f64> {
        &self.data
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn shape(&self) -> Option<GridShape> {
        self.shape
    }

    fn check_indices(&self, band: usize, source: usize) -> Result<SourceKind> {
        if band >= self.factors.num_bands() {
            return Err(DeblendError::InvalidArgument(format!(
                "band {} out of range ({} bands)",
                band,
                self.factors.num_bands()
            )));
        }
        self.factors.layout().kind(source).ok_or_else(|| {
            DeblendError::InvalidArgument(format!(
                "source {} out of range ({} sources)",
                source,
                self.factors.num_sources()
            ))
        })
    }

    /// Flattened template of `source` in `band`.
    pub fn template(&self, band: usize, source: usize) -> Result<DVector<f64>> {
        let kind = self.check_indices(band, source)?;
        let scale = self.factors.w()[(band, source)];
        let template = self.factors.h().row(source).transpose() * scale;
        Ok(match kind {
            SourceKind::Background => template.add_scalar(-self.offset),
            SourceKind::Peak(_) => template,
        })
    }

    /// Template reshaped to the footprint grid (height × width).
    pub fn template_image(&self, band: usize, source: usize) -> Result<DMatrix<f64>> {
        let shape = self.shape.ok_or(DeblendError::MissingShape)?;
        let flat = self.template(band, source)?;
        Ok(DMatrix::from_row_slice(shape.height, shape.width, flat.as_slice()))
    }

    /// Cut the template of peak `source` in `band` into a child footprint.
    ///
    /// The region is the 4-connected set of pixels with value `> thresh` that
    /// contains the peak, or the brightest such pixel when the peak itself is below
    /// the threshold. Pixels are shifted into the image coordinates of `footprint`'s
    /// box and the footprint's peak is attached with its template value.
    pub fn template_footprint(
        &self,
        footprint: &Footprint,
        band: usize,
        source: usize,
        thresh: f64,
    ) -> Result<TemplateFootprint> {
        let shape = footprint.shape();
        if shape.pixels() != self.factors.num_pixels() {
            return Err(DeblendError::shape(
                "template footprint grid",
                self.factors.num_pixels(),
                format!("{} ({} pixels)", shape, shape.pixels()),
            ));
        }
        let index = match self.check_indices(band, source)? {
            SourceKind::Peak(i) => i,
            SourceKind::Background => {
                return Err(DeblendError::InvalidArgument(
                    "the background source has no peak".into(),
                ))
            }
        };
        let peak = *footprint.peaks().get(index).ok_or_else(|| {
            DeblendError::shape("footprint peaks", index + 1, footprint.num_peaks())
        })?;

        let template = self.template(band, source)?;
        let (px, py) = footprint.relative_peaks()[index];
        let peak_index = shape.index(px, py);
        let seed = if template[peak_index] > thresh {
            Some(peak_index)
        } else {
            template
                .iter()
                .enumerate()
                .filter(|&(_, &v)| v > thresh)
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
        };
        let Some(seed) = seed else {
            return Err(DeblendError::InvalidArgument(format!(
                "no pixel of source {} in band {} exceeds {:e}",
                source, band, thresh
            )));
        };

        let region = connected_region(shape, seed, |i| template[i] > thresh);
        let origin = footprint.bbox();
        let (mut x_lo, mut y_lo, mut x_hi, mut y_hi) = (px, py, px, py);
        let pixels = region
            .iter()
            .map(|&i| {
                let (x, y) = (i % shape.width, i / shape.width);
                x_lo = x_lo.min(x);
                y_lo = y_lo.min(y);
                x_hi = x_hi.max(x);
                y_hi = y_hi.max(y);
                (origin.x0 + x as i32, origin.y0 + y as i32, template[i])
            })
            .collect();

        Ok(TemplateFootprint {
            bbox: BoundingBox::new(
                origin.x0 + x_lo as i32,
                origin.y0 + y_lo as i32,
                x_hi - x_lo + 1,
                y_hi - y_lo + 1,
            ),
            peak,
            peak_value: template[peak_index],
            pixels,
        })
    }

    /// Total flux of `source` in `band`.
    pub fn template_flux(&self, band: usize, source: usize) -> Result<f64> {
        Ok(self.template(band, source)?.sum())
    }

    /// The model `W·H` (bands × pixels).
    pub fn model(&self) -> DMatrix<f64> {
        self.factors.model()
    }

    /// `W·H − A` (bands × pixels).
    pub fn residual(&self) -> DMatrix<f64> {
        self.model() - &self.data
    }

    /// `Σ|residual| / Σ|A|` for one band.
    ///
    /// Returns 0 when both sums are zero and `+∞` when only the data sum is.
    pub fn residual_fraction(&self, band: usize) -> Result<f64> {
        if band >= self.factors.num_bands() {
            return Err(DeblendError::InvalidArgument(format!(
                "band {} out of range ({} bands)",
                band,
                self.factors.num_bands()
            )));
        }
        let residual = self.residual();
        Ok(abs_ratio(
            residual.row(band).iter().map(|v| v.abs()).sum(),
            self.data.row(band).iter().map(|v| v.abs()).sum(),
        ))
    }

    /// Diagnostics for every band, in band order.
    pub fn band_diagnostics(&self) -> Vec<BandDiagnostics> {
        let residual = self.residual();
        (0..self.factors.num_bands())
            .map(|band| {
                let r = residual.row(band);
                let d = self.data.row(band);
                BandDiagnostics {
                    band,
                    residual_fraction: abs_ratio(
                        r.iter().map(|v| v.abs()).sum(),
                        d.iter().map(|v| v.abs()).sum(),
                    ),
                    max_difference: r.max(),
                    data_min: d.min(),
                    data_max: d.max(),
                }
            })
            .collect()
    }
}

/// Flat indices of the 4-connected region around `seed` satisfying `inside`, sorted.
fn connected_region(shape: GridShape, seed: usize, inside: impl Fn(usize) -> bool) -> Vec<usize> {
    let mut visited = vec![false; shape.pixels()];
    let mut queue = VecDeque::from([seed]);
    let mut region = Vec::new();
    visited[seed] = true;
    while let Some(i) = queue.pop_front() {
        region.push(i);
        let (x, y) = (i % shape.width, i / shape.width);
        let mut neighbors = Vec::with_capacity(4);
        if x > 0 {
            neighbors.push(i - 1);
        }
        if x + 1 < shape.width {
            neighbors.push(i + 1);
        }
        if y > 0 {
            neighbors.push(i - shape.width);
        }
        if y + 1 < shape.height {
            neighbors.push(i + shape.width);
        }
        for n in neighbors {
            if !visited[n] && inside(n) {
                visited[n] = true;
                queue.push_back(n);
            }
        }
    }
    region.sort_unstable();
    region
}

fn abs_ratio(numer: f64, denom: f64) -> f64 {
    if denom == 0.0 {
        if numer == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        numer / denom
    }
}
