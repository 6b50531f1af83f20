//! Assemble the band × pixel data matrix for a footprint.
//!
//! Each band of an already-loaded exposure is cropped to the footprint's bounding
//! box and flattened (row-major) into one row of the data matrix. Mask and variance
//! planes are cropped the same way when every band provides them.
//!
//! The multiplicative update requires non-negative data, so
//! [`FootprintData::with_positivity_offset`] can shift the whole matrix by a single
//! scalar. The offset is recorded and undone for the background source at
//! reconstruction time.

use nalgebra::DMatrix;

use crate::error::{DeblendError, Result};
use crate::footprint::{BoundingBox, Footprint};

/// Mask plane bits flagging pixels whose variance should not be trusted.
pub mod mask_bits {
    pub const BAD: u32 = 1 << 0;
    pub const SAT: u32 = 1 << 1;
    pub const CR: u32 = 1 << 3;
    pub const SUSPECT: u32 = 1 << 7;
    pub const NO_DATA: u32 = 1 << 8;

    /// Union of the bits treated as unusable by default.
    pub const DEFAULT_BAD: u32 = BAD | CR | NO_DATA | SAT | SUSPECT;
}

/// One band of a calibrated exposure, in row-major order.
#[derive(Debug, Clone)]
pub struct BandImage {
    /// Image-coordinate box covered by the pixel arrays.
    pub bbox: BoundingBox,
    /// Pixel values (length `bbox.area()`).
    pub image: Vec<f64>,
    /// Optional mask plane (length `bbox.area()`).
    pub mask: Option<Vec<u32>>,
    /// Optional variance plane (length `bbox.area()`).
    pub variance: Option<Vec<f64>>,
}

impl BandImage {
    /// Band with pixel values only.
    pub fn new(bbox: BoundingBox, image: Vec<f64>) -> Self {
        Self {
            bbox,
            image,
            mask: None,
            variance: None,
        }
    }

    fn validate(&self, band: usize) -> Result<()> {
        let area = self.bbox.area();
        let check = |name: &str, len: usize| -> Result<()> {
            if len != area {
                return Err(DeblendError::InvalidArgument(format!(
                    "band {} {} plane has {} pixels, expected {} ({}x{})",
                    band, name, len, area, self.bbox.width, self.bbox.height
                )));
            }
            Ok(())
        };
        check("image", self.image.len())?;
        if let Some(m) = &self.mask {
            check("mask", m.len())?;
        }
        if let Some(v) = &self.variance {
            check("variance", v.len())?;
        }
        Ok(())
    }

    /// Copy the pixels of `target` (which must lie inside this band) in row-major order.
    fn crop<T: Copy>(&self, plane: &[T], target: &BoundingBox) -> Vec<T> {
        let dx = (target.x0 - self.bbox.x0) as usize;
        let dy = (target.y0 - self.bbox.y0) as usize;
        let mut out = Vec::with_capacity(target.area());
        for row in 0..target.height {
            let start = (row + dy) * self.bbox.width + dx;
            out.extend_from_slice(&plane[start..start + target.width]);
        }
        out
    }
}

/// Data, mask and variance matrices for one footprint.
///
/// All matrices are bands × pixels in the footprint's row-major pixel order.
#[derive(Debug, Clone)]
pub struct FootprintData {
    data: DMatrix<f64>,
    mask: Option<DMatrix<u32>>,
    variance: Option<DMatrix<f64>>,
    offset: f64,
}

impl FootprintData {
    /// Wrap an already-assembled bands × pixels data matrix.
    pub fn new(data: DMatrix<f64>) -> Self {
        Self {
            data,
            mask: None,
            variance: None,
            offset: 0.0,
        }
    }

    /// Crop every band to the footprint's bounding box.
    ///
    /// Mask and variance matrices are only produced if every band carries the plane.
    pub fn assemble(bands: &[BandImage], footprint: &Footprint) -> Result<Self> {
        if bands.is_empty() {
            return Err(DeblendError::InvalidArgument(
                "at least one band is required".into(),
            ));
        }
        let target = footprint.bbox();
        for (n, band) in bands.iter().enumerate() {
            band.validate(n)?;
            if !band.bbox.contains_box(target) {
                return Err(DeblendError::InvalidArgument(format!(
                    "footprint box {:?} is not contained in band {} box {:?}",
                    target, n, band.bbox
                )));
            }
        }

        let pixels = target.area();
        let mut data = DMatrix::<f64>::zeros(bands.len(), pixels);
        for (n, band) in bands.iter().enumerate() {
            let row = band.crop(&band.image, target);
            data.row_mut(n).copy_from_slice(&row);
        }

        let mask = if bands.iter().all(|b| b.mask.is_some()) {
            let mut m = DMatrix::<u32>::zeros(bands.len(), pixels);
            for (n, band) in bands.iter().enumerate() {
                let plane = band.mask.as_deref().unwrap_or_default();
                m.row_mut(n).copy_from_slice(&band.crop(plane, target));
            }
            Some(m)
        } else {
            None
        };

        let variance = if bands.iter().all(|b| b.variance.is_some()) {
            let mut v = DMatrix::<f64>::zeros(bands.len(), pixels);
            for (n, band) in bands.iter().enumerate() {
                let plane = band.variance.as_deref().unwrap_or_default();
                v.row_mut(n).copy_from_slice(&band.crop(plane, target));
            }
            Some(v)
        } else {
            None
        };

        Ok(Self {
            data,
            mask,
            variance,
            offset: 0.0,
        })
    }

    /// The (possibly offset) bands × pixels data matrix.
    pub fn data(&self) -> &DMatrix<f64> {
        &self.data
    }

    pub fn mask(&self) -> Option<&DMatrix<u32>> {
        self.mask.as_ref()
    }

    pub fn variance(&self) -> Option<&DMatrix<f64>> {
        self.variance.as_ref()
    }

    /// Scalar added to every data value, 0 if none.
    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn num_bands(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_pixels(&self) -> usize {
        self.data.ncols()
    }

    /// Shift the data so that no value is negative.
    ///
    /// If any entry is negative, every entry is increased by `-min(data)` and that
    /// amount is recorded as the offset. Otherwise the data is returned unchanged
    /// with an offset of zero. Offsets do not accumulate: the shift is always
    /// computed relative to the unshifted data.
    pub fn with_positivity_offset(&self) -> Self {
        let raw = self.data.add_scalar(-self.offset);
        let min = raw.min();
        let offset = if min < 0.0 { -min } else { 0.0 };
        Self {
            data: raw.add_scalar(offset),
            mask: self.mask.clone(),
            variance: self.variance.clone(),
            offset,
        }
    }

    /// Variance with every pixel whose mask intersects `bad_bits` set to zero.
    ///
    /// Returns `None` if no variance plane was assembled. Without a mask plane
    /// the variance is returned unchanged.
    pub fn masked_variance(&self, bad_bits: u32) -> Option<DMatrix<f64>> {
        let variance = self.variance.as_ref()?;
        let Some(mask) = &self.mask else {
            return Some(variance.clone());
        };
        Some(variance.zip_map(mask, |v, m| if m & bad_bits != 0 { 0.0 } else { v }))
    }
}
