//! Initial colour and intensity matrices from per-source seed templates.
//!
//! The seed templates come from an external template builder (typically a
//! symmetric-template deblender). Each source gets one spatial profile per band;
//! these are averaged into one intensity row, and the colour matrix is then the
//! least-squares solution of `A ≈ W·H`:
//!
//! ```text
//! H[k]  = mean over bands of template[k][band]
//! H[bg] = offset                       (when a background row is requested)
//! W     = A · pinv(H)
//! W[:,k] /= Σ W[:,k],   H[k] *= Σ W[:,k]   (Σ = 0 → factor 1)
//! ```
//!
//! The pseudoinverse is needed because `H` is often rank deficient when peaks sit
//! close together or when there are few bands.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{DeblendError, Result};
use crate::footprint::{BoundingBox, Footprint};
use crate::solver::{normalize_columns, pseudo_inverse, ColumnSum, Factorization, SourceLayout};

/// One band of a seed template with its own bounding box.
#[derive(Debug, Clone)]
pub struct TemplateImage {
    /// Image-coordinate box covered by `pixels`.
    pub bbox: BoundingBox,
    /// Row-major template values (length `bbox.area()`).
    pub pixels: Vec<f64>,
}

/// Seed spatial profiles for one source, one per band, on the footprint grid.
#[derive(Debug, Clone)]
pub struct SourceTemplate {
    bands: Vec<DVector<f64>>,
}

impl SourceTemplate {
    /// Wrap per-band profiles that are already flattened on the footprint grid.
    pub fn new(bands: Vec<DVector<f64>>) -> Self {
        Self { bands }
    }

    /// Paste per-band template images into the footprint grid.
    ///
    /// Template pixels outside the footprint box are dropped; footprint pixels the
    /// template does not cover are zero.
    pub fn from_images(footprint: &Footprint, images: &[TemplateImage]) -> Result<Self> {
        let fp_box = footprint.bbox();
        let shape = footprint.shape();
        let mut bands = Vec::with_capacity(images.len());
        for (n, img) in images.iter().enumerate() {
            if img.pixels.len() != img.bbox.area() {
                return Err(DeblendError::InvalidArgument(format!(
                    "template band {} has {} pixels, expected {}",
                    n,
                    img.pixels.len(),
                    img.bbox.area()
                )));
            }
            let mut profile = DVector::<f64>::zeros(shape.pixels());
            if let Some(ov) = fp_box.overlap(&img.bbox) {
                for (fy, ty) in ov.self_rows.clone().zip(ov.other_rows.clone()) {
                    for (fx, tx) in ov.self_cols.clone().zip(ov.other_cols.clone()) {
                        profile[shape.index(fx, fy)] = img.pixels[ty * img.bbox.width + tx];
                    }
                }
            }
            bands.push(profile);
        }
        Ok(Self { bands })
    }

    pub fn num_bands(&self) -> usize {
        self.bands.len()
    }

    pub fn bands(&self) -> &[DVector<f64>] {
        &self.bands
    }

    /// Unweighted mean of the per-band profiles.
    pub fn mean_profile(&self, pixels: usize) -> DVector<f64> {
        if self.bands.is_empty() {
            return DVector::zeros(pixels);
        }
        let sum = self
            .bands
            .iter()
            .fold(DVector::<f64>::zeros(pixels), |acc, b| acc + b);
        sum / self.bands.len() as f64
    }
}

/// Whether to append a synthetic background source to the factorization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Background {
    /// Peaks only.
    Excluded,
    /// Append a background row initialised to the data offset.
    Included { offset: f64 },
}

impl Background {
    pub fn is_included(&self) -> bool {
        matches!(self, Background::Included { .. })
    }
}

/// Build the normalised initial `(W, H)` pair.
///
/// `templates[k]` seeds peak source `k`; each must provide one profile per data band,
/// each of length `data.ncols()`.
pub fn initial_factorization(
    data: &DMatrix<f64>,
    templates: &[SourceTemplate],
    background: Background,
) -> Result<Factorization> {
    let bands = data.nrows();
    let pixels = data.ncols();
    let layout = SourceLayout::new(templates.len(), background.is_included());

    for (k, t) in templates.iter().enumerate() {
        if t.num_bands() != bands {
            return Err(DeblendError::shape(
                "seed template bands",
                bands,
                format!("{} (source {})", t.num_bands(), k),
            ));
        }
        if let Some(b) = t.bands().iter().find(|b| b.len() != pixels) {
            return Err(DeblendError::shape(
                "seed template pixels",
                pixels,
                format!("{} (source {})", b.len(), k),
            ));
        }
    }
    if layout.is_empty() {
        return Err(DeblendError::InvalidArgument(
            "at least one source is required".into(),
        ));
    }

    let mut h = DMatrix::<f64>::zeros(layout.len(), pixels);
    for (k, t) in templates.iter().enumerate() {
        h.row_mut(k).tr_copy_from(&t.mean_profile(pixels));
    }
    if let Background::Included { offset } = background {
        h.row_mut(layout.len() - 1).fill(offset);
    }

    let w = data * pseudo_inverse(&h);
    let (w, h) = normalize_columns(w, h, ColumnSum::Signed);

    debug!(
        "Initial estimate: {} bands, {} pixels, {} peaks, background={}",
        bands,
        pixels,
        templates.len(),
        layout.has_background()
    );

    Factorization::new(w, h, layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::footprint::Peak;

    #[test]
    fn test_from_images_clips_to_footprint() {
        let fp = Footprint::new(BoundingBox::new(10, 10, 4, 3), vec![Peak::new(11, 11)]).unwrap();
        // 3x3 template centred on (10, 10): a third of it hangs off the top-left
        let img = TemplateImage {
            bbox: BoundingBox::new(9, 9, 3, 3),
            pixels: (1..=9).map(|v| v as f64).collect(),
        };
        let t = SourceTemplate::from_images(&fp, &[img]).unwrap();
        let p = &t.bands()[0];
        // Footprint (0,0) <- template (1,1) = 5
        assert_eq!(p[0], 5.0);
        assert_eq!(p[1], 6.0);
        assert_eq!(p[4], 8.0);
        assert_eq!(p[5], 9.0);
        assert_eq!(p[2], 0.0);
        assert_eq!(p[8], 0.0);
        assert_eq!(p.sum(), 28.0);
    }

    #[test]
    fn test_template_length_checked() {
        let fp = Footprint::new(BoundingBox::new(0, 0, 2, 2), vec![]).unwrap();
        let img = TemplateImage {
            bbox: BoundingBox::new(0, 0, 2, 2),
            pixels: vec![1.0; 3],
        };
        assert!(SourceTemplate::from_images(&fp, &[img]).is_err());
    }

    #[test]
    fn test_columns_normalized_and_product_preserved() {
        // Two sources with disjoint support, three bands
        let h_true = DMatrix::from_row_slice(2, 4, &[1.0, 2.0, 0.0, 0.0, 0.0, 0.0, 3.0, 1.0]);
        let w_true = DMatrix::from_row_slice(3, 2, &[2.0, 1.0, 4.0, 1.0, 2.0, 6.0]);
        let data = &w_true * &h_true;

        let templates: Vec<SourceTemplate> = (0..2)
            .map(|k| SourceTemplate::new(vec![h_true.row(k).transpose(); 3]))
            .collect();
        let f = initial_factorization(&data, &templates, Background::Excluded).unwrap();

        for k in 0..2 {
            let s: f64 = f.w().column(k).sum();
            assert!((s - 1.0).abs() < 1e-10, "column {} sums to {}", k, s);
        }
        let diff = (f.w() * f.h() - &data).abs().max();
        assert!(diff < 1e-9, "W·H differs from data by {}", diff);
    }

    #[test]
    fn test_template_count_mismatch() {
        let data = DMatrix::<f64>::zeros(2, 4);
        let bad = SourceTemplate::new(vec![DVector::zeros(4)]);
        let err = initial_factorization(&data, &[bad], Background::Excluded).unwrap_err();
        assert!(matches!(err, DeblendError::ShapeMismatch { .. }));

        let none = initial_factorization(&data, &[], Background::Excluded).unwrap_err();
        assert!(matches!(none, DeblendError::InvalidArgument(_)));
    }
}
