//! Integration tests: build synthetic blends from known colours and profiles,
//! deblend them, and check that the factorization recovers the inputs.

use nalgebra::{DMatrix, DVector};
use nmf_deblender::{
    deblend, initial_factorization, BandImage, Background, BoundingBox, Constraint,
    DeblendConfig, Footprint, FootprintData, GridShape, Peak, Reconstruction, SourceKind,
    SourceTemplate, TemplateImage, UpdateRule,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

/// Circular Gaussian profile on a grid, peak value `amplitude`.
fn gaussian(shape: GridShape, cx: f64, cy: f64, sigma: f64, amplitude: f64) -> DVector<f64> {
    DVector::from_fn(shape.pixels(), |i, _| {
        let x = (i % shape.width) as f64;
        let y = (i / shape.width) as f64;
        let r2 = (x - cx).powi(2) + (y - cy).powi(2);
        amplitude * (-r2 / (2.0 * sigma * sigma)).exp()
    })
}

/// Two-source blend in three bands on a 15x11 grid.
struct Blend {
    footprint: Footprint,
    seds: DMatrix<f64>,
    profiles: Vec<DVector<f64>>,
}

impl Blend {
    fn new() -> Self {
        let footprint = Footprint::new(
            BoundingBox::new(200, 300, 15, 11),
            vec![Peak::new(204, 305), Peak::new(210, 305)],
        )
        .unwrap();
        let shape = footprint.shape();
        let profiles = vec![
            gaussian(shape, 4.0, 5.0, 1.5, 20.0),
            gaussian(shape, 10.0, 5.0, 1.2, 12.0),
        ];
        // Columns sum to 1: a red source and a blue source
        let seds = DMatrix::from_row_slice(3, 2, &[0.2, 0.5, 0.3, 0.3, 0.5, 0.2]);
        Self {
            footprint,
            seds,
            profiles,
        }
    }

    fn intensity(&self) -> DMatrix<f64> {
        let pixels = self.footprint.shape().pixels();
        DMatrix::from_fn(self.profiles.len(), pixels, |k, p| self.profiles[k][p])
    }

    fn data(&self) -> DMatrix<f64> {
        &self.seds * self.intensity()
    }

    fn true_flux(&self, band: usize, source: usize) -> f64 {
        self.seds[(band, source)] * self.profiles[source].sum()
    }

    /// Per-band seeds: the true profile, slightly broadened differently in each band.
    fn seeds(&self) -> Vec<SourceTemplate> {
        self.profiles
            .iter()
            .map(|p| {
                let bands = (0..3)
                    .map(|b| p.map(|v| v.powf(0.9 + 0.05 * b as f64)))
                    .collect();
                SourceTemplate::new(bands)
            })
            .collect()
    }
}

#[test]
fn test_centered_peak_with_background_seed() {
    init_tracing();

    // 2 bands, 5x5 footprint, one peak at the exact centre
    let footprint = Footprint::new(BoundingBox::new(0, 0, 5, 5), vec![Peak::new(2, 2)]).unwrap();
    let shape = footprint.shape();
    let band0 = gaussian(shape, 2.0, 2.0, 1.0, 10.0);
    let band1 = gaussian(shape, 2.0, 2.0, 1.4, 6.0);
    let seed = SourceTemplate::new(vec![band0.clone(), band1.clone()]);
    let mean = (&band0 + &band1) / 2.0;

    let offset = 2.0;
    let h_true = DMatrix::from_fn(2, 25, |k, p| if k == 0 { mean[p] } else { offset });
    let w_true = DMatrix::from_row_slice(2, 2, &[0.35, 0.45, 0.65, 0.55]);
    let data = &w_true * &h_true;

    let f = initial_factorization(&data, &[seed], Background::Included { offset }).unwrap();
    assert_eq!(f.layout().kind(1), Some(SourceKind::Background));

    for p in 0..25 {
        assert!(
            (f.h()[(0, p)] - mean[p]).abs() < 1e-9,
            "peak row differs from averaged template at pixel {}",
            p
        );
        assert!((f.h()[(1, p)] - offset).abs() < 1e-9);
    }
    let err = (f.model() - &data).abs().max();
    assert!(err < 1e-9, "W·H differs from A by {:.3e}", err);
    assert!((f.w() - &w_true).abs().max() < 1e-9);
}

#[test]
fn test_two_source_blend_recovers_colours() {
    init_tracing();
    let blend = Blend::new();
    let data = FootprintData::new(blend.data());

    let config = DeblendConfig {
        iterations: 500,
        include_background: false,
        constraint: Constraint::Symmetry { beta: 0.01 },
        ..Default::default()
    };
    let result = deblend(&blend.footprint, &data, &blend.seeds(), &config).unwrap();

    assert!(result.factors().is_non_negative());
    assert!(
        result.residual_after < result.residual_before,
        "residual {:.4e} → {:.4e}",
        result.residual_before,
        result.residual_after
    );

    let w = result.factors().w();
    for s in 0..2 {
        for b in 0..3 {
            assert!(
                (w[(b, s)] - blend.seds[(b, s)]).abs() < 0.05,
                "SED[{}, {}]: fitted {:.4}, true {:.4}",
                b,
                s,
                w[(b, s)],
                blend.seds[(b, s)]
            );
            let flux = result.reconstruction.template_flux(b, s).unwrap();
            let truth = blend.true_flux(b, s);
            assert!(
                (flux - truth).abs() / truth < 0.15,
                "flux[{}, {}]: fitted {:.3}, true {:.3}",
                b,
                s,
                flux,
                truth
            );
        }
    }
}

#[test]
fn test_negative_sky_absorbed_by_background() {
    init_tracing();
    let blend = Blend::new();
    let sky = -0.5;

    let mut rng = StdRng::seed_from_u64(42);
    let noise = Normal::new(0.0, 0.01).unwrap();
    let noisy = blend.data().map(|v| v + sky + noise.sample(&mut rng));
    let data = FootprintData::new(noisy);

    let templates: Vec<SourceTemplate> = blend
        .profiles
        .iter()
        .map(|p| SourceTemplate::new(vec![p.clone(); 3]))
        .collect();
    let config = DeblendConfig {
        iterations: 100,
        ..Default::default()
    };
    let result = deblend(&blend.footprint, &data, &templates, &config).unwrap();

    assert!(result.offset() > 0.5, "offset {}", result.offset());
    assert!(result.factors().is_non_negative());

    let bg = result.factors().layout().background_index().unwrap();
    for b in 0..3 {
        let t = result.reconstruction.template(b, bg).unwrap();
        let mean = t.mean();
        assert!(
            (mean - sky).abs() < 0.05,
            "band {}: background template mean {:.4}, expected {}",
            b,
            mean,
            sky
        );
    }
}

#[test]
fn test_assembled_images_and_pasted_templates() -> anyhow::Result<()> {
    init_tracing();
    let blend = Blend::new();
    let fp_box = *blend.footprint.bbox();

    // Exposures cover a larger region than the footprint
    let image_box = BoundingBox::new(190, 295, 40, 25);
    let model = blend.data();
    let bands: Vec<BandImage> = (0..3)
        .map(|b| {
            let mut image = vec![0.0; image_box.area()];
            for y in 0..fp_box.height {
                for x in 0..fp_box.width {
                    let ix = x + (fp_box.x0 - image_box.x0) as usize;
                    let iy = y + (fp_box.y0 - image_box.y0) as usize;
                    image[iy * image_box.width + ix] = model[(b, y * fp_box.width + x)];
                }
            }
            BandImage::new(image_box, image)
        })
        .collect();
    let data = FootprintData::assemble(&bands, &blend.footprint)?;
    assert_eq!(data.data(), &model);

    // Seed templates cut to 9x9 stamps around each peak, clipped by the footprint
    let templates = blend
        .footprint
        .peaks()
        .iter()
        .zip(&blend.profiles)
        .map(|(peak, profile)| {
            let stamp = BoundingBox::new(peak.x - 4, peak.y - 4, 9, 9);
            let mut pixels = vec![0.0; stamp.area()];
            let ov = fp_box.overlap(&stamp).unwrap();
            for (fy, sy) in ov.self_rows.clone().zip(ov.other_rows.clone()) {
                for (fx, sx) in ov.self_cols.clone().zip(ov.other_cols.clone()) {
                    pixels[sy * 9 + sx] = profile[fy * fp_box.width + fx];
                }
            }
            let img = TemplateImage { bbox: stamp, pixels };
            SourceTemplate::from_images(&blend.footprint, &[img.clone(), img.clone(), img])
        })
        .collect::<nmf_deblender::Result<Vec<_>>>()?;

    let config = DeblendConfig {
        iterations: 50,
        update_rule: UpdateRule::Multiplicative,
        ..Default::default()
    };
    let result = deblend(&blend.footprint, &data, &templates, &config)?;
    let image = result.reconstruction.template_image(2, 0)?;
    assert_eq!(image.shape(), (11, 15));
    // Brightest pixel of source 0 sits on its peak
    let (imax, _) = image
        .iter()
        .enumerate()
        .fold((0, f64::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
    // Column-major index into an 11-row matrix
    assert_eq!((imax % 11, imax / 11), (5, 4));

    // Child footprints of both sources carry their peaks and stay inside the parent
    for (k, peak) in blend.footprint.peaks().iter().enumerate() {
        let child = result.reconstruction.template_footprint(&blend.footprint, 1, k, 0.05)?;
        assert_eq!(child.peak, *peak);
        assert!(child.peak_value > 0.05);
        assert!(fp_box.contains_box(&child.bbox), "source {}: {:?}", k, child.bbox);
        assert!(child.bbox.contains(peak.x, peak.y));
        assert!(child.pixels.iter().all(|&(x, y, v)| v > 0.05 && child.bbox.contains(x, y)));
    }
    Ok(())
}

#[test]
fn test_reconstruction_round_trip_every_band() {
    let blend = Blend::new();
    let layout = nmf_deblender::SourceLayout::new(2, false);
    let f = nmf_deblender::Factorization::new(blend.seds.clone(), blend.intensity(), layout)
        .unwrap();
    let r = Reconstruction::new(blend.data(), f, 0.0, Some(blend.footprint.shape())).unwrap();
    for band in 0..3 {
        let frac = r.residual_fraction(band).unwrap();
        assert!(frac < 1e-12, "band {}: residual fraction {:.3e}", band, frac);
    }
    assert!(r.residual().abs().max() < 1e-12);
}

#[test]
fn test_rules_are_interchangeable() {
    let blend = Blend::new();
    let data = FootprintData::new(blend.data());
    let templates = blend.seeds();
    for rule in [
        UpdateRule::Multiplicative,
        UpdateRule::ExactInverse,
        // W step kept below 2/‖HHᵗ‖ for these profiles
        UpdateRule::GradientDescent {
            step_w: 1e-5,
            step_h: 1e-3,
        },
    ] {
        let config = DeblendConfig {
            iterations: 20,
            update_rule: rule,
            include_background: false,
            ..Default::default()
        };
        let result = deblend(&blend.footprint, &data, &templates, &config).unwrap();
        assert!(
            result.residual_after <= result.residual_before * (1.0 + 1e-6),
            "{}: residual {:.4e} → {:.4e}",
            rule.name(),
            result.residual_before,
            result.residual_after
        );
    }
}
