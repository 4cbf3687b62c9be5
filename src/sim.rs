//! Noiseless far-field scans with a known object and probe.

use std::f64::consts::PI;

use ndarray::{s, Array2, Array3, ArrayView2, Zip};
use num_complex::Complex;

use crate::container::{Ptycho, ScanData};
use crate::engine::IterationErrors;
use crate::geometry::{Geo, GeometryConfig};
use crate::grids::Pair;

pub(crate) const FRAME: usize = 32;
pub(crate) const OBJECT: usize = 64;

pub(crate) struct Simulation {
    pub ptycho: Ptycho,
    pub object: Array2<Complex<f64>>,
    pub probe: Array2<Complex<f64>>,
    pub positions: usize,
}

pub(crate) fn geometry() -> Geo {
    Geo::new(&GeometryConfig {
        energy: Some(6.2),
        distance: Some(7.0),
        psize: Some(Pair::Both(172e-6)),
        shape: Some(Pair::Both(FRAME)),
        ..GeometryConfig::default()
    })
    .unwrap()
}

/// Gaussian beam with a weak quadratic phase, centered at `n / 2`.
pub(crate) fn gaussian_probe(n: usize, sigma: f64) -> Array2<Complex<f64>> {
    let c = (n / 2) as f64;
    Array2::from_shape_fn((n, n), |(i, j)| {
        let r2 = (i as f64 - c).powi(2) + (j as f64 - c).powi(2);
        Complex::from_polar((-r2 / (2.0 * sigma * sigma)).exp(), 0.01 * r2)
    })
}

/// Smooth object with amplitude in `[0.8, 1.0]` and phase in `[-0.4, 0.4]`.
pub(crate) fn test_object(n: usize) -> Array2<Complex<f64>> {
    Array2::from_shape_fn((n, n), |(i, j)| {
        let (y, x) = (i as f64, j as f64);
        let amplitude = 0.9 + 0.1 * (2.0 * PI * x / 23.0).sin() * (2.0 * PI * y / 31.0).cos();
        let phase = 0.4 * (2.0 * PI * (x + 0.5 * y) / 37.0).sin();
        Complex::from_polar(amplitude, phase)
    })
}

pub(crate) fn raster(step: usize) -> Vec<[usize; 2]> {
    let mut positions = Vec::new();
    for r in (0..=OBJECT - FRAME).step_by(step) {
        for c in (0..=OBJECT - FRAME).step_by(step) {
            positions.push([r, c]);
        }
    }
    positions
}

/// A raster scan with `step` pixels between positions. The initial probe is the true one, the
/// initial object is flat.
pub(crate) fn farfield_scan(step: usize) -> Simulation {
    let geo = geometry();
    let object = test_object(OBJECT);
    let probe = gaussian_probe(FRAME, 6.0);
    let positions = raster(step);

    let mut intensities = Array3::zeros((positions.len(), FRAME, FRAME));
    for (i, pos) in positions.iter().enumerate() {
        let view = object.slice(s![pos[0]..pos[0] + FRAME, pos[1]..pos[1] + FRAME]);
        let exit = Zip::from(&probe).and(&view).map_collect(|&p, &o| p * o);
        let far = geo.propagator().fw(exit.view());
        intensities
            .slice_mut(s![i, .., ..])
            .assign(&far.mapv(|f| f.norm_sqr()));
    }

    let n = positions.len();
    let ptycho = Ptycho::from_scan(ScanData {
        geometry: geo,
        positions,
        probe: probe.clone().into_shape((1, FRAME, FRAME)).unwrap(),
        object: Array2::from_elem((OBJECT, OBJECT), Complex::new(1.0, 0.0)),
        intensities,
        mask: None,
    })
    .unwrap();

    Simulation {
        ptycho,
        object,
        probe,
        positions: n,
    }
}

/// `|⟨a, b⟩| / (‖a‖ ‖b‖)`, insensitive to a global phase.
pub(crate) fn correlation(a: ArrayView2<Complex<f64>>, b: ArrayView2<Complex<f64>>) -> f64 {
    let inner = Zip::from(&a)
        .and(&b)
        .fold(Complex::new(0.0, 0.0), |acc, a, b| acc + a.conj() * b);
    let na: f64 = a.iter().map(|e| e.norm_sqr()).sum();
    let nb: f64 = b.iter().map(|e| e.norm_sqr()).sum();
    inner.norm() / (na * nb).sqrt()
}

/// Relative residual `‖t − c·r‖ / ‖t‖` between the true object `t` and the reconstruction `r`
/// over the well lit center, for the best complex scale `c`.
pub(crate) fn object_residual(sim: &Simulation) -> f64 {
    let recovered = sim.ptycho.object.storages()[0]
        .data
        .slice(s![0, 16..48, 16..48]);
    let corr = correlation(sim.object.slice(s![16..48, 16..48]), recovered);
    (1.0 - corr * corr).max(0.0).sqrt()
}

/// Mean Fourier magnitude error of every iteration.
pub(crate) fn fmag_trace(trace: &[IterationErrors]) -> Vec<f64> {
    trace
        .iter()
        .map(|e| e.mean().map_or(f64::NAN, |m| m.fmag))
        .collect()
}

/// Largest ratio between an entry and the one before it. Values below 1 mean a strictly
/// decreasing trace.
pub(crate) fn largest_increase(values: &[f64]) -> f64 {
    values.windows(2).map(|w| w[1] / w[0]).fold(0.0, f64::max)
}
