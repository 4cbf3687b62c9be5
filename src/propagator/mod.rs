//! Wavefield propagation between the sample and detector planes.

mod farfield;
mod nearfield;

pub use farfield::FarfieldPropagator;
pub use nearfield::NearfieldPropagator;

use std::sync::Arc;

use ndarray::{Array2, ArrayView2};
use num_complex::Complex;

use crate::fft2::FftBackend;
use crate::geometry::{GeoParams, Propagation};
use crate::Field;

/// A propagator bound to one geometry snapshot.
///
/// Kernels are precomputed on construction and by [`Propagator::update`]; `fw` and `bw` only read them.
#[derive(Clone, Debug)]
pub enum Propagator {
    Farfield(FarfieldPropagator),
    Nearfield(NearfieldPropagator),
}

impl Propagator {
    /// Builds the propagator matching `p.propagation`.
    pub fn new(p: &GeoParams, backend: Arc<dyn FftBackend>) -> Self {
        match p.propagation {
            Propagation::Farfield => Propagator::Farfield(FarfieldPropagator::new(p, backend)),
            Propagation::Nearfield => Propagator::Nearfield(NearfieldPropagator::new(p, backend)),
        }
    }

    /// Recomputes all kernels. Switching the propagation kind is the caller's job, see
    /// [`Geo::update`](crate::geometry::Geo::update).
    pub fn update(&mut self, p: &GeoParams) {
        match self {
            Propagator::Farfield(prop) => prop.update(p),
            Propagator::Nearfield(prop) => prop.update(p),
        }
    }

    pub fn fw(&self, input: ArrayView2<Complex<f64>>) -> Array2<Complex<f64>> {
        match self {
            Propagator::Farfield(prop) => prop.fw(input),
            Propagator::Nearfield(prop) => prop.fw(input),
        }
    }

    pub fn bw(&self, input: ArrayView2<Complex<f64>>) -> Array2<Complex<f64>> {
        match self {
            Propagator::Farfield(prop) => prop.bw(input),
            Propagator::Nearfield(prop) => prop.bw(input),
        }
    }

    /// Propagates a sample-plane field, returning it sampled at the detector pixel size.
    pub fn fw_field(&self, field: &Field) -> Field {
        let psize = self.psize_det();
        Field {
            values: self.fw(field.values.view()),
            pitch: (psize[0], psize[1]),
        }
    }

    /// Propagates a detector-plane field back, returning it sampled at the sample pixel size.
    pub fn bw_field(&self, field: &Field) -> Field {
        let psize = self.psize_sam();
        Field {
            values: self.bw(field.values.view()),
            pitch: (psize[0], psize[1]),
        }
    }

    pub fn grids_sam(&self) -> &(Array2<f64>, Array2<f64>) {
        match self {
            Propagator::Farfield(prop) => prop.grids_sam(),
            Propagator::Nearfield(prop) => prop.grids_sam(),
        }
    }

    pub fn grids_det(&self) -> &(Array2<f64>, Array2<f64>) {
        match self {
            Propagator::Farfield(prop) => prop.grids_det(),
            Propagator::Nearfield(prop) => prop.grids_det(),
        }
    }

    pub fn psize_sam(&self) -> [f64; 2] {
        match self {
            Propagator::Farfield(prop) => prop.psize_sam(),
            Propagator::Nearfield(prop) => prop.psize_sam(),
        }
    }

    pub fn psize_det(&self) -> [f64; 2] {
        match self {
            Propagator::Farfield(prop) => prop.psize_det(),
            Propagator::Nearfield(prop) => prop.psize_det(),
        }
    }
}
