//! Iterative ptychographic phase retrieval.
//!
//! A [`geometry::Geo`] derives consistent sample and detector pixel sizes and owns a
//! [`propagator::Propagator`] that maps exit waves to the detector. The reconstruction engines in
//! [`engine`] alternate the Fourier constraint of [`fourier`] with the overlap update of
//! [`overlap`] across the views of a [`container::Ptycho`] problem.

use ndarray::Array2;
use num_complex::Complex;

pub mod container;
pub mod engine;
pub mod error;
pub mod fft2;
pub mod filters;
pub mod fourier;
pub mod geometry;
pub mod grids;
pub mod overlap;
pub mod propagator;
pub mod support;

#[cfg(test)]
pub(crate) mod sim;

pub use container::{Container, Frame, Pod, Ptycho, Storage, StorageId, View};
pub use engine::{run, Engine, EngineConfig, IterationErrors};
pub use error::{Error, Result};
pub use geometry::{Geo, GeometryConfig, Propagation};
pub use propagator::Propagator;

pub type C64 = Complex<f64>;

/// Represents a field sampled at a given pitch.
///
/// This represents a complex scalar field (e.g. an exit wave), the square of which is the intensity.
#[derive(Clone, Debug)]
pub struct Field {
    pub values: Array2<Complex<f64>>,
    pub pitch: (f64, f64),
}

impl Field {
    /// Calculates the area weighted sum of the squared norm of the field.
    ///
    /// This results in a conserved value, the photon flux.
    pub fn intensity_integral(&self) -> f64 {
        self.values.iter().fold(0.0, |sum, &v| sum + v.norm_sqr()) * (self.pitch.0 * self.pitch.1)
    }
}
