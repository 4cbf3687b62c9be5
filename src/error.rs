use thiserror::Error;

use crate::container::StorageId;

/// Errors raised while configuring a geometry, addressing storages, or preparing an engine.
///
/// Propagation and the iteration kernels themselves never fail; everything that can go wrong is
/// caught when the problem is set up.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("distance (geometry.distance) must not be None or 0")]
    MissingDistance,

    #[error("frame size (geometry.shape) must not be None or 0, got {0:?}")]
    ZeroShape([usize; 2]),

    #[error("wavelength (geometry.lam) and energy (geometry.energy) must not both be None")]
    MissingEnergy,

    #[error(
        "pixel size in sample plane (geometry.resolution) and detector plane (geometry.psize) must not both be None"
    )]
    MissingPixelSize,

    #[error("{name} must be finite and positive, got {value}")]
    InvalidValue { name: &'static str, value: f64 },

    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("unknown storage {0:?}")]
    UnknownStorage(StorageId),

    #[error("view at {coord:?} with shape {shape:?} exceeds storage {storage:?} of shape {bounds:?}")]
    ViewOutOfBounds {
        storage: StorageId,
        coord: [usize; 2],
        shape: [usize; 2],
        bounds: [usize; 3],
    },

    #[error("engine needs at least one active pod")]
    NoActivePods,

    #[error("engine {0} was not initialized")]
    NotInitialized(&'static str),

    #[error("invalid engine parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns `value` if it is finite and strictly positive.
pub(crate) fn positive(name: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(Error::InvalidValue { name, value })
    }
}
