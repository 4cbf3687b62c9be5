//! Geometry manager.
//!
//! Holds the experimental parameters, keeps sample and detector pixel sizes consistent with each
//! other, and owns the propagator built from them.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::Deserialize;
use tracing::debug;

use crate::error::{positive, Error, Result};
use crate::fft2::{FftBackend, RustFft};
use crate::grids::{Center, Pair};
use crate::propagator::Propagator;

/// Conversion between photon energy in keV and wavelength in meters: `lam = KEV2M / energy`.
pub const KEV2M: f64 = 1.240597288e-09;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    Farfield,
    Nearfield,
}

impl Default for Propagation {
    fn default() -> Self {
        Propagation::Farfield
    }
}

/// User facing geometry options. Missing fields fall back to the defaults below.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Incident photon energy in keV. Takes precedence over `lam` when both are given.
    pub energy: Option<f64>,
    /// Wavelength in meters.
    pub lam: Option<f64>,
    /// Distance from object to screen in meters.
    pub distance: Option<f64>,
    /// Pixel size in meters at the detector plane.
    pub psize: Option<Pair<f64>>,
    /// Pixel size in meters at the sample plane.
    pub resolution: Option<Pair<f64>>,
    /// Number of detector pixels.
    pub shape: Option<Pair<usize>>,
    pub propagation: Propagation,
    /// Origin convention in the detector plane.
    pub center: Center,
    /// Origin convention in the sample plane.
    pub origin: Center,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        GeometryConfig {
            energy: Some(6.2),
            lam: None,
            distance: Some(7.0),
            psize: Some(Pair::Both(172e-6)),
            resolution: None,
            shape: Some(Pair::Both(256)),
            propagation: Propagation::Farfield,
            center: Center::FftShift,
            origin: Center::FftShift,
        }
    }
}

/// A consistent snapshot of the geometry, as consumed by the propagators.
#[derive(Clone, Debug, PartialEq)]
pub struct GeoParams {
    pub energy: f64,
    pub lam: f64,
    pub distance: f64,
    pub psize: [f64; 2],
    pub resolution: [f64; 2],
    pub shape: [usize; 2],
    pub propagation: Propagation,
    pub misfit: [f64; 2],
    pub center: Center,
    pub origin: Center,
    pub psize_is_fix: bool,
    pub resolution_is_fix: bool,
}

impl GeoParams {
    /// Wavelength times distance.
    pub fn lz(&self) -> f64 {
        self.lam * self.distance
    }
}

/// Holds and keeps consistent the experimental parameters, and provides the propagator.
///
/// Every setter validates its input, re-derives the dependent pixel size through [`Geo::update`]
/// and rebuilds the propagator, so the geometry is never observed in a half-updated state.
#[derive(Clone, Debug)]
pub struct Geo {
    p: GeoParams,
    backend: Arc<dyn FftBackend>,
    propagator: OnceLock<Propagator>,
}

impl Geo {
    pub fn new(config: &GeometryConfig) -> Result<Self> {
        Geo::with_backend(config, Arc::new(RustFft::new()))
    }

    /// Like [`Geo::new`], with an alternate transform pair for the propagator.
    pub fn with_backend(config: &GeometryConfig, backend: Arc<dyn FftBackend>) -> Result<Self> {
        let distance = checked_distance(config.distance.unwrap_or(0.0))?;

        let shape = match config.shape {
            Some(shape) => shape.expect2(),
            None => [0, 0],
        };
        if shape.contains(&0) {
            return Err(Error::ZeroShape(shape));
        }

        let (energy, lam) = match (config.energy, config.lam) {
            (Some(energy), lam) => {
                if lam.is_some() {
                    debug!("Energy and wavelength both specified. Energy takes precedence over wavelength");
                }
                let energy = positive("energy", energy)?;
                (energy, KEV2M / energy)
            }
            (None, Some(lam)) => {
                let lam = positive("lam", lam)?;
                (KEV2M / lam, lam)
            }
            (None, None) => return Err(Error::MissingEnergy),
        };

        let psize_is_fix = config.psize.is_some();
        let resolution_is_fix = config.resolution.is_some();
        if !psize_is_fix && !resolution_is_fix {
            return Err(Error::MissingPixelSize);
        }
        let psize = match config.psize {
            Some(psize) => positive_pair("psize", psize)?,
            None => [1.0, 1.0],
        };
        let resolution = match config.resolution {
            Some(resolution) => positive_pair("resolution", resolution)?,
            None => [1.0, 1.0],
        };

        let mut geo = Geo {
            p: GeoParams {
                energy,
                lam,
                distance,
                psize,
                resolution,
                shape,
                propagation: config.propagation,
                misfit: [0.0, 0.0],
                center: config.center,
                origin: config.origin,
                psize_is_fix,
                resolution_is_fix,
            },
            backend,
            propagator: OnceLock::new(),
        };
        geo.update_pixel_sizes();
        geo.propagator();
        Ok(geo)
    }

    /// Re-derives the pixel size that is not fixed and rebuilds the propagator.
    ///
    /// * neither fixed: the detector pixel size becomes fixed and the update is repeated
    /// * detector pixel size fixed: the sample pixel size is derived from it
    /// * sample pixel size fixed: the detector pixel size is derived from it
    /// * both fixed: both are kept and the misfit between them is recorded
    pub fn update(&mut self) {
        self.update_pixel_sizes();
        if let Some(prop) = self.propagator.get_mut() {
            debug!("Updating propagator for new geometry");
            prop.update(&self.p);
        }
    }

    fn update_pixel_sizes(&mut self) {
        let p = &mut self.p;
        let lz = p.lz();
        let farfield = p.propagation == Propagation::Farfield;
        match (p.resolution_is_fix, p.psize_is_fix) {
            (false, false) => {
                debug!("No pixel size is marked as constant. Setting detector pixel size as fix");
                p.psize_is_fix = true;
                self.update_pixel_sizes();
            }
            (false, true) => {
                for axis in 0..2 {
                    p.resolution[axis] = if farfield {
                        lz / p.psize[axis] / p.shape[axis] as f64
                    } else {
                        p.psize[axis]
                    };
                }
                p.misfit = [0.0, 0.0];
            }
            (true, false) => {
                for axis in 0..2 {
                    p.psize[axis] = if farfield {
                        lz / p.resolution[axis] / p.shape[axis] as f64
                    } else {
                        p.resolution[axis]
                    };
                }
                p.misfit = [0.0, 0.0];
            }
            (true, true) => {
                for axis in 0..2 {
                    // frame misfit that would make it work
                    p.misfit[axis] = if farfield {
                        lz / p.resolution[axis] / p.psize[axis] - p.shape[axis] as f64
                    } else {
                        p.resolution[axis] - p.psize[axis]
                    };
                }
            }
        }
    }

    /// Returns the propagator, building it on first access.
    pub fn propagator(&self) -> &Propagator {
        self.propagator.get_or_init(|| {
            debug!(propagation = ?self.p.propagation, shape = ?self.p.shape, "Building propagator");
            Propagator::new(&self.p, self.backend.clone())
        })
    }

    /// Drops the cached propagator. The next call to [`Geo::propagator`] rebuilds it.
    pub fn clear_propagator(&mut self) {
        self.propagator = OnceLock::new();
    }

    pub fn has_propagator(&self) -> bool {
        self.propagator.get().is_some()
    }

    pub fn params(&self) -> &GeoParams {
        &self.p
    }

    pub fn backend(&self) -> Arc<dyn FftBackend> {
        self.backend.clone()
    }

    pub fn energy(&self) -> f64 {
        self.p.energy
    }

    pub fn set_energy(&mut self, energy: f64) -> Result<()> {
        let energy = positive("energy", energy)?;
        self.p.energy = energy;
        self.p.lam = KEV2M / energy;
        self.update();
        Ok(())
    }

    pub fn lam(&self) -> f64 {
        self.p.lam
    }

    /// Changing the wavelength never changes the shape, only the derived pixel size.
    pub fn set_lam(&mut self, lam: f64) -> Result<()> {
        let lam = positive("lam", lam)?;
        self.p.lam = lam;
        self.p.energy = KEV2M / lam;
        self.update();
        Ok(())
    }

    pub fn distance(&self) -> f64 {
        self.p.distance
    }

    pub fn set_distance(&mut self, distance: f64) -> Result<()> {
        self.p.distance = checked_distance(distance)?;
        self.update();
        Ok(())
    }

    /// Sample plane pixel size.
    pub fn resolution(&self) -> [f64; 2] {
        self.p.resolution
    }

    /// Sets the sample plane pixel size.
    ///
    /// If only the detector pixel size was fixed, the sample pixel size becomes the fixed one and
    /// the detector pixel size is derived from it. If both were fixed, the misfit is recomputed.
    pub fn set_resolution(&mut self, resolution: impl Into<Pair<f64>>) -> Result<()> {
        let resolution = positive_pair("resolution", resolution.into())?;
        self.p.resolution = resolution;
        if !self.p.resolution_is_fix {
            self.p.resolution_is_fix = true;
            self.p.psize_is_fix = false;
        }
        self.update();
        Ok(())
    }

    /// Detector plane pixel size.
    pub fn psize(&self) -> [f64; 2] {
        self.p.psize
    }

    /// Sets the detector plane pixel size, mirroring [`Geo::set_resolution`].
    pub fn set_psize(&mut self, psize: impl Into<Pair<f64>>) -> Result<()> {
        let psize = positive_pair("psize", psize.into())?;
        self.p.psize = psize;
        if !self.p.psize_is_fix {
            self.p.psize_is_fix = true;
            self.p.resolution_is_fix = false;
        }
        self.update();
        Ok(())
    }

    pub fn shape(&self) -> [usize; 2] {
        self.p.shape
    }

    pub fn set_shape(&mut self, shape: impl Into<Pair<usize>>) -> Result<()> {
        let shape = shape.into().expect2();
        if shape.contains(&0) {
            return Err(Error::ZeroShape(shape));
        }
        self.p.shape = shape;
        self.update();
        Ok(())
    }

    pub fn psize_is_fix(&self) -> bool {
        self.p.psize_is_fix
    }

    pub fn fix_psize(&mut self, fix: bool) {
        self.p.psize_is_fix = fix;
        self.update();
    }

    pub fn resolution_is_fix(&self) -> bool {
        self.p.resolution_is_fix
    }

    pub fn fix_resolution(&mut self, fix: bool) {
        self.p.resolution_is_fix = fix;
        self.update();
    }

    pub fn misfit(&self) -> [f64; 2] {
        self.p.misfit
    }

    pub fn lz(&self) -> f64 {
        self.p.lz()
    }

    pub fn propagation(&self) -> Propagation {
        self.p.propagation
    }
}

impl fmt::Display for Geo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.p;
        writeln!(f, "{:>25} : {:?}", "center", p.center)?;
        writeln!(f, "{:>25} : {}", "distance", p.distance)?;
        writeln!(f, "{:>25} : {}", "energy", p.energy)?;
        writeln!(f, "{:>25} : {}", "lam", p.lam)?;
        writeln!(f, "{:>25} : {:?}", "misfit", p.misfit)?;
        writeln!(f, "{:>25} : {:?}", "origin", p.origin)?;
        writeln!(f, "{:>25} : {:?}", "propagation", p.propagation)?;
        writeln!(f, "{:>25} : {:?}", "psize", p.psize)?;
        writeln!(f, "{:>25} : {}", "psize_is_fix", p.psize_is_fix)?;
        writeln!(f, "{:>25} : {:?}", "resolution", p.resolution)?;
        writeln!(f, "{:>25} : {}", "resolution_is_fix", p.resolution_is_fix)?;
        writeln!(f, "{:>25} : {:?}", "shape", p.shape)
    }
}

fn positive_pair(name: &'static str, value: Pair<f64>) -> Result<[f64; 2]> {
    let [a, b] = value.expect2();
    Ok([positive(name, a)?, positive(name, b)?])
}

// a zero distance is treated as unset
fn checked_distance(distance: f64) -> Result<f64> {
    if distance == 0.0 {
        Err(Error::MissingDistance)
    } else {
        positive("distance", distance)
    }
}
