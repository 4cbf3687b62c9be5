//! Reconstruction engines.
//!
//! Every engine alternates the Fourier constraint with an overlap update. They differ in how
//! frames are scheduled and how the update is applied:
//!
//! * [`DifferenceMap`] constrains all frames in parallel, then projects object and probe
//! * [`Epie`] visits frames one at a time in shuffled order with gradient steps
//! * [`Multislice`] is [`Epie`] through a stack of object slices

mod dm;
mod epie;
mod multislice;

pub use dm::{DifferenceMap, DmParams};
pub use epie::{Epie, EpieParams};
pub use multislice::{Multislice, MultisliceParams, SliceUpdate};

use ndarray::Array2;
use serde::Deserialize;
use tracing::{debug, info};

use crate::container::Ptycho;
use crate::error::{Error, Result};
use crate::fourier::FourierErrors;
use crate::support::{circular_support, recenter};

/// Errors of one outer iteration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IterationErrors {
    /// Zero based index of the iteration.
    pub iteration: usize,
    /// Errors of each frame, `None` for frames that were skipped.
    pub frames: Vec<Option<FourierErrors>>,
}

impl IterationErrors {
    /// Average over the frames that were not skipped.
    pub fn mean(&self) -> Option<FourierErrors> {
        let mut sum = FourierErrors::default();
        let mut n = 0;
        for e in self.frames.iter().flatten() {
            sum.fmag += e.fmag;
            sum.phot += e.phot;
            sum.exit += e.exit;
            n += 1;
        }
        if n == 0 {
            return None;
        }
        let n = n as f64;
        Some(FourierErrors {
            fmag: sum.fmag / n,
            phot: sum.phot / n,
            exit: sum.exit / n,
        })
    }
}

/// One outer iteration interface shared by all algorithms.
pub trait Engine {
    fn name(&self) -> &'static str;

    /// Prepares the engine for `ptycho`. Must be called before [`Engine::iterate`].
    fn initialize(&mut self, ptycho: &mut Ptycho) -> Result<()>;

    /// Runs `num` outer iterations and returns the errors of the last one.
    fn iterate(&mut self, ptycho: &mut Ptycho, num: usize) -> Result<IterationErrors>;

    /// Writes the final state back into `ptycho`.
    fn finalize(&mut self, _ptycho: &mut Ptycho) -> Result<()> {
        Ok(())
    }
}

/// Runs `engine` on `ptycho` for `iterations` outer iterations and returns the error trace.
pub fn run(
    engine: &mut dyn Engine,
    ptycho: &mut Ptycho,
    iterations: usize,
) -> Result<Vec<IterationErrors>> {
    engine.initialize(ptycho)?;
    let mut trace = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let errors = engine.iterate(ptycho, 1)?;
        match errors.mean() {
            Some(mean) => info!(
                engine = engine.name(),
                iteration = errors.iteration,
                fmag = mean.fmag,
                phot = mean.phot,
                exit = mean.exit,
                "Iteration finished"
            ),
            None => info!(
                engine = engine.name(),
                iteration = errors.iteration,
                "Iteration finished without valid frames"
            ),
        }
        trace.push(errors);
    }
    engine.finalize(ptycho)?;
    Ok(trace)
}

/// Engine selection, tagged by `name`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "name")]
pub enum EngineConfig {
    #[serde(rename = "DM")]
    Dm(DmParams),
    #[serde(rename = "EPIE")]
    Epie(EpieParams),
    #[serde(rename = "ePIE_multislice")]
    Multislice(MultisliceParams),
}

impl EngineConfig {
    pub fn build(&self) -> Result<Box<dyn Engine>> {
        Ok(match self {
            EngineConfig::Dm(p) => Box::new(DifferenceMap::new(p.clone())?),
            EngineConfig::Epie(p) => Box::new(Epie::new(p.clone())?),
            EngineConfig::Multislice(p) => Box::new(Multislice::new(p.clone())?),
        })
    }
}

/// Circular support for the frame of every probe storage, if a support fraction is set.
pub(crate) fn probe_supports(ptycho: &Ptycho, fraction: Option<f64>) -> Vec<Option<Array2<f64>>> {
    ptycho
        .probe
        .storages()
        .iter()
        .map(|s| {
            fraction.map(|f| {
                let [_, rows, cols] = s.shape();
                circular_support([rows, cols], f)
            })
        })
        .collect()
}

/// Rolls every probe storage back to the frame center if it drifted further than `tol` pixels.
pub(crate) fn center_probes(ptycho: &mut Ptycho, tol: Option<f64>) {
    if let Some(tol) = tol {
        for (i, storage) in ptycho.probe.storages_mut().iter_mut().enumerate() {
            if let Some(shift) = recenter(storage.data.view_mut(), tol) {
                debug!(storage = i, ?shift, "Recentered probe");
            }
        }
    }
}

pub(crate) fn check_param(ok: bool, message: impl Into<String>) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidParameter(message.into()))
    }
}

pub(crate) fn check_common(
    probe_support: Option<f64>,
    clip_object: Option<[f64; 2]>,
    fourier_relax_factor: f64,
) -> Result<()> {
    if let Some(f) = probe_support {
        check_param(
            f > 0.0 && f <= 1.0,
            format!("probe_support must be in (0, 1], got {}", f),
        )?;
    }
    if let Some([min, max]) = clip_object {
        check_param(
            0.0 <= min && min <= max,
            format!("clip_object must satisfy 0 <= min <= max, got [{}, {}]", min, max),
        )?;
    }
    check_param(
        fourier_relax_factor.is_finite(),
        "fourier_relax_factor must be finite",
    )
}
