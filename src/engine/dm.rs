//! Difference map.

use ndarray::{Array2, Array3};
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{center_probes, check_common, check_param, probe_supports, Engine, IterationErrors};
use crate::container::{Frame, Ptycho};
use crate::error::{Error, Result};
use crate::fourier::{probe_times_object, FourierConstraint, FourierErrors, FourierUpdate, PowerStats};
use crate::overlap::{object_update, probe_update, ObjectUpdate};

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct DmParams {
    /// Difference map mixing parameter. `0` reduces the scheme to alternating projections.
    pub alpha: f64,
    /// Number of iterations before the probe is updated.
    pub probe_update_start: usize,
    pub update_object_first: bool,
    /// The overlap loop stops once the relative probe change falls below this.
    pub overlap_converge_factor: f64,
    pub overlap_max_iterations: usize,
    /// Weight of the previous probe in the probe update.
    pub probe_inertia: f64,
    /// Weight of the previous object in the object update, in units of the mean power.
    pub object_inertia: f64,
    /// Relative tolerance on the modulus deviation. `0` disables the power bound.
    pub fourier_relax_factor: f64,
    /// Gaussian smoothing in pixels of the previous object.
    pub obj_smooth_std: Option<f64>,
    /// Magnitude range `[min, max]` of the object.
    pub clip_object: Option<[f64; 2]>,
    /// Area of the circular probe support as a fraction of the frame area.
    pub probe_support: Option<f64>,
    /// Recenters the probe when it drifts further than this many pixels.
    pub probe_center_tol: Option<f64>,
    pub compute_log_likelihood: bool,
}

impl Default for DmParams {
    fn default() -> Self {
        DmParams {
            alpha: 1.0,
            probe_update_start: 2,
            update_object_first: true,
            overlap_converge_factor: 0.05,
            overlap_max_iterations: 10,
            probe_inertia: 1e-9,
            object_inertia: 1e-4,
            fourier_relax_factor: 0.05,
            obj_smooth_std: None,
            clip_object: None,
            probe_support: Some(0.7),
            probe_center_tol: None,
            compute_log_likelihood: true,
        }
    }
}

impl DmParams {
    pub fn validate(&self) -> Result<()> {
        check_param(
            self.alpha.is_finite() && self.alpha >= 0.0,
            format!("alpha must be non-negative, got {}", self.alpha),
        )?;
        check_param(
            self.overlap_max_iterations > 0,
            "overlap_max_iterations must be at least 1",
        )?;
        check_param(
            self.probe_inertia >= 0.0 && self.object_inertia >= 0.0,
            "inertias must be non-negative",
        )?;
        if let Some(std) = self.obj_smooth_std {
            check_param(std >= 0.0, format!("obj_smooth_std must be non-negative, got {}", std))?;
        }
        check_common(self.probe_support, self.clip_object, self.fourier_relax_factor)
    }
}

struct DmState {
    frames: Vec<Frame>,
    pbound: Option<f64>,
    ob_cfact: Vec<Array3<f64>>,
    pr_cfact: Vec<f64>,
    supports: Vec<Option<Array2<f64>>>,
}

/// Difference map reconstruction.
///
/// Each iteration applies the Fourier constraint to all frames in parallel and then alternates
/// object and probe projections until the probe settles.
pub struct DifferenceMap {
    p: DmParams,
    curiter: usize,
    state: Option<DmState>,
}

impl DifferenceMap {
    pub fn new(p: DmParams) -> Result<Self> {
        p.validate()?;
        Ok(DifferenceMap {
            p,
            curiter: 0,
            state: None,
        })
    }

    pub fn params(&self) -> &DmParams {
        &self.p
    }

    /// Number of completed iterations.
    pub fn iteration(&self) -> usize {
        self.curiter
    }

    fn fourier_update(&self, state: &DmState, ptycho: &mut Ptycho) -> Vec<Option<FourierErrors>> {
        let constraint = FourierConstraint {
            alpha: self.p.alpha,
            pbound: state.pbound,
            log_likelihood: self.p.compute_log_likelihood,
        };

        let updates: Vec<Option<FourierUpdate>> = {
            let ptycho = &*ptycho;
            state
                .frames
                .par_iter()
                .map(|frame| {
                    let po = probe_times_object(ptycho, &frame.pods);
                    let exits: Vec<_> = frame
                        .pods
                        .iter()
                        .map(|&i| ptycho.exit.view(&ptycho.pods[i].exit))
                        .collect();
                    constraint.apply(
                        ptycho.geometries[frame.geometry].propagator(),
                        &po,
                        &exits,
                        ptycho.diff.view(&frame.diff),
                        ptycho.mask.view(&frame.mask),
                    )
                })
                .collect()
        };

        let Ptycho { exit, pods, .. } = ptycho;
        state
            .frames
            .iter()
            .zip(updates)
            .enumerate()
            .map(|(f, (frame, update))| match update {
                Some(update) => {
                    for (&i, delta) in frame.pods.iter().zip(&update.deltas) {
                        let mut ex = exit.view_mut(&pods[i].exit);
                        ex += delta;
                    }
                    Some(update.errors)
                }
                None => {
                    warn!(frame = f, "Skipping frame without valid detector pixels");
                    None
                }
            })
            .collect()
    }

    fn overlap_update(&self, state: &DmState, ptycho: &mut Ptycho) {
        let update_probe = self.curiter >= self.p.probe_update_start;
        let object = ObjectUpdate {
            smooth_std: self.p.obj_smooth_std,
            clip: self.p.clip_object,
        };
        for inner in 0..self.p.overlap_max_iterations {
            if self.p.update_object_first || inner > 0 || !update_probe {
                object_update(ptycho, &state.ob_cfact, &object);
            }
            if !update_probe {
                break;
            }
            let change = probe_update(ptycho, &state.pr_cfact, &state.supports);
            center_probes(ptycho, self.p.probe_center_tol);
            debug!(inner, change, "Probe update");
            if change < self.p.overlap_converge_factor {
                break;
            }
        }
    }
}

impl Engine for DifferenceMap {
    fn name(&self) -> &'static str {
        "DM"
    }

    fn initialize(&mut self, ptycho: &mut Ptycho) -> Result<()> {
        let frames = ptycho.frames();
        if frames.is_empty() {
            return Err(Error::NoActivePods);
        }
        ptycho.reset_exits();

        let stats = PowerStats::from_frames(ptycho, &frames);
        let pbound = stats.pbound(self.p.fourier_relax_factor);

        let cover = ptycho.object_viewcover();
        let ob_cfact = cover
            .storages()
            .iter()
            .map(|s| {
                s.data
                    .mapv(|c| self.p.object_inertia * stats.mean_power * (c + 1.0))
            })
            .collect();

        let mut views = vec![0usize; ptycho.probe.len()];
        for (_, pod) in ptycho.active_pods() {
            views[pod.probe.storage.0] += 1;
        }
        let pr_cfact = ptycho
            .probe
            .storages()
            .iter()
            .zip(&views)
            .map(|(s, &n)| self.p.probe_inertia * n as f64 / s.layers() as f64)
            .collect();

        info!(
            frames = frames.len(),
            mean_power = stats.mean_power,
            max_power = stats.max_power,
            pbound = ?pbound,
            "Initialized DM"
        );
        self.state = Some(DmState {
            frames,
            pbound,
            ob_cfact,
            pr_cfact,
            supports: probe_supports(ptycho, self.p.probe_support),
        });
        self.curiter = 0;
        Ok(())
    }

    fn iterate(&mut self, ptycho: &mut Ptycho, num: usize) -> Result<IterationErrors> {
        let state = self.state.take().ok_or(Error::NotInitialized("DM"))?;
        let mut errors = IterationErrors {
            iteration: self.curiter,
            frames: Vec::new(),
        };
        for _ in 0..num {
            errors = IterationErrors {
                iteration: self.curiter,
                frames: self.fourier_update(&state, ptycho),
            };
            self.overlap_update(&state, ptycho);
            self.curiter += 1;
        }
        self.state = Some(state);
        Ok(errors)
    }
}
