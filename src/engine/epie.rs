//! Extended ptychographic iterative engine.

use ndarray::Array2;
use num_complex::Complex;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use tracing::{info, warn};

use super::{center_probes, check_common, check_param, probe_supports, Engine, IterationErrors};
use crate::container::{Frame, Ptycho};
use crate::error::{Error, Result};
use crate::fourier::{probe_times_object, FourierConstraint, FourierErrors, PowerStats};
use crate::overlap::{object_gradient, probe_gradient};
use crate::support::{apply_support, clip_magnitude};

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct EpieParams {
    /// Object step size.
    pub alpha: f64,
    /// Probe step size.
    pub beta: f64,
    /// Number of iterations before the probe is updated.
    pub probe_update_start: usize,
    /// Relative tolerance on the modulus deviation. `0` disables the power bound.
    pub fourier_relax_factor: f64,
    /// Area of the circular probe support as a fraction of the frame area.
    pub probe_support: Option<f64>,
    /// Magnitude range `[min, max]` of the object.
    pub clip_object: Option<[f64; 2]>,
    /// Recenters the probe when it drifts further than this many pixels.
    pub probe_center_tol: Option<f64>,
    pub compute_log_likelihood: bool,
    /// Seed of the frame order shuffle.
    pub seed: u64,
}

impl Default for EpieParams {
    fn default() -> Self {
        EpieParams {
            alpha: 1.0,
            beta: 1.0,
            probe_update_start: 2,
            fourier_relax_factor: 0.05,
            probe_support: Some(0.7),
            clip_object: None,
            probe_center_tol: None,
            compute_log_likelihood: true,
            seed: 0,
        }
    }
}

impl EpieParams {
    pub fn validate(&self) -> Result<()> {
        check_param(
            self.alpha.is_finite() && self.alpha > 0.0,
            format!("alpha must be positive, got {}", self.alpha),
        )?;
        check_param(
            self.beta.is_finite() && self.beta > 0.0,
            format!("beta must be positive, got {}", self.beta),
        )?;
        check_common(self.probe_support, self.clip_object, self.fourier_relax_factor)
    }

    pub(crate) fn constraint(&self, pbound: Option<f64>) -> FourierConstraint {
        FourierConstraint {
            alpha: 0.0,
            pbound,
            log_likelihood: self.compute_log_likelihood,
        }
    }
}

/// Frames, power bound, supports and the shuffled visiting order of a sequential engine.
pub(crate) struct Schedule {
    pub frames: Vec<Frame>,
    pub pbound: Option<f64>,
    pub supports: Vec<Option<Array2<f64>>>,
    pub order: Vec<usize>,
    rng: ChaCha8Rng,
}

impl Schedule {
    pub fn new(ptycho: &Ptycho, p: &EpieParams) -> Result<Self> {
        let frames = ptycho.frames();
        if frames.is_empty() {
            return Err(Error::NoActivePods);
        }
        let stats = PowerStats::from_frames(ptycho, &frames);
        Ok(Schedule {
            pbound: stats.pbound(p.fourier_relax_factor),
            supports: probe_supports(ptycho, p.probe_support),
            order: (0..frames.len()).collect(),
            frames,
            rng: ChaCha8Rng::seed_from_u64(p.seed),
        })
    }

    pub fn shuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
    }
}

/// ePIE reconstruction.
///
/// Frames are visited one at a time in an order reshuffled every iteration. Each visit corrects
/// the frame's exit waves to the measured modulus and moves object and probe along the gradient
/// of the misfit, both computed from the estimates before the visit.
pub struct Epie {
    p: EpieParams,
    curiter: usize,
    state: Option<Schedule>,
}

impl Epie {
    pub fn new(p: EpieParams) -> Result<Self> {
        p.validate()?;
        Ok(Epie {
            p,
            curiter: 0,
            state: None,
        })
    }

    pub fn params(&self) -> &EpieParams {
        &self.p
    }

    /// Number of completed iterations.
    pub fn iteration(&self) -> usize {
        self.curiter
    }

    /// Visiting order of the last iteration.
    pub fn order(&self) -> Option<&[usize]> {
        self.state.as_ref().map(|s| s.order.as_slice())
    }
}

/// Updates object, probe and exit waves from one frame.
///
/// Returns `None` and leaves everything untouched if the frame has no valid detector pixel.
fn frame_update(
    p: &EpieParams,
    schedule: &Schedule,
    ptycho: &mut Ptycho,
    frame: &Frame,
    update_probe: bool,
) -> Result<Option<FourierErrors>> {
    let po = probe_times_object(ptycho, &frame.pods);
    let update = {
        let exits: Vec<_> = po.iter().map(|e| e.view()).collect();
        p.constraint(schedule.pbound).apply(
            ptycho.geometries[frame.geometry].propagator(),
            &po,
            &exits,
            ptycho.diff.view(&frame.diff),
            ptycho.mask.view(&frame.mask),
        )
    };
    let update = match update {
        Some(update) => update,
        None => return Ok(None),
    };

    let pods: Vec<_> = frame.pods.iter().map(|&i| ptycho.pods[i].clone()).collect();
    let probes: Vec<Array2<Complex<f64>>> = pods
        .iter()
        .map(|pod| ptycho.probe.view(&pod.probe).to_owned())
        .collect();
    let objects: Vec<Array2<Complex<f64>>> = pods
        .iter()
        .map(|pod| ptycho.object.view(&pod.object).to_owned())
        .collect();
    let probe_views: Vec<_> = probes.iter().map(|p| p.view()).collect();

    let ob_inc = object_gradient(&probe_views, &update.deltas, p.alpha);
    for (pod, inc) in pods.iter().zip(&ob_inc) {
        let mut ob = ptycho.object.view_mut(&pod.object);
        ob += inc;
        if let Some([min, max]) = p.clip_object {
            clip_magnitude(&mut ob, min, max);
        }
    }

    if update_probe {
        for ((pod, object), delta) in pods.iter().zip(&objects).zip(&update.deltas) {
            let inc = probe_gradient(object.view(), delta, p.beta);
            let mut pr = ptycho.probe.view_mut(&pod.probe);
            pr += &inc;
        }
        let mut storages: Vec<_> = pods.iter().map(|pod| pod.probe.storage).collect();
        storages.sort_unstable();
        storages.dedup();
        for id in storages {
            if let Some(Some(support)) = schedule.supports.get(id.0) {
                apply_support(ptycho.probe.storage_mut(id)?.data.view_mut(), support);
            }
        }
    }

    for ((pod, po), delta) in pods.iter().zip(&po).zip(&update.deltas) {
        let mut ex = ptycho.exit.view_mut(&pod.exit);
        ex.assign(po);
        ex += delta;
    }
    Ok(Some(update.errors))
}

impl Engine for Epie {
    fn name(&self) -> &'static str {
        "EPIE"
    }

    fn initialize(&mut self, ptycho: &mut Ptycho) -> Result<()> {
        let schedule = Schedule::new(ptycho, &self.p)?;
        info!(
            frames = schedule.frames.len(),
            pbound = ?schedule.pbound,
            seed = self.p.seed,
            "Initialized ePIE"
        );
        self.state = Some(schedule);
        self.curiter = 0;
        Ok(())
    }

    fn iterate(&mut self, ptycho: &mut Ptycho, num: usize) -> Result<IterationErrors> {
        let mut schedule = self.state.take().ok_or(Error::NotInitialized("EPIE"))?;
        let mut errors = IterationErrors {
            iteration: self.curiter,
            frames: Vec::new(),
        };
        let mut result = Ok(());
        for _ in 0..num {
            let update_probe = self.curiter >= self.p.probe_update_start;
            schedule.shuffle();
            let mut frames = vec![None; schedule.frames.len()];
            for &f in &schedule.order {
                match frame_update(&self.p, &schedule, ptycho, &schedule.frames[f], update_probe) {
                    Ok(Some(e)) => frames[f] = Some(e),
                    Ok(None) => warn!(frame = f, "Skipping frame without valid detector pixels"),
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            if result.is_err() {
                break;
            }
            center_probes(ptycho, self.p.probe_center_tol);
            errors = IterationErrors {
                iteration: self.curiter,
                frames,
            };
            self.curiter += 1;
        }
        self.state = Some(schedule);
        result.map(|_| errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::run;
    use crate::sim;
    use ndarray::s;

    fn known_probe() -> EpieParams {
        EpieParams {
            fourier_relax_factor: 0.0,
            probe_update_start: usize::MAX,
            compute_log_likelihood: false,
            ..EpieParams::default()
        }
    }

    #[test]
    fn recovers_object_with_known_probe() {
        let mut sim = sim::farfield_scan(8);
        let mut engine = Epie::new(known_probe()).unwrap();

        let trace = sim::fmag_trace(&run(&mut engine, &mut sim.ptycho, 30).unwrap());

        let (first, last) = (trace[0], trace[29]);
        assert!(last < 0.05 * first, "fmag {} -> {}", first, last);
        assert!(sim::largest_increase(&trace) < 1.1, "{:?}", trace);
        assert!(sim::object_residual(&sim) < 0.05);
    }

    #[test]
    fn recovers_object_while_refining_illumination() {
        let mut sim = sim::farfield_scan(6);
        let start = sim.probe.mapv(|p| p * 0.8);
        sim.ptycho.probe.storages_mut()[0]
            .data
            .slice_mut(s![0, .., ..])
            .assign(&start);
        let mut engine = Epie::new(EpieParams {
            fourier_relax_factor: 0.0,
            probe_support: None,
            compute_log_likelihood: false,
            ..EpieParams::default()
        })
        .unwrap();

        let trace = sim::fmag_trace(&run(&mut engine, &mut sim.ptycho, 60).unwrap());

        assert!(trace[59] < 0.1 * trace[0], "fmag {} -> {}", trace[0], trace[59]);
        let residual = sim::object_residual(&sim);
        assert!(residual < 0.1, "residual {}", residual);
        let recovered = sim.ptycho.probe.storages()[0].data.slice(s![0, .., ..]);
        assert!(sim::correlation(sim.probe.view(), recovered) > 0.95);
        assert_ne!(recovered, start);
    }

    #[test]
    fn equal_seeds_give_equal_reconstructions() {
        let reconstruct = |seed| {
            let mut sim = sim::farfield_scan(8);
            let mut engine = Epie::new(EpieParams {
                seed,
                ..EpieParams::default()
            })
            .unwrap();
            run(&mut engine, &mut sim.ptycho, 4).unwrap();
            (
                engine.order().map(|o| o.to_vec()),
                sim.ptycho.object,
                sim.ptycho.probe,
            )
        };

        let a = reconstruct(11);
        let b = reconstruct(11);
        assert_eq!(a, b);

        let c = reconstruct(12);
        assert_ne!(a.0, c.0);
    }

    #[test]
    fn order_is_a_permutation() {
        let mut sim = sim::farfield_scan(8);
        let mut engine = Epie::new(EpieParams::default()).unwrap();
        engine.initialize(&mut sim.ptycho).unwrap();
        engine.iterate(&mut sim.ptycho, 1).unwrap();

        let mut order = engine.order().unwrap().to_vec();
        order.sort_unstable();
        assert_eq!(order, (0..sim.positions).collect::<Vec<_>>());
    }

    #[test]
    fn probe_waits_for_start_iteration() {
        let mut sim = sim::farfield_scan(8);
        let initial = sim.ptycho.probe.clone();
        let mut engine = Epie::new(EpieParams {
            probe_update_start: 2,
            ..EpieParams::default()
        })
        .unwrap();

        engine.initialize(&mut sim.ptycho).unwrap();
        engine.iterate(&mut sim.ptycho, 2).unwrap();
        assert_eq!(sim.ptycho.probe, initial);

        engine.iterate(&mut sim.ptycho, 1).unwrap();
        assert_ne!(sim.ptycho.probe, initial);
    }

    #[test]
    fn frame_without_valid_pixels_is_left_alone() {
        let mut sim = sim::farfield_scan(8);
        sim.ptycho.mask.storages_mut()[0]
            .data
            .slice_mut(s![0, .., ..])
            .fill(0.0);
        let exit_before = sim.ptycho.exit.storages()[0]
            .data
            .slice(s![0, .., ..])
            .to_owned();
        let mut engine = Epie::new(known_probe()).unwrap();

        engine.initialize(&mut sim.ptycho).unwrap();
        let errors = engine.iterate(&mut sim.ptycho, 1).unwrap();

        assert!(errors.frames[0].is_none());
        assert!(errors.frames[1..].iter().all(Option::is_some));
        assert_eq!(
            sim.ptycho.exit.storages()[0].data.slice(s![0, .., ..]),
            exit_before
        );
    }

    #[test]
    fn clipping_bounds_the_object() {
        let mut sim = sim::farfield_scan(8);
        let mut engine = Epie::new(EpieParams {
            clip_object: Some([0.0, 0.95]),
            ..known_probe()
        })
        .unwrap();

        run(&mut engine, &mut sim.ptycho, 3).unwrap();

        // the views cover the whole object
        assert!(sim.ptycho.object.storages()[0]
            .data
            .iter()
            .all(|o| o.norm() <= 0.95 + 1e-12));
    }
}
