//! ePIE through a stack of thin object slices.
//!
//! The probe is transmitted by the first slice, propagated in the near field over one slice
//! thickness, transmitted by the next slice and so on. The far-field pattern of the last exit wave
//! is compared with the measurement, and the correction is carried back through the stack: the
//! updated incident wave of a slice, propagated backwards, becomes the target exit wave of the
//! slice before it.

use ndarray::{Array2, Zip};
use num_complex::Complex;
use serde::Deserialize;
use tracing::{info, warn};

use super::epie::{EpieParams, Schedule};
use super::{center_probes, check_param, Engine, IterationErrors};
use crate::container::{Container, Ptycho};
use crate::error::{Error, Result};
use crate::fourier::FourierErrors;
use crate::geometry::{Geo, GeometryConfig, Propagation};
use crate::grids::Pair;
use crate::overlap::{object_gradient, probe_gradient};
use crate::support::{apply_support, clip_magnitude};

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct MultisliceParams {
    #[serde(flatten)]
    pub epie: EpieParams,
    pub number_of_slices: usize,
    /// Distance between slices in meters.
    pub slice_thickness: f64,
}

impl Default for MultisliceParams {
    fn default() -> Self {
        MultisliceParams {
            epie: EpieParams::default(),
            number_of_slices: 2,
            slice_thickness: 1e-6,
        }
    }
}

impl MultisliceParams {
    pub fn validate(&self) -> Result<()> {
        self.epie.validate()?;
        check_param(
            self.number_of_slices > 0,
            "number_of_slices must be at least 1",
        )?;
        check_param(
            self.slice_thickness.is_finite() && self.slice_thickness > 0.0,
            format!("slice_thickness must be positive, got {}", self.slice_thickness),
        )
    }
}

/// Result of one pod update.
#[derive(Clone, Debug)]
pub struct SliceUpdate {
    /// Exit wave of the last slice before the update.
    pub exit: Array2<Complex<f64>>,
    /// `None` if the frame had no valid detector pixel and nothing was updated.
    pub errors: Option<FourierErrors>,
}

struct SliceState {
    schedule: Schedule,
    slices: Vec<Container<Complex<f64>>>,
    /// Near-field geometry between slices, one per geometry of the problem.
    slice_geometries: Vec<Geo>,
}

pub struct Multislice {
    p: MultisliceParams,
    curiter: usize,
    state: Option<SliceState>,
}

/// Near-field geometry over one slice thickness, sampled like the sample plane of `geo`.
fn slice_geometry(geo: &Geo, thickness: f64) -> Result<Geo> {
    let config = GeometryConfig {
        energy: Some(geo.energy()),
        lam: None,
        distance: Some(thickness),
        psize: Some(Pair::PerAxis(geo.resolution())),
        resolution: None,
        shape: Some(Pair::PerAxis(geo.shape())),
        propagation: Propagation::Nearfield,
        ..GeometryConfig::default()
    };
    Geo::with_backend(&config, geo.backend())
}

impl Multislice {
    pub fn new(p: MultisliceParams) -> Result<Self> {
        p.validate()?;
        Ok(Multislice {
            p,
            curiter: 0,
            state: None,
        })
    }

    pub fn params(&self) -> &MultisliceParams {
        &self.p
    }

    /// Number of completed iterations.
    pub fn iteration(&self) -> usize {
        self.curiter
    }

    /// The object slices, in the order the beam traverses them.
    pub fn slice_objects(&self) -> Option<&[Container<Complex<f64>>]> {
        self.state.as_ref().map(|s| s.slices.as_slice())
    }

    pub fn slice_objects_mut(&mut self) -> Option<&mut [Container<Complex<f64>>]> {
        self.state.as_mut().map(|s| s.slices.as_mut_slice())
    }

    /// Propagates the probe of pod `pod_index` through the slices, applies the Fourier constraint
    /// to the last exit wave and updates slices, probe and the pod's exit wave.
    ///
    /// The object view of the pod is set to the product of the slice views.
    pub fn multislice_update(&mut self, ptycho: &mut Ptycho, pod_index: usize) -> Result<SliceUpdate> {
        let update_probe = self.curiter >= self.p.epie.probe_update_start;
        let p = &self.p.epie;
        let SliceState {
            schedule,
            slices,
            slice_geometries,
        } = self
            .state
            .as_mut()
            .ok_or(Error::NotInitialized("ePIE_multislice"))?;
        let pod = ptycho.pods.get(pod_index).cloned().ok_or_else(|| {
            Error::InvalidParameter(format!("no pod with index {}", pod_index))
        })?;
        let prop = slice_geometries[pod.geometry].propagator();
        let n = slices.len();

        // forward
        let mut incident = vec![ptycho.probe.view(&pod.probe).to_owned()];
        let mut exits: Vec<Array2<Complex<f64>>> = Vec::with_capacity(n);
        for (s, slice) in slices.iter().enumerate() {
            let exit = Zip::from(&incident[s])
                .and(&slice.view(&pod.object))
                .map_collect(|&p, &o| p * o);
            if s + 1 < n {
                incident.push(prop.fw(exit.view()));
            }
            exits.push(exit);
        }
        let last = exits[n - 1].clone();

        let update = p.constraint(schedule.pbound).apply(
            ptycho.geometries[pod.geometry].propagator(),
            std::slice::from_ref(&last),
            &[last.view()],
            ptycho.diff.view(&pod.diff),
            ptycho.mask.view(&pod.mask),
        );
        let update = match update {
            Some(update) => update,
            None => {
                warn!(pod = pod_index, "Skipping pod without valid detector pixels");
                return Ok(SliceUpdate {
                    exit: last,
                    errors: None,
                });
            }
        };
        let mut delta = match update.deltas.into_iter().next() {
            Some(delta) => delta,
            None => {
                return Ok(SliceUpdate {
                    exit: last,
                    errors: None,
                })
            }
        };
        let new_exit = &last + &delta;

        // backward
        for s in (0..n).rev() {
            let object = slices[s].view(&pod.object).to_owned();
            let probe_inc = probe_gradient(object.view(), &delta, p.beta);
            for inc in object_gradient(&[incident[s].view()], std::slice::from_ref(&delta), p.alpha) {
                let mut ob = slices[s].view_mut(&pod.object);
                ob += &inc;
                if let Some([min, max]) = p.clip_object {
                    clip_magnitude(&mut ob, min, max);
                }
            }
            let updated = &incident[s] + &probe_inc;
            if s > 0 {
                delta = prop.bw(updated.view()) - &exits[s - 1];
            } else if update_probe {
                ptycho.probe.view_mut(&pod.probe).assign(&updated);
                if let Some(Some(support)) = schedule.supports.get(pod.probe.storage.0) {
                    apply_support(
                        ptycho.probe.storage_mut(pod.probe.storage)?.data.view_mut(),
                        support,
                    );
                }
            }
        }

        ptycho.exit.view_mut(&pod.exit).assign(&new_exit);
        let mut object = ptycho.object.view_mut(&pod.object);
        object.assign(&slices[0].view(&pod.object));
        for slice in &slices[1..] {
            object *= &slice.view(&pod.object);
        }

        Ok(SliceUpdate {
            exit: last,
            errors: Some(update.errors),
        })
    }
}

impl Engine for Multislice {
    fn name(&self) -> &'static str {
        "ePIE_multislice"
    }

    fn initialize(&mut self, ptycho: &mut Ptycho) -> Result<()> {
        let schedule = Schedule::new(ptycho, &self.p.epie)?;
        if let Some(frame) = schedule.frames.iter().find(|f| f.pods.len() != 1) {
            return Err(Error::InvalidParameter(format!(
                "multislice needs exactly one pod per frame, found {}",
                frame.pods.len()
            )));
        }
        let slice_geometries = ptycho
            .geometries
            .iter()
            .map(|g| slice_geometry(g, self.p.slice_thickness))
            .collect::<Result<Vec<_>>>()?;
        let slices = vec![ptycho.object.clone(); self.p.number_of_slices];

        info!(
            frames = schedule.frames.len(),
            slices = self.p.number_of_slices,
            slice_thickness = self.p.slice_thickness,
            pbound = ?schedule.pbound,
            "Initialized multislice ePIE"
        );
        self.state = Some(SliceState {
            schedule,
            slices,
            slice_geometries,
        });
        self.curiter = 0;
        Ok(())
    }

    fn iterate(&mut self, ptycho: &mut Ptycho, num: usize) -> Result<IterationErrors> {
        let mut errors = IterationErrors {
            iteration: self.curiter,
            frames: Vec::new(),
        };
        for _ in 0..num {
            let (order, pods) = {
                let state = self
                    .state
                    .as_mut()
                    .ok_or(Error::NotInitialized("ePIE_multislice"))?;
                state.schedule.shuffle();
                let pods: Vec<usize> = state.schedule.frames.iter().map(|f| f.pods[0]).collect();
                (state.schedule.order.clone(), pods)
            };
            let mut frames = vec![None; pods.len()];
            for f in order {
                frames[f] = self.multislice_update(ptycho, pods[f])?.errors;
            }
            center_probes(ptycho, self.p.epie.probe_center_tol);
            errors = IterationErrors {
                iteration: self.curiter,
                frames,
            };
            self.curiter += 1;
        }
        Ok(errors)
    }

    /// Writes the product of all slices into the object.
    fn finalize(&mut self, ptycho: &mut Ptycho) -> Result<()> {
        let state = self
            .state
            .as_ref()
            .ok_or(Error::NotInitialized("ePIE_multislice"))?;
        for (i, storage) in ptycho.object.storages_mut().iter_mut().enumerate() {
            storage.data.assign(&state.slices[0].storages()[i].data);
            for slice in &state.slices[1..] {
                storage.data *= &slice.storages()[i].data;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ScanData;
    use crate::engine::{run, Epie};
    use crate::sim::{self, FRAME, OBJECT};
    use ndarray::{s, Array3};

    fn params(slices: usize, thickness: f64) -> MultisliceParams {
        MultisliceParams {
            epie: EpieParams {
                seed: 3,
                ..EpieParams::default()
            },
            number_of_slices: slices,
            slice_thickness: thickness,
        }
    }

    #[test]
    fn forward_exit_is_slice_composition() {
        let mut sim = sim::farfield_scan(8);
        let mut engine = Multislice::new(params(2, 1e-4)).unwrap();
        engine.initialize(&mut sim.ptycho).unwrap();
        {
            let slices = engine.slice_objects_mut().unwrap();
            slices[0].storages_mut()[0]
                .data
                .slice_mut(s![0, .., ..])
                .assign(&sim::test_object(OBJECT));
            slices[1].storages_mut()[0]
                .data
                .slice_mut(s![0, .., ..])
                .assign(&sim::test_object(OBJECT).t());
        }

        let pod = sim.ptycho.pods[7].clone();
        let probe = sim.ptycho.probe.view(&pod.probe).to_owned();
        let o1 = engine.slice_objects().unwrap()[0].view(&pod.object).to_owned();
        let o2 = engine.slice_objects().unwrap()[1].view(&pod.object).to_owned();
        let slice_geo = Geo::new(&GeometryConfig {
            energy: Some(6.2),
            distance: Some(1e-4),
            psize: Some(Pair::PerAxis(sim.ptycho.geometries[0].resolution())),
            shape: Some(Pair::Both(FRAME)),
            propagation: Propagation::Nearfield,
            ..GeometryConfig::default()
        })
        .unwrap();
        let transmitted = slice_geo.propagator().fw((&probe * &o1).view());
        let expected = &transmitted * &o2;

        let update = engine.multislice_update(&mut sim.ptycho, 7).unwrap();

        assert!(update.errors.is_some());
        Zip::from(&update.exit)
            .and(&expected)
            .for_each(|a, b| assert!((a - b).norm() < 1e-12));
        // propagation over 100 µm changes the wave noticeably
        let direct = &(&probe * &o1) * &o2;
        assert!(Zip::from(&direct)
            .and(&expected)
            .fold(0.0, |acc, a, b| acc + (a - b).norm_sqr())
            > 1e-6);
    }

    #[test]
    fn object_is_product_of_slices() {
        let mut sim = sim::farfield_scan(8);
        let mut engine = Multislice::new(params(3, 1e-6)).unwrap();

        run(&mut engine, &mut sim.ptycho, 3).unwrap();

        let slices = engine.slice_objects().unwrap();
        let mut product = slices[0].storages()[0].data.clone();
        for slice in &slices[1..] {
            product *= &slice.storages()[0].data;
        }
        Zip::from(&product)
            .and(&sim.ptycho.object.storages()[0].data)
            .for_each(|a, b| assert!((a - b).norm() < 1e-12));
    }

    #[test]
    fn single_slice_is_epie() {
        let mut a = sim::farfield_scan(8);
        let mut b = sim::farfield_scan(8);
        let mut multislice = Multislice::new(params(1, 1e-6)).unwrap();
        let mut epie = Epie::new(params(1, 1e-6).epie).unwrap();

        let ta = run(&mut multislice, &mut a.ptycho, 4).unwrap();
        let tb = run(&mut epie, &mut b.ptycho, 4).unwrap();

        for (x, y) in [
            (&a.ptycho.object, &b.ptycho.object),
            (&a.ptycho.probe, &b.ptycho.probe),
            (&a.ptycho.exit, &b.ptycho.exit),
        ] {
            Zip::from(&x.storages()[0].data)
                .and(&y.storages()[0].data)
                .for_each(|p, q| assert!((p - q).norm() < 1e-12));
        }
        let fa = ta[3].mean().unwrap().fmag;
        let fb = tb[3].mean().unwrap().fmag;
        assert!((fa - fb).abs() <= 1e-12 * fb.max(1.0));
    }

    #[test]
    fn probe_modes_are_rejected() {
        let geo = sim::geometry();
        let probe = sim::gaussian_probe(FRAME, 6.0);
        let mut modes = Array3::zeros((2, FRAME, FRAME));
        modes.slice_mut(s![0, .., ..]).assign(&probe);
        modes.slice_mut(s![1, .., ..]).assign(&probe.mapv(|p| p * 0.1));
        let mut ptycho = Ptycho::from_scan(ScanData {
            geometry: geo,
            positions: vec![[0, 0], [8, 8]],
            probe: modes,
            object: Array2::from_elem((48, 48), Complex::new(1.0, 0.0)),
            intensities: Array3::ones((2, FRAME, FRAME)),
            mask: None,
        })
        .unwrap();
        let mut engine = Multislice::new(MultisliceParams::default()).unwrap();

        assert!(matches!(
            engine.initialize(&mut ptycho),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn update_before_initialize_fails() {
        let mut sim = sim::farfield_scan(8);
        let mut engine = Multislice::new(MultisliceParams::default()).unwrap();
        assert!(matches!(
            engine.multislice_update(&mut sim.ptycho, 0),
            Err(Error::NotInitialized(_))
        ));
        assert!(engine.slice_objects().is_none());
    }

    #[test]
    fn rejects_zero_slices() {
        assert!(Multislice::new(MultisliceParams {
            number_of_slices: 0,
            ..MultisliceParams::default()
        })
        .is_err());
    }
}
