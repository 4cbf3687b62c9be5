//! Overlap constraint: updates of the shared object and probe from the exit waves of all views.
//!
//! The projection form accumulates numerator and normalization buffers over all active pods and
//! divides once. Pods are split into one chunk per worker thread, each chunk accumulates into its
//! own buffers, and the buffers are merged by addition. The number of full-size buffers is
//! therefore bounded by the thread count, not by the number of pods.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayViewMut2, Axis, Zip};
use num_complex::Complex;
use rayon::prelude::*;

use crate::container::{Container, Pod, Ptycho, View};
use crate::filters::gaussian_filter;
use crate::support::{apply_support, clip_magnitude};

struct Accumulator {
    num: Vec<Array3<Complex<f64>>>,
    nrm: Vec<Array3<f64>>,
}

impl Accumulator {
    fn zeros(layout: &Container<Complex<f64>>) -> Self {
        Accumulator {
            num: layout
                .storages()
                .iter()
                .map(|s| Array3::zeros(s.data.raw_dim()))
                .collect(),
            nrm: layout
                .storages()
                .iter()
                .map(|s| Array3::zeros(s.data.raw_dim()))
                .collect(),
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for (a, b) in self.num.iter_mut().zip(&other.num) {
            *a += b;
        }
        for (a, b) in self.nrm.iter_mut().zip(&other.nrm) {
            *a += b;
        }
        self
    }

    fn windows(
        &mut self,
        v: &View,
    ) -> (ArrayViewMut2<'_, Complex<f64>>, ArrayViewMut2<'_, f64>) {
        let [r, c] = v.coord;
        let [h, w] = v.shape;
        let window = s![v.layer, r..r + h, c..c + w];
        (
            self.num[v.storage.0].slice_mut(window),
            self.nrm[v.storage.0].slice_mut(window),
        )
    }

    /// Adds `conj(a) · exit · weight` to the numerator and `|a|² · weight` to the normalization,
    /// at `target`, for every pod.
    fn collect<'a, F>(layout: &Container<Complex<f64>>, pods: &[&'a Pod], contribution: F) -> Self
    where
        F: Fn(&'a Pod) -> (View, ArrayView2<'a, Complex<f64>>, ArrayView2<'a, Complex<f64>>, f64)
            + Sync,
    {
        let chunk = chunk_len(pods.len(), rayon::current_num_threads());
        pods.par_chunks(chunk)
            .map(|chunk| {
                let mut acc = Accumulator::zeros(layout);
                for &pod in chunk {
                    let (target, a, exit, weight) = contribution(pod);
                    let (mut num, mut nrm) = acc.windows(&target);
                    Zip::from(&mut num)
                        .and(&mut nrm)
                        .and(&a)
                        .and(&exit)
                        .for_each(|n, d, &a, &e| {
                            *n += a.conj() * e * weight;
                            *d += a.norm_sqr() * weight;
                        });
                }
                acc
            })
            .reduce_with(Accumulator::merge)
            .unwrap_or_else(|| Accumulator::zeros(layout))
    }
}

// pods per chunk so that `threads` chunks cover all of them
fn chunk_len(pods: usize, threads: usize) -> usize {
    let threads = threads.max(1);
    ((pods + threads - 1) / threads).max(1)
}

/// Parameters of the object projection.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ObjectUpdate {
    /// Standard deviation in pixels of the Gaussian applied to the inertia term.
    pub smooth_std: Option<f64>,
    /// Magnitude range the object is clipped to.
    pub clip: Option<[f64; 2]>,
}

/// Replaces the object with its least squares estimate given probe and exit waves.
///
/// `O = (cfact · O + Σ conj(P) · exit · w) / (cfact + Σ |P|² · w)`, with one `cfact` array per
/// object storage.
pub fn object_update(ptycho: &mut Ptycho, cfact: &[Array3<f64>], update: &ObjectUpdate) {
    let acc = {
        let Ptycho {
            probe,
            object,
            exit,
            pods,
            ..
        } = &*ptycho;
        let active: Vec<&Pod> = pods.iter().filter(|pod| pod.active).collect();
        Accumulator::collect(object, &active, |pod| {
            (
                pod.object,
                probe.view(&pod.probe),
                exit.view(&pod.exit),
                pod.object_weight,
            )
        })
    };

    for ((storage, cfact), (num, nrm)) in ptycho
        .object
        .storages_mut()
        .iter_mut()
        .zip(cfact)
        .zip(acc.num.iter().zip(&acc.nrm))
    {
        let start = match update.smooth_std {
            Some(std) if std > 0.0 => smoothed(&storage.data, std),
            _ => storage.data.clone(),
        };
        Zip::from(&mut storage.data)
            .and(&start)
            .and(num)
            .and(nrm)
            .and(cfact)
            .par_for_each(|o, &start, &n, &d, &c| {
                let denom = c + d;
                if denom > 0.0 {
                    *o = (start * c + n) / denom;
                }
            });
        if let Some([min, max]) = update.clip {
            clip_magnitude(&mut storage.data, min, max);
        }
    }
}

fn smoothed(data: &Array3<Complex<f64>>, std: f64) -> Array3<Complex<f64>> {
    let mut out = data.clone();
    for (mut dst, src) in out.axis_iter_mut(Axis(0)).zip(data.axis_iter(Axis(0))) {
        dst.assign(&gaussian_filter(src, [std, std]));
    }
    out
}

/// Replaces the probe with its least squares estimate given object and exit waves, then applies
/// the support of each probe storage.
///
/// Returns the relative change `sqrt(Σ ‖P − P_prev‖² / ‖P‖² / n_storages)`.
pub fn probe_update(ptycho: &mut Ptycho, cfact: &[f64], supports: &[Option<Array2<f64>>]) -> f64 {
    let acc = {
        let Ptycho {
            probe,
            object,
            exit,
            pods,
            ..
        } = &*ptycho;
        let active: Vec<&Pod> = pods.iter().filter(|pod| pod.active).collect();
        Accumulator::collect(probe, &active, |pod| {
            (
                pod.probe,
                object.view(&pod.object),
                exit.view(&pod.exit),
                pod.probe_weight,
            )
        })
    };

    let mut change = 0.0;
    let n_storages = ptycho.probe.len();
    for (((storage, &cfact), support), (num, nrm)) in ptycho
        .probe
        .storages_mut()
        .iter_mut()
        .zip(cfact)
        .zip(supports)
        .zip(acc.num.iter().zip(&acc.nrm))
    {
        let previous = storage.data.clone();
        Zip::from(&mut storage.data)
            .and(num)
            .and(nrm)
            .par_for_each(|p, &n, &d| {
                let denom = cfact + d;
                if denom > 0.0 {
                    *p = (*p * cfact + n) / denom;
                }
            });
        if let Some(support) = support {
            apply_support(storage.data.view_mut(), support);
        }

        let norm: f64 = storage.data.iter().map(|p| p.norm_sqr()).sum();
        let diff: f64 = Zip::from(&storage.data)
            .and(&previous)
            .fold(0.0, |acc, p, q| acc + (p - q).norm_sqr());
        if norm > 0.0 {
            change += diff / norm;
        }
    }
    if n_storages == 0 {
        0.0
    } else {
        (change / n_storages as f64).sqrt()
    }
}

/// Gradient step of the object views of a frame: `α · Σ conj(Pₖ) · Δₖ / max Σ |Pₖ|²`.
///
/// All probes have the frame shape. Returns one increment per pod; an all zero probe gives zero
/// increments.
pub fn object_gradient(
    probes: &[ArrayView2<Complex<f64>>],
    deltas: &[Array2<Complex<f64>>],
    alpha: f64,
) -> Vec<Array2<Complex<f64>>> {
    let norm = match probes.first() {
        Some(first) => {
            let mut power = Array2::<f64>::zeros(first.raw_dim());
            for p in probes {
                Zip::from(&mut power).and(p).for_each(|s, p| *s += p.norm_sqr());
            }
            power.iter().cloned().fold(0.0, f64::max)
        }
        None => 0.0,
    };
    let scale = if norm > 0.0 { alpha / norm } else { 0.0 };
    probes
        .iter()
        .zip(deltas)
        .map(|(p, d)| Zip::from(p).and(d).map_collect(|&p, &d| p.conj() * d * scale))
        .collect()
}

/// Gradient step of one probe view: `β · conj(O) · Δ / max |O|²`.
pub fn probe_gradient(
    object: ArrayView2<Complex<f64>>,
    delta: &Array2<Complex<f64>>,
    beta: f64,
) -> Array2<Complex<f64>> {
    let norm = object.iter().map(|o| o.norm_sqr()).fold(0.0, f64::max);
    let scale = if norm > 0.0 { beta / norm } else { 0.0 };
    Zip::from(&object)
        .and(delta)
        .map_collect(|&o, &d| o.conj() * d * scale)
}
