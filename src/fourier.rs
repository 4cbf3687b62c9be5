//! Fourier (data consistency) constraint.
//!
//! Replaces the modulus of the propagated exit waves with the measured one while keeping their
//! phase, inside the detector mask, and returns the resulting change of the exit waves.

use ndarray::{Array2, ArrayView2, Zip};
use num_complex::Complex;

use crate::container::{Frame, Ptycho};
use crate::propagator::Propagator;

/// Guards the modulus replacement against division by zero.
const AMPLITUDE_FLOOR: f64 = 1e-10;

/// Error metrics of one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FourierErrors {
    /// Masked mean squared deviation of the modulus, in units of `pbound` when one is set.
    pub fmag: f64,
    /// Photon error, `Σ mask·(LL − I)²/(I + 1) / Npix`.
    pub phot: f64,
    /// Summed mean squared change of the exit waves.
    pub exit: f64,
}

/// Knobs of the constraint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FourierConstraint {
    /// Mixing between the current exit wave and `probe · object`. `0` gives the plain projection.
    pub alpha: f64,
    /// Power bound. Deviations below it are not corrected.
    pub pbound: Option<f64>,
    /// Whether to compute the photon error, which costs an extra transform per pod.
    pub log_likelihood: bool,
}

impl Default for FourierConstraint {
    fn default() -> Self {
        FourierConstraint {
            alpha: 1.0,
            pbound: None,
            log_likelihood: true,
        }
    }
}

/// Exit wave changes of one frame, in the order of the pods passed in, and the frame's errors.
#[derive(Clone, Debug)]
pub struct FourierUpdate {
    pub deltas: Vec<Array2<Complex<f64>>>,
    pub errors: FourierErrors,
}

impl FourierConstraint {
    /// Applies the constraint to one frame.
    ///
    /// * `prop` - Propagator of the frame's geometry
    /// * `po` - `probe · object` of every pod of the frame
    /// * `exits` - Current exit waves, matching `po`
    /// * `intensity` - Measured intensity
    /// * `mask` - Detector weights
    ///
    /// Returns `None` if the mask has no valid pixel, in which case nothing should be updated.
    pub fn apply(
        &self,
        prop: &Propagator,
        po: &[Array2<Complex<f64>>],
        exits: &[ArrayView2<Complex<f64>>],
        intensity: ArrayView2<f64>,
        mask: ArrayView2<f64>,
    ) -> Option<FourierUpdate> {
        debug_assert_eq!(po.len(), exits.len());
        let mask_sum = mask.sum();
        if mask_sum <= 0.0 {
            return None;
        }
        let npix = intensity.len() as f64;
        let alpha = self.alpha;

        let phot = if self.log_likelihood {
            let mut ll = Array2::<f64>::zeros(intensity.raw_dim());
            for p in po {
                let f = prop.fw(p.view());
                Zip::from(&mut ll).and(&f).for_each(|l, f| *l += f.norm_sqr());
            }
            Zip::from(&ll)
                .and(&intensity)
                .and(&mask)
                .fold(0.0, |acc, &l, &i, &m| acc + m * (l - i) * (l - i) / (i + 1.0))
                / npix
        } else {
            0.0
        };

        let f: Vec<Array2<Complex<f64>>> = po
            .iter()
            .zip(exits)
            .map(|(p, e)| {
                let mut mixed = Array2::zeros(p.raw_dim());
                Zip::from(&mut mixed)
                    .and(p)
                    .and(e)
                    .for_each(|m, &p, &e| *m = p * (1.0 + alpha) - e * alpha);
                prop.fw(mixed.view())
            })
            .collect();

        let mut af = Array2::<f64>::zeros(intensity.raw_dim());
        for f in &f {
            Zip::from(&mut af).and(f).for_each(|a, f| *a += f.norm_sqr());
        }
        af.mapv_inplace(f64::sqrt);

        let fdev = Zip::from(&af)
            .and(&intensity)
            .map_collect(|&a, &i| a - i.abs().sqrt());
        let err_fmag = Zip::from(&fdev)
            .and(&mask)
            .fold(0.0, |acc, &d, &m| acc + m * d * d)
            / mask_sum;

        let renorm = match self.pbound {
            None => Some(0.0),
            Some(pbound) if err_fmag > pbound => Some((pbound / err_fmag).sqrt()),
            Some(_) => None,
        };

        let deltas: Vec<Array2<Complex<f64>>> = match renorm {
            Some(renorm) => {
                let fm = Zip::from(&af)
                    .and(&fdev)
                    .and(&mask)
                    .map_collect(|&a, &d, &m| {
                        let fmag = a - d;
                        (1.0 - m) + m * (fmag + d * renorm) / (a + AMPLITUDE_FLOOR)
                    });
                f.into_iter()
                    .zip(po)
                    .map(|(mut f, p)| {
                        Zip::from(&mut f).and(&fm).for_each(|f, &fm| *f *= fm);
                        let mut df = prop.bw(f.view());
                        df -= p;
                        df
                    })
                    .collect()
            }
            None => po
                .iter()
                .zip(exits)
                .map(|(p, e)| Zip::from(p).and(e).map_collect(|&p, &e| (p - e) * alpha))
                .collect(),
        };

        let exit = deltas
            .iter()
            .map(|d| d.iter().map(|e| e.norm_sqr()).sum::<f64>() / d.len() as f64)
            .sum();
        let fmag = match self.pbound {
            Some(pbound) => err_fmag / pbound,
            None => err_fmag,
        };

        Some(FourierUpdate {
            deltas,
            errors: FourierErrors { fmag, phot, exit },
        })
    }
}

/// Photon statistics of the measured data.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PowerStats {
    /// Largest masked photon count of a single frame.
    pub max_power: f64,
    /// Masked photon count of all frames.
    pub tot_power: f64,
    /// Average masked photon count per detector pixel.
    pub mean_power: f64,
    pub frame_pixels: usize,
}

impl PowerStats {
    pub fn from_frames(ptycho: &Ptycho, frames: &[Frame]) -> Self {
        let mut stats = PowerStats::default();
        for frame in frames {
            let diff = ptycho.diff.view(&frame.diff);
            let mask = ptycho.mask.view(&frame.mask);
            let power = Zip::from(&diff)
                .and(&mask)
                .fold(0.0, |acc, &d, &m| acc + d * m);
            stats.max_power = stats.max_power.max(power);
            stats.tot_power += power;
            stats.frame_pixels = stats.frame_pixels.max(diff.len());
        }
        if !frames.is_empty() && stats.frame_pixels > 0 {
            stats.mean_power = stats.tot_power / (frames.len() * stats.frame_pixels) as f64;
        }
        stats
    }

    /// Power bound for a relaxation factor. Factors `<= 0` disable the bound.
    pub fn pbound(&self, fourier_relax_factor: f64) -> Option<f64> {
        if fourier_relax_factor > 0.0 && self.frame_pixels > 0 {
            Some(
                0.25 * fourier_relax_factor * fourier_relax_factor * self.max_power
                    / self.frame_pixels as f64,
            )
        } else {
            None
        }
    }
}

/// `probe · object` of the given pods.
pub(crate) fn probe_times_object(ptycho: &Ptycho, pods: &[usize]) -> Vec<Array2<Complex<f64>>> {
    pods.iter()
        .map(|&i| {
            let pod = &ptycho.pods[i];
            let pr = ptycho.probe.view(&pod.probe);
            let ob = ptycho.object.view(&pod.object);
            Zip::from(&pr).and(&ob).map_collect(|&p, &o| p * o)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Geo, GeometryConfig};
    use crate::grids::Pair;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn geo() -> Geo {
        Geo::new(&GeometryConfig {
            shape: Some(Pair::Both(16)),
            ..GeometryConfig::default()
        })
        .unwrap()
    }

    fn random_wave(rng: &mut ChaCha8Rng) -> Array2<Complex<f64>> {
        Array2::from_shape_fn((16, 16), |_| {
            Complex::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
        })
    }

    fn intensity_of(prop: &Propagator, waves: &[Array2<Complex<f64>>]) -> Array2<f64> {
        let mut i = Array2::zeros((16, 16));
        for w in waves {
            let f = prop.fw(w.view());
            Zip::from(&mut i).and(&f).for_each(|i, f| *i += f.norm_sqr());
        }
        i
    }

    fn projection() -> FourierConstraint {
        FourierConstraint {
            alpha: 0.0,
            pbound: None,
            log_likelihood: true,
        }
    }

    #[test]
    fn consistent_data_needs_no_correction() {
        let geo = geo();
        let prop = geo.propagator();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let po = vec![random_wave(&mut rng)];
        let intensity = intensity_of(prop, &po);
        let mask = Array2::ones((16, 16));

        let update = FourierConstraint::default()
            .apply(prop, &po, &[po[0].view()], intensity.view(), mask.view())
            .unwrap();

        assert!(update.errors.fmag < 1e-20);
        assert!(update.errors.phot < 1e-20);
        assert!(update.errors.exit < 1e-16);
    }

    #[test]
    fn projection_matches_measured_modulus_inside_mask() {
        let geo = geo();
        let prop = geo.propagator();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let po = vec![random_wave(&mut rng)];
        let target = intensity_of(prop, &[random_wave(&mut rng)]);
        let mut mask = Array2::ones((16, 16));
        mask[[3, 5]] = 0.0;

        let update = projection()
            .apply(prop, &po, &[po[0].view()], target.view(), mask.view())
            .unwrap();

        let corrected = &po[0] + &update.deltas[0];
        let before = prop.fw(po[0].view());
        let after = prop.fw(corrected.view());
        for ((idx, a), b) in after.indexed_iter().zip(before.iter()) {
            if idx == (3, 5) {
                assert!((a - b).norm() < 1e-9);
            } else {
                assert!((a.norm() - target[idx].sqrt()).abs() < 1e-8);
                assert!((a * b.conj()).arg().abs() < 1e-6 || b.norm() < 1e-6);
            }
        }
    }

    #[test]
    fn modes_share_the_measured_intensity() {
        let geo = geo();
        let prop = geo.propagator();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let po = vec![random_wave(&mut rng), random_wave(&mut rng)];
        let target = intensity_of(prop, &[random_wave(&mut rng), random_wave(&mut rng)]);
        let mask = Array2::ones((16, 16));
        let exits: Vec<_> = po.iter().map(|p| p.view()).collect();

        let update = projection()
            .apply(prop, &po, &exits, target.view(), mask.view())
            .unwrap();

        let corrected: Vec<_> = po
            .iter()
            .zip(&update.deltas)
            .map(|(p, d)| p + d)
            .collect();
        let achieved = intensity_of(prop, &corrected);
        Zip::from(&achieved)
            .and(&target)
            .for_each(|a, t| assert!((a - t).abs() < 1e-8 * (1.0 + t)));
    }

    #[test]
    fn empty_mask_is_a_no_op() {
        let geo = geo();
        let prop = geo.propagator();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let po = vec![random_wave(&mut rng)];
        let intensity = Array2::ones((16, 16));
        let mask = Array2::zeros((16, 16));

        assert!(projection()
            .apply(prop, &po, &[po[0].view()], intensity.view(), mask.view())
            .is_none());
    }

    #[test]
    fn deviation_below_pbound_is_not_corrected() {
        let geo = geo();
        let prop = geo.propagator();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let po = vec![random_wave(&mut rng)];
        let exit = random_wave(&mut rng);
        let intensity = intensity_of(prop, &po).mapv(|i| i * 1.01);
        let mask = Array2::ones((16, 16));
        let constraint = FourierConstraint {
            alpha: 0.5,
            pbound: Some(1e3),
            log_likelihood: false,
        };

        let update = constraint
            .apply(prop, &po, &[exit.view()], intensity.view(), mask.view())
            .unwrap();

        let expected = (&po[0] - &exit).mapv(|e| e * 0.5);
        Zip::from(&update.deltas[0])
            .and(&expected)
            .for_each(|d, e| assert!((d - e).norm() < 1e-12));
        assert!(update.errors.fmag < 1.0);
        assert_eq!(update.errors.phot, 0.0);
    }

    #[test]
    fn deviation_above_pbound_is_relaxed_to_the_bound() {
        let geo = geo();
        let prop = geo.propagator();
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let po = vec![random_wave(&mut rng)];
        let intensity = intensity_of(prop, &[random_wave(&mut rng)]);
        let mask = Array2::ones((16, 16));

        let unbounded = projection()
            .apply(prop, &po, &[po[0].view()], intensity.view(), mask.view())
            .unwrap();
        let err = unbounded.errors.fmag;
        let pbound = err / 4.0;
        let bounded = FourierConstraint {
            pbound: Some(pbound),
            ..projection()
        }
        .apply(prop, &po, &[po[0].view()], intensity.view(), mask.view())
        .unwrap();

        assert!((bounded.errors.fmag - 4.0).abs() < 1e-9);

        // the corrected modulus lies halfway, since renorm = sqrt(1/4)
        let corrected = &po[0] + &bounded.deltas[0];
        let before = prop.fw(po[0].view());
        let after = prop.fw(corrected.view());
        for ((idx, a), b) in after.indexed_iter().zip(before.iter()) {
            let fmag = intensity[idx].sqrt();
            let expected = fmag + (b.norm() - fmag) * 0.5;
            assert!((a.norm() - expected).abs() < 1e-8);
        }
    }

    #[test]
    fn pbound_from_relax_factor() {
        let stats = PowerStats {
            max_power: 1000.0,
            tot_power: 2500.0,
            mean_power: 2500.0 / 3.0 / 100.0,
            frame_pixels: 100,
        };
        assert_eq!(stats.pbound(0.0), None);
        assert_eq!(stats.pbound(-1.0), None);
        let pbound = stats.pbound(0.2).unwrap();
        assert!((pbound - 0.25 * 0.04 * 10.0).abs() < 1e-15);
    }
}
