use ndarray::parallel::prelude::{IntoParallelIterator, ParallelIterator};
use ndarray::{s, Array2, ArrayView2, ArrayViewMut2, Zip};
use rustfft::num_complex::Complex;
use rustfft::num_traits::Zero;
use rustfft::{Fft, FftDirection, FftPlanner};
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex};

/// A 2D transform pair used by the propagators.
///
/// `fft2` is the unnormalised forward transform and `ifft2` the inverse normalised by `1/N`, so
/// `ifft2(fft2(x)) == x`. The far-field propagator multiplies by `forward_scale` after `fft2` and
/// `backward_scale` after `ifft2`; with the defaults the pair is unitary. Alternate backends only
/// need to honour the same convention for the same element type in and out.
pub trait FftBackend: Send + Sync + fmt::Debug {
    fn fft2(&self, input: ArrayViewMut2<Complex<f64>>);

    fn ifft2(&self, input: ArrayViewMut2<Complex<f64>>);

    fn forward_scale(&self, shape: [usize; 2]) -> f64 {
        1.0 / ((shape[0] * shape[1]) as f64).sqrt()
    }

    fn backward_scale(&self, shape: [usize; 2]) -> f64 {
        ((shape[0] * shape[1]) as f64).sqrt()
    }
}

/// Default backend: `rustfft` plans, with rows and columns processed in parallel.
///
/// Plans are cached per length and direction, so repeated transforms of the same shape reuse them.
#[derive(Default)]
pub struct RustFft {
    plans: Mutex<HashMap<(usize, bool), Arc<dyn Fft<f64>>>>,
}

impl RustFft {
    pub fn new() -> Self {
        RustFft::default()
    }

    /// Returns the cached plan for `len`, planning it on first use.
    pub fn plan(&self, len: usize, direction: FftDirection) -> Arc<dyn Fft<f64>> {
        let forward = matches!(direction, FftDirection::Forward);
        // a poisoned cache still holds valid plans
        let mut plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
        plans
            .entry((len, forward))
            .or_insert_with(|| FftPlanner::new().plan_fft(len, direction))
            .clone()
    }

    fn transform(
        &self,
        input: ArrayViewMut2<Complex<f64>>,
        direction: FftDirection,
        normalisation: f64,
    ) {
        let fft_row = self.plan(input.shape()[1], direction);
        let fft_col = self.plan(input.shape()[0], direction);
        fft2_inplace(input, fft_row.as_ref(), fft_col.as_ref(), normalisation);
    }
}

impl fmt::Debug for RustFft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self.plans.lock().map(|p| p.len()).unwrap_or(0);
        f.debug_struct("RustFft").field("cached_plans", &cached).finish()
    }
}

impl FftBackend for RustFft {
    fn fft2(&self, input: ArrayViewMut2<Complex<f64>>) {
        self.transform(input, FftDirection::Forward, 1.0);
    }

    fn ifft2(&self, input: ArrayViewMut2<Complex<f64>>) {
        let n = (input.shape()[0] * input.shape()[1]) as f64;
        self.transform(input, FftDirection::Inverse, 1.0 / n);
    }
}

/// Transforms both axes in place with the given row and column plans, multiplying every element
/// by `normalisation` on the way out.
pub fn fft2_inplace(
    mut input: ArrayViewMut2<Complex<f64>>,
    fft_row: &dyn Fft<f64>,
    fft_col: &dyn Fft<f64>,
    normalisation: f64,
) {
    debug_assert_eq!(fft_row.len(), input.shape()[1]);
    debug_assert_eq!(fft_col.len(), input.shape()[0]);

    // rows of a view into a larger array are not always contiguous, so go through a buffer
    Zip::from(input.rows_mut()).into_par_iter().for_each_init(
        || {
            (
                vec![Zero::zero(); fft_row.len()],
                vec![Zero::zero(); fft_row.get_inplace_scratch_len()],
            )
        },
        |(temp, scratch), mut row| {
            match row.0.as_slice_mut() {
                Some(slice) => fft_row.process_with_scratch(slice, scratch),
                None => {
                    for (t, e) in temp.iter_mut().zip(row.0.iter()) {
                        *t = *e;
                    }
                    fft_row.process_with_scratch(temp, scratch);
                    for (e, t) in row.0.iter_mut().zip(temp.iter()) {
                        *e = *t;
                    }
                }
            }
        },
    );

    Zip::from(input.columns_mut())
        .into_par_iter()
        .for_each_init(
            || {
                (
                    vec![Zero::zero(); fft_col.len()],
                    vec![Zero::zero(); fft_col.get_inplace_scratch_len()],
                )
            },
            |(temp, scratch), mut col| {
                debug_assert_eq!(col.0.len(), temp.len());
                for (t, e) in temp.iter_mut().zip(col.0.iter()) {
                    *t = *e;
                }
                fft_col.process_with_scratch(temp, scratch);
                for (e, t) in col.0.iter_mut().zip(temp.iter()) {
                    *e = *t * normalisation;
                }
            },
        );
}

/// Pads (positive) or crops (negative) each axis by `hplanes` elements in total, split between
/// the start and end of the axis. Odd amounts put the extra element at the start, both when
/// padding and when cropping.
///
/// `crop_pad(crop_pad(a, h), -h)` returns `a` whenever `h` is non-negative.
pub fn crop_pad(input: ArrayView2<Complex<f64>>, hplanes: [isize; 2]) -> Array2<Complex<f64>> {
    let (src0, dst0, len0) = axis_ranges(input.shape()[0], hplanes[0]);
    let (src1, dst1, len1) = axis_ranges(input.shape()[1], hplanes[1]);

    let mut out = Array2::zeros([len0, len1]);
    out.slice_mut(s![dst0, dst1])
        .assign(&input.slice(s![src0, src1]));
    out
}

// source range, destination range and output length for one axis
fn axis_ranges(len: usize, hplanes: isize) -> (Range<usize>, Range<usize>, usize) {
    debug_assert!(len as isize + hplanes > 0, "cannot crop {} from {}", hplanes, len);
    let out_len = (len as isize + hplanes) as usize;
    if hplanes >= 0 {
        let before = ((hplanes + 1) / 2) as usize;
        (0..len, before..before + len, out_len)
    } else {
        let before = ((-hplanes + 1) / 2) as usize;
        (before..before + out_len, 0..out_len, out_len)
    }
}
