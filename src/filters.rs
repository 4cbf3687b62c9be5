//! Gaussian smoothing of complex arrays.

use ndarray::{Array2, ArrayView2, Axis, Zip};
use num_complex::Complex;

/// Filter half-width in units of the standard deviation.
const TRUNCATE: f64 = 4.0;

/// Normalized 1-D Gaussian kernel, truncated at `TRUNCATE` standard deviations.
pub fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (TRUNCATE * sigma + 0.5) as isize;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|x| (-(x * x) as f64 / denom).exp())
        .collect();
    let sum: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

// mirrors about the array edge, repeating the edge sample: (d c b a | a b c d | d c b a)
fn reflect(i: isize, n: usize) -> usize {
    let period = 2 * n as isize;
    let m = i.rem_euclid(period) as usize;
    if m < n {
        m
    } else {
        2 * n - 1 - m
    }
}

fn filter_axis(
    input: ArrayView2<Complex<f64>>,
    axis: Axis,
    kernel: &[f64],
) -> Array2<Complex<f64>> {
    let radius = (kernel.len() / 2) as isize;
    let mut output = Array2::zeros(input.raw_dim());
    Zip::from(output.lanes_mut(axis))
        .and(input.lanes(axis))
        .par_for_each(|mut out, lane| {
            let n = lane.len();
            for (i, o) in out.iter_mut().enumerate() {
                let mut acc = Complex::new(0.0, 0.0);
                for (k, &w) in kernel.iter().enumerate() {
                    let j = reflect(i as isize + k as isize - radius, n);
                    acc += lane[j] * w;
                }
                *o = acc;
            }
        });
    output
}

/// Separable Gaussian filter with standard deviation `sigma` pixels per axis.
///
/// Samples beyond the edges are mirrored. Axes with `sigma <= 0` are left unfiltered.
pub fn gaussian_filter(input: ArrayView2<Complex<f64>>, sigma: [f64; 2]) -> Array2<Complex<f64>> {
    let mut output = input.to_owned();
    for (axis, &s) in sigma.iter().enumerate() {
        if s > 0.0 {
            output = filter_axis(output.view(), Axis(axis), &gaussian_kernel(s));
        }
    }
    output
}
