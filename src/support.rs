//! Real space constraints on probe and object.

use std::f64::consts::PI;

use ndarray::{Array2, ArrayBase, ArrayView2, ArrayViewMut3, Axis, DataMut, Dimension, Zip};
use num_complex::Complex;

// returns 1.0 if greater than nominal, with a soft transition of a distance of 1.0 straddling the nominal transition.
fn soft_greater_than(x: f64, x_nominal: f64, pitch: f64) -> f64 {
    if x < x_nominal - 0.5 * pitch {
        0.0
    } else if x > x_nominal + 0.5 * pitch {
        1.0
    } else {
        (x - (x_nominal - 0.5 * pitch)) / pitch
    }
}

/// Circular support centered at `shape / 2` whose area is `fraction` of the frame area.
///
/// The edge ramps from 1 to 0 over one pixel.
pub fn circular_support(shape: [usize; 2], fraction: f64) -> Array2<f64> {
    let r = (fraction * (shape[0] * shape[1]) as f64 / PI).sqrt();
    let c = [(shape[0] / 2) as f64, (shape[1] / 2) as f64];

    let mut support = Array2::zeros(shape);
    Zip::indexed(&mut support).par_for_each(|(y, x), e| {
        let y0 = y as f64 - c[0];
        let x0 = x as f64 - c[1];
        let d = (x0 * x0 + y0 * y0).sqrt();
        *e = 1.0 - soft_greater_than(d, r, 1.0);
    });
    support
}

/// Multiplies every layer of `probe` by `support`.
pub fn apply_support(mut probe: ArrayViewMut3<Complex<f64>>, support: &Array2<f64>) {
    for mut layer in probe.axis_iter_mut(Axis(0)) {
        Zip::from(&mut layer)
            .and(support)
            .par_for_each(|p, &s| *p *= s);
    }
}

/// Clips the modulus of every element to `[min, max]`, keeping the phase.
pub fn clip_magnitude<S, D>(a: &mut ArrayBase<S, D>, min: f64, max: f64)
where
    S: DataMut<Elem = Complex<f64>>,
    D: Dimension,
{
    a.mapv_inplace(|z| {
        let norm = z.norm();
        if norm > max {
            z * (max / norm)
        } else if norm < min {
            if norm > 0.0 {
                z * (min / norm)
            } else {
                Complex::new(min, 0.0)
            }
        } else {
            z
        }
    });
}

/// Intensity weighted center of mass, in pixels.
pub fn mass_center(intensity: ArrayView2<f64>) -> Option<[f64; 2]> {
    let mut total = 0.0;
    let mut c = [0.0, 0.0];
    for ((y, x), &v) in intensity.indexed_iter() {
        total += v;
        c[0] += y as f64 * v;
        c[1] += x as f64 * v;
    }
    if total > 0.0 {
        Some([c[0] / total, c[1] / total])
    } else {
        None
    }
}

/// Periodically shifts `input` by `shift` pixels along each axis.
pub fn roll2<T: Copy>(input: ArrayView2<T>, shift: [isize; 2]) -> Array2<T> {
    let (h, w) = input.dim();
    let sy = shift[0].rem_euclid(h as isize) as usize;
    let sx = shift[1].rem_euclid(w as isize) as usize;
    Array2::from_shape_fn((h, w), |(y, x)| {
        input[[(y + h - sy) % h, (x + w - sx) % w]]
    })
}

/// Rolls all modes of `probe` so that the center of mass of their summed intensity moves to
/// `shape / 2`, if it is more than `tol` pixels away.
///
/// Returns the applied shift.
pub fn recenter(mut probe: ArrayViewMut3<Complex<f64>>, tol: f64) -> Option<[isize; 2]> {
    let (_, h, w) = probe.dim();
    let mut intensity = Array2::zeros((h, w));
    for layer in probe.axis_iter(Axis(0)) {
        Zip::from(&mut intensity)
            .and(&layer)
            .for_each(|i, p| *i += p.norm_sqr());
    }
    let c = mass_center(intensity.view())?;
    let target = [(h / 2) as f64, (w / 2) as f64];
    let d = [target[0] - c[0], target[1] - c[1]];
    if (d[0] * d[0] + d[1] * d[1]).sqrt() <= tol {
        return None;
    }
    let shift = [d[0].round() as isize, d[1].round() as isize];
    if shift == [0, 0] {
        return None;
    }
    for mut layer in probe.axis_iter_mut(Axis(0)) {
        let rolled = roll2(layer.view(), shift);
        layer.assign(&rolled);
    }
    Some(shift)
}
