//! Coordinate grids for sample and detector planes.

use ndarray::Array2;
use serde::Deserialize;

/// Where the physical origin sits in an array.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Center {
    /// `shape / 2` rounded down, the position `fftshift` moves the zero frequency to.
    FftShift,
    /// `shape / 2 - 0.5`, the geometric middle of the array.
    Geometric,
    /// The first element, as in an unshifted FFT.
    Fft,
    /// An explicit pixel position, taken modulo the shape.
    Offset([f64; 2]),
}

impl Default for Center {
    fn default() -> Self {
        Center::FftShift
    }
}

/// A value that may be given once for both axes or per axis.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Pair<T> {
    Both(T),
    PerAxis([T; 2]),
}

impl<T: Copy> Pair<T> {
    pub fn expect2(self) -> [T; 2] {
        match self {
            Pair::Both(v) => [v, v],
            Pair::PerAxis(v) => v,
        }
    }
}

impl<T> From<T> for Pair<T> {
    fn from(v: T) -> Self {
        Pair::Both(v)
    }
}

/// Translates an origin convention into a pixel position for an array of the given shape.
pub fn translate_to_pix(shape: [usize; 2], center: Center) -> [f64; 2] {
    let sh = [shape[0] as f64, shape[1] as f64];
    match center {
        Center::FftShift => [(shape[0] / 2) as f64, (shape[1] / 2) as f64],
        Center::Geometric => [sh[0] / 2.0 - 0.5, sh[1] / 2.0 - 0.5],
        Center::Fft => [0.0, 0.0],
        Center::Offset(c) => [c[0].rem_euclid(sh[0]), c[1].rem_euclid(sh[1])],
    }
}

/// Returns physical coordinate grids `(axis0, axis1)` for an array of `shape` sampled at `psize`.
///
/// Pixel offsets from the origin are wrapped into `[-shape/2, shape/2)` so that grids with an
/// `Fft` origin describe negative frequencies in the upper half of the array, as an FFT expects.
pub fn grids(shape: [usize; 2], psize: [f64; 2], center: Center) -> (Array2<f64>, Array2<f64>) {
    let cen = translate_to_pix(shape, center);
    let confine = |i: usize, axis: usize| {
        let m = shape[axis] as f64;
        let half = (shape[axis] / 2) as f64;
        ((i as f64 - cen[axis] + half).rem_euclid(m) - half) * psize[axis]
    };
    let g0 = Array2::from_shape_fn(shape, |(i, _)| confine(i, 0));
    let g1 = Array2::from_shape_fn(shape, |(_, j)| confine(j, 1));
    (g0, g1)
}

/// Like [`grids`], but without wrapping: offsets are plain `index - origin`.
pub fn grids_unwrapped(
    shape: [usize; 2],
    psize: [f64; 2],
    center: Center,
) -> (Array2<f64>, Array2<f64>) {
    let cen = translate_to_pix(shape, center);
    let g0 = Array2::from_shape_fn(shape, |(i, _)| (i as f64 - cen[0]) * psize[0]);
    let g1 = Array2::from_shape_fn(shape, |(_, j)| (j as f64 - cen[1]) * psize[1]);
    (g0, g1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_conventions() {
        assert_eq!(translate_to_pix([8, 7], Center::FftShift), [4.0, 3.0]);
        assert_eq!(translate_to_pix([8, 7], Center::Geometric), [3.5, 3.0]);
        assert_eq!(translate_to_pix([8, 7], Center::Fft), [0.0, 0.0]);
        assert_eq!(
            translate_to_pix([8, 7], Center::Offset([9.0, -1.0])),
            [1.0, 6.0]
        );
    }

    #[test]
    fn fft_grid_wraps_negative_frequencies() {
        let (g0, g1) = grids([4, 5], [1.0, 2.0], Center::Fft);
        let col: Vec<f64> = g0.column(0).to_vec();
        assert_eq!(col, vec![0.0, 1.0, -2.0, -1.0]);
        let row: Vec<f64> = g1.row(0).to_vec();
        assert_eq!(row, vec![0.0, 2.0, 4.0, -4.0, -2.0]);
    }

    #[test]
    fn fftshift_grid_is_centered() {
        let (g0, _) = grids([4, 4], [0.5, 0.5], Center::FftShift);
        let col: Vec<f64> = g0.column(0).to_vec();
        assert_eq!(col, vec![-1.0, -0.5, 0.0, 0.5]);
    }

    #[test]
    fn geometric_grids_agree() {
        let (a0, a1) = grids([6, 6], [1.0, 1.0], Center::Geometric);
        let (b0, b1) = grids_unwrapped([6, 6], [1.0, 1.0], Center::Geometric);
        assert_eq!(a0, b0);
        assert_eq!(a1, b1);
    }

    #[test]
    fn pair_deserializes_from_scalar_or_list() {
        let one: Pair<usize> = serde_json::from_str("128").unwrap();
        let two: Pair<usize> = serde_json::from_str("[64, 32]").unwrap();
        assert_eq!(one.expect2(), [128, 128]);
        assert_eq!(two.expect2(), [64, 32]);
    }
}
