use std::f64::consts::PI;
use std::sync::Arc;

use ndarray::{Array2, ArrayView2, Zip};
use num_complex::Complex;

use crate::fft2::{crop_pad, FftBackend};
use crate::geometry::GeoParams;
use crate::grids::grids;

/// Single step far-field propagator.
///
/// Includes quadratic phase factors and an arbitrary origin in both planes. If the origin is not
/// in the center of the frame, coordinates are rolled periodically, just like in the conventional
/// FFT case.
#[derive(Clone, Debug)]
pub struct FarfieldPropagator {
    crop_pad: [isize; 2],
    sh: [usize; 2],
    pre_fft: Array2<Complex<f64>>,
    post_fft: Array2<Complex<f64>>,
    pre_ifft: Array2<Complex<f64>>,
    post_ifft: Array2<Complex<f64>>,
    grids_sam: (Array2<f64>, Array2<f64>),
    grids_det: (Array2<f64>, Array2<f64>),
    resolution: [f64; 2],
    psize: [f64; 2],
    sc: f64,
    isc: f64,
    backend: Arc<dyn FftBackend>,
}

impl FarfieldPropagator {
    pub fn new(p: &GeoParams, backend: Arc<dyn FftBackend>) -> Self {
        let empty = || Array2::zeros(p.shape);
        let mut prop = FarfieldPropagator {
            crop_pad: [0, 0],
            sh: p.shape,
            pre_fft: empty(),
            post_fft: empty(),
            pre_ifft: empty(),
            post_ifft: empty(),
            grids_sam: (Array2::zeros(p.shape), Array2::zeros(p.shape)),
            grids_det: (Array2::zeros(p.shape), Array2::zeros(p.shape)),
            resolution: p.resolution,
            psize: p.psize,
            sc: 1.0,
            isc: 1.0,
            backend,
        };
        prop.update(p);
        prop
    }

    /// Recomputes the frame size and all filter arrays for the given geometry.
    pub fn update(&mut self, p: &GeoParams) {
        let lz = p.lz();

        // pad or crop to the nearest even frame size that absorbs the misfit
        for axis in 0..2 {
            let even = ((p.misfit[axis] / 2.0).round() as isize) * 2;
            let shape = p.shape[axis] as isize;
            self.crop_pad[axis] = even.max(2 - shape - shape % 2);
        }
        self.sh = [
            (p.shape[0] as isize + self.crop_pad[0]) as usize,
            (p.shape[1] as isize + self.crop_pad[1]) as usize,
        ];
        self.resolution = p.resolution;
        self.psize = p.psize;

        let (x, y) = grids(self.sh, p.resolution, p.origin);
        let (v, w) = grids(self.sh, p.psize, p.center);
        let (x00, y00) = (x[[0, 0]], y[[0, 0]]);
        let (v00, w00) = (v[[0, 0]], w[[0, 0]]);

        // quadratic phase + shift factor before fft
        let mut pre = Array2::zeros(self.sh);
        Zip::from(&mut pre)
            .and(&x)
            .and(&y)
            .par_for_each(|e, &x, &y| {
                let quadratic = PI * (x * x + y * y) / lz;
                let shift = -2.0 * PI * ((x - x00) * v00 + (y - y00) * w00) / lz;
                *e = Complex::new(0.0, quadratic + shift).exp();
            });

        // quadratic phase + shift factor after fft
        let mut post = Array2::zeros(self.sh);
        Zip::from(&mut post)
            .and(&v)
            .and(&w)
            .par_for_each(|e, &v, &w| {
                let quadratic = PI * (v * v + w * w) / lz;
                let shift = -2.0 * PI * (x00 * v + y00 * w) / lz;
                *e = Complex::new(0.0, quadratic + shift).exp();
            });

        // factors for the inverse operation
        self.pre_ifft = post.mapv(|e| e.conj());
        self.post_ifft = pre.mapv(|e| e.conj());
        self.pre_fft = pre;
        self.post_fft = post;

        self.grids_sam = (x, y);
        self.grids_det = (v, w);

        self.sc = self.backend.forward_scale(self.sh);
        self.isc = self.backend.backward_scale(self.sh);
    }

    /// Computes the forward propagated wavefront of `input`.
    pub fn fw(&self, input: ArrayView2<Complex<f64>>) -> Array2<Complex<f64>> {
        self.transform(input, &self.pre_fft, &self.post_fft, self.sc, true)
    }

    /// Computes the backward propagated wavefront of `input`.
    pub fn bw(&self, input: ArrayView2<Complex<f64>>) -> Array2<Complex<f64>> {
        self.transform(input, &self.pre_ifft, &self.post_ifft, self.isc, false)
    }

    fn transform(
        &self,
        input: ArrayView2<Complex<f64>>,
        prefilter: &Array2<Complex<f64>>,
        postfilter: &Array2<Complex<f64>>,
        scale: f64,
        forward: bool,
    ) -> Array2<Complex<f64>> {
        let cropping = self.crop_pad != [0, 0];
        let mut buffer = if cropping {
            crop_pad(input, self.crop_pad)
        } else {
            input.to_owned()
        };
        debug_assert_eq!(buffer.shape(), prefilter.shape());

        Zip::from(&mut buffer)
            .and(prefilter)
            .par_for_each(|b, &f| *b *= f);
        if forward {
            self.backend.fft2(buffer.view_mut());
        } else {
            self.backend.ifft2(buffer.view_mut());
        }
        Zip::from(&mut buffer)
            .and(postfilter)
            .par_for_each(|b, &f| *b = *b * f * scale);

        if cropping {
            crop_pad(buffer.view(), [-self.crop_pad[0], -self.crop_pad[1]])
        } else {
            buffer
        }
    }

    /// Total number of pixels added (positive) or removed (negative) per axis before transforming.
    pub fn crop_pad(&self) -> [isize; 2] {
        self.crop_pad
    }

    /// Shape of the transform, i.e. the frame shape corrected for misfit.
    pub fn transform_shape(&self) -> [usize; 2] {
        self.sh
    }

    pub fn pre_fft(&self) -> &Array2<Complex<f64>> {
        &self.pre_fft
    }

    pub fn post_fft(&self) -> &Array2<Complex<f64>> {
        &self.post_fft
    }

    pub fn grids_sam(&self) -> &(Array2<f64>, Array2<f64>) {
        &self.grids_sam
    }

    pub fn grids_det(&self) -> &(Array2<f64>, Array2<f64>) {
        &self.grids_det
    }

    pub fn psize_sam(&self) -> [f64; 2] {
        self.resolution
    }

    pub fn psize_det(&self) -> [f64; 2] {
        self.psize
    }
}
