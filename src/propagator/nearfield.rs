use std::f64::consts::PI;
use std::sync::Arc;

use ndarray::{Array2, ArrayView2, Zip};
use num_complex::Complex;

use crate::fft2::FftBackend;
use crate::geometry::GeoParams;
use crate::grids::{grids, Center};

/// Two-step (two FFT) Fresnel propagator built on the free-space transfer function.
#[derive(Clone, Debug)]
pub struct NearfieldPropagator {
    kernel: Array2<Complex<f64>>,
    ikernel: Array2<Complex<f64>>,
    grids_sam: (Array2<f64>, Array2<f64>),
    resolution: [f64; 2],
    backend: Arc<dyn FftBackend>,
}

impl NearfieldPropagator {
    pub fn new(p: &GeoParams, backend: Arc<dyn FftBackend>) -> Self {
        let mut prop = NearfieldPropagator {
            kernel: Array2::zeros(p.shape),
            ikernel: Array2::zeros(p.shape),
            grids_sam: (Array2::zeros(p.shape), Array2::zeros(p.shape)),
            resolution: p.resolution,
            backend,
        };
        prop.update(p);
        prop
    }

    /// Recomputes the transfer function for the given geometry.
    pub fn update(&mut self, p: &GeoParams) {
        let sh = p.shape;
        self.resolution = p.resolution;
        self.grids_sam = grids(sh, p.resolution, p.origin);

        let lz = p.lz();
        let psize_fspace = [
            lz / sh[0] as f64 / p.psize[0],
            lz / sh[1] as f64 / p.psize[1],
        ];
        let (v, w) = grids(sh, psize_fspace, Center::Fft);

        let k = 2.0 * PI * p.distance / p.lam;
        let distance_sqr = p.distance * p.distance;
        let mut kernel = Array2::zeros(sh);
        Zip::from(&mut kernel)
            .and(&v)
            .and(&w)
            .par_for_each(|e, &v, &w| {
                let a2 = (v * v + w * w) / distance_sqr;
                // sqrt(1 - a2) - 1 rewritten to avoid cancellation for small a2.
                // Past a2 = 1 the root is imaginary and the wave decays.
                let root = Complex::new(1.0 - a2, 0.0).sqrt();
                let phase = -a2 / (root + 1.0);
                *e = (Complex::i() * k * phase).exp();
            });

        self.ikernel = kernel.mapv(|e| e.conj());
        self.kernel = kernel;
    }

    pub fn fw(&self, input: ArrayView2<Complex<f64>>) -> Array2<Complex<f64>> {
        self.convolve(input, &self.kernel)
    }

    pub fn bw(&self, input: ArrayView2<Complex<f64>>) -> Array2<Complex<f64>> {
        self.convolve(input, &self.ikernel)
    }

    fn convolve(
        &self,
        input: ArrayView2<Complex<f64>>,
        kernel: &Array2<Complex<f64>>,
    ) -> Array2<Complex<f64>> {
        debug_assert_eq!(input.shape(), kernel.shape());
        let mut buffer = input.to_owned();
        self.backend.fft2(buffer.view_mut());
        Zip::from(&mut buffer)
            .and(kernel)
            .par_for_each(|b, &k| *b *= k);
        self.backend.ifft2(buffer.view_mut());
        buffer
    }

    pub fn kernel(&self) -> &Array2<Complex<f64>> {
        &self.kernel
    }

    pub fn grids_sam(&self) -> &(Array2<f64>, Array2<f64>) {
        &self.grids_sam
    }

    /// Near-field propagation does not rescale, so detector and sample grids coincide.
    pub fn grids_det(&self) -> &(Array2<f64>, Array2<f64>) {
        &self.grids_sam
    }

    pub fn psize_sam(&self) -> [f64; 2] {
        self.resolution
    }

    pub fn psize_det(&self) -> [f64; 2] {
        self.resolution
    }
}
