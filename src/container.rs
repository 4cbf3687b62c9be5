//! Storages, views and pods.
//!
//! A [`Storage`] is a stack of 2-D layers. A [`View`] addresses a rectangular window of one layer,
//! and views of different scan positions may overlap. A [`Pod`] ties together the probe, object,
//! exit, diffraction and mask views of one scan position, probe mode and object layer.

use std::collections::HashMap;

use ndarray::{s, Array2, Array3, ArrayView2, ArrayViewMut2, Axis};
use num_complex::Complex;
use rustfft::num_traits::Zero;
use tracing::debug;

use crate::error::{Error, Result};
use crate::geometry::Geo;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub usize);

/// A stack of `layers × rows × cols` samples at a common pixel size.
#[derive(Clone, Debug, PartialEq)]
pub struct Storage<T> {
    pub data: Array3<T>,
    pub psize: [f64; 2],
}

impl<T: Clone + Zero> Storage<T> {
    pub fn zeros(shape: [usize; 3], psize: [f64; 2]) -> Self {
        Storage {
            data: Array3::zeros(shape),
            psize,
        }
    }
}

impl<T> Storage<T> {
    pub fn new(data: Array3<T>, psize: [f64; 2]) -> Self {
        Storage { data, psize }
    }

    pub fn shape(&self) -> [usize; 3] {
        let (l, r, c) = self.data.dim();
        [l, r, c]
    }

    pub fn layers(&self) -> usize {
        self.data.len_of(Axis(0))
    }
}

/// A rectangular window into one layer of a storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct View {
    pub storage: StorageId,
    pub layer: usize,
    /// Pixel position of the top left corner.
    pub coord: [usize; 2],
    pub shape: [usize; 2],
}

impl View {
    pub fn new(storage: StorageId, layer: usize, coord: [usize; 2], shape: [usize; 2]) -> Self {
        View {
            storage,
            layer,
            coord,
            shape,
        }
    }

    /// The pixel at the center of the window, as used for scan positions.
    pub fn center(&self) -> [f64; 2] {
        [
            self.coord[0] as f64 + (self.shape[0] / 2) as f64,
            self.coord[1] as f64 + (self.shape[1] / 2) as f64,
        ]
    }

    fn fits(&self, bounds: [usize; 3]) -> bool {
        self.layer < bounds[0]
            && self.coord[0] + self.shape[0] <= bounds[1]
            && self.coord[1] + self.shape[1] <= bounds[2]
    }
}

/// An ordered collection of storages.
///
/// Accessing a view that was not validated with [`Container::check`] panics on bad addresses, in
/// the same way ndarray slicing does.
#[derive(Clone, Debug, PartialEq)]
pub struct Container<T> {
    storages: Vec<Storage<T>>,
}

impl<T> Default for Container<T> {
    fn default() -> Self {
        Container {
            storages: Vec::new(),
        }
    }
}

impl<T> Container<T> {
    pub fn new() -> Self {
        Container::default()
    }

    pub fn add(&mut self, storage: Storage<T>) -> StorageId {
        self.storages.push(storage);
        StorageId(self.storages.len() - 1)
    }

    pub fn storage(&self, id: StorageId) -> Result<&Storage<T>> {
        self.storages.get(id.0).ok_or(Error::UnknownStorage(id))
    }

    pub fn storage_mut(&mut self, id: StorageId) -> Result<&mut Storage<T>> {
        self.storages.get_mut(id.0).ok_or(Error::UnknownStorage(id))
    }

    pub fn storages(&self) -> &[Storage<T>] {
        &self.storages
    }

    pub fn storages_mut(&mut self) -> &mut [Storage<T>] {
        &mut self.storages
    }

    pub fn ids(&self) -> impl Iterator<Item = StorageId> {
        (0..self.storages.len()).map(StorageId)
    }

    pub fn len(&self) -> usize {
        self.storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    /// Verifies that `view` addresses an existing layer and lies inside its storage.
    pub fn check(&self, view: &View) -> Result<()> {
        let bounds = self.storage(view.storage)?.shape();
        if view.fits(bounds) {
            Ok(())
        } else {
            Err(Error::ViewOutOfBounds {
                storage: view.storage,
                coord: view.coord,
                shape: view.shape,
                bounds,
            })
        }
    }

    pub fn view(&self, view: &View) -> ArrayView2<T> {
        let [r, c] = view.coord;
        let [h, w] = view.shape;
        self.storages[view.storage.0]
            .data
            .slice(s![view.layer, r..r + h, c..c + w])
    }

    pub fn view_mut(&mut self, view: &View) -> ArrayViewMut2<T> {
        let [r, c] = view.coord;
        let [h, w] = view.shape;
        self.storages[view.storage.0]
            .data
            .slice_mut(s![view.layer, r..r + h, c..c + w])
    }
}

impl<T: Clone> Container<T> {
    pub fn fill(&mut self, value: T) {
        for storage in &mut self.storages {
            storage.data.fill(value.clone());
        }
    }

    /// Overwrites every storage with the content of the matching storage in `other`.
    pub fn assign(&mut self, other: &Container<T>) -> Result<()> {
        if self.len() != other.len() {
            return Err(Error::ShapeMismatch {
                what: "container",
                expected: vec![self.len()],
                got: vec![other.len()],
            });
        }
        for (a, b) in self.storages.iter_mut().zip(&other.storages) {
            if a.data.shape() != b.data.shape() {
                return Err(Error::ShapeMismatch {
                    what: "storage",
                    expected: a.data.shape().to_vec(),
                    got: b.data.shape().to_vec(),
                });
            }
            a.data.assign(&b.data);
        }
        Ok(())
    }
}

impl<T: Clone + Zero> Container<T> {
    /// A container with the same storage layout, filled with zeros.
    pub fn zeros_like(&self) -> Self {
        Container {
            storages: self
                .storages
                .iter()
                .map(|s| Storage::zeros(s.shape(), s.psize))
                .collect(),
        }
    }
}

/// The views and bookkeeping of one scan position, probe mode and object layer.
#[derive(Clone, Debug, PartialEq)]
pub struct Pod {
    pub probe: View,
    pub object: View,
    pub exit: View,
    pub diff: View,
    pub mask: View,
    /// Index into [`Ptycho::geometries`].
    pub geometry: usize,
    pub active: bool,
    pub probe_weight: f64,
    pub object_weight: f64,
}

/// The active pods that share one diffraction pattern. Their intensities add incoherently.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub diff: View,
    pub mask: View,
    pub geometry: usize,
    pub pods: Vec<usize>,
}

/// A complete reconstruction problem.
#[derive(Clone, Debug)]
pub struct Ptycho {
    pub probe: Container<Complex<f64>>,
    pub object: Container<Complex<f64>>,
    pub exit: Container<Complex<f64>>,
    pub diff: Container<f64>,
    /// Per pixel weights, 1 for valid and 0 for invalid detector pixels.
    pub mask: Container<f64>,
    pub geometries: Vec<Geo>,
    pub pods: Vec<Pod>,
}

/// Measured data and starting guesses for a single scan.
#[derive(Clone, Debug)]
pub struct ScanData {
    pub geometry: Geo,
    /// Top left pixel of each object view, one per diffraction pattern.
    pub positions: Vec<[usize; 2]>,
    /// Initial probe, `modes × rows × cols`.
    pub probe: Array3<Complex<f64>>,
    /// Initial object.
    pub object: Array2<Complex<f64>>,
    /// Measured intensities, `positions × rows × cols`.
    pub intensities: Array3<f64>,
    pub mask: Option<Array3<f64>>,
}

impl Ptycho {
    /// Builds a problem from its parts and validates every pod against them.
    pub fn new(
        probe: Container<Complex<f64>>,
        object: Container<Complex<f64>>,
        exit: Container<Complex<f64>>,
        diff: Container<f64>,
        mask: Container<f64>,
        geometries: Vec<Geo>,
        pods: Vec<Pod>,
    ) -> Result<Self> {
        let ptycho = Ptycho {
            probe,
            object,
            exit,
            diff,
            mask,
            geometries,
            pods,
        };
        ptycho.validate()?;
        Ok(ptycho)
    }

    /// Builds a single scan problem with one pod per position and probe mode.
    ///
    /// Every pod gets its own exit wave layer, initialized to `probe · object`; the pods of one
    /// position share the diffraction and mask views. Without a mask all pixels are valid.
    pub fn from_scan(scan: ScanData) -> Result<Self> {
        let shape = scan.geometry.shape();
        let resolution = scan.geometry.resolution();
        let psize = scan.geometry.psize();
        let (modes, pr, pc) = scan.probe.dim();
        let n = scan.positions.len();

        if [pr, pc] != shape {
            return Err(Error::ShapeMismatch {
                what: "probe",
                expected: shape.to_vec(),
                got: vec![pr, pc],
            });
        }
        if modes == 0 {
            return Err(Error::InvalidParameter(
                "probe needs at least one mode".to_string(),
            ));
        }
        let expected_frames = vec![n, shape[0], shape[1]];
        if scan.intensities.shape() != expected_frames.as_slice() {
            return Err(Error::ShapeMismatch {
                what: "intensities",
                expected: expected_frames,
                got: scan.intensities.shape().to_vec(),
            });
        }
        let mask = match scan.mask {
            Some(mask) => {
                if mask.shape() != expected_frames.as_slice() {
                    return Err(Error::ShapeMismatch {
                        what: "mask",
                        expected: expected_frames,
                        got: mask.shape().to_vec(),
                    });
                }
                mask
            }
            None => Array3::from_elem((n, shape[0], shape[1]), 1.0),
        };

        let mut probe = Container::new();
        let pr_id = probe.add(Storage::new(scan.probe, resolution));
        let mut object = Container::new();
        let (or, oc) = scan.object.dim();
        let ob_id = object.add(Storage::new(
            scan.object.into_shape((1, or, oc)).map_err(|_| Error::ShapeMismatch {
                what: "object",
                expected: vec![or, oc],
                got: vec![or, oc],
            })?,
            resolution,
        ));
        let mut exit = Container::new();
        let ex_id = exit.add(Storage::zeros([n * modes, shape[0], shape[1]], resolution));
        let mut diff = Container::new();
        let di_id = diff.add(Storage::new(scan.intensities, psize));
        let mut masks = Container::new();
        let ma_id = masks.add(Storage::new(mask, psize));

        let mut pods = Vec::with_capacity(n * modes);
        for (i, &pos) in scan.positions.iter().enumerate() {
            for mode in 0..modes {
                pods.push(Pod {
                    probe: View::new(pr_id, mode, [0, 0], shape),
                    object: View::new(ob_id, 0, pos, shape),
                    exit: View::new(ex_id, i * modes + mode, [0, 0], shape),
                    diff: View::new(di_id, i, [0, 0], shape),
                    mask: View::new(ma_id, i, [0, 0], shape),
                    geometry: 0,
                    active: true,
                    probe_weight: 1.0,
                    object_weight: 1.0,
                });
            }
        }
        debug!(positions = n, modes, "Created pods for scan");

        let mut ptycho = Ptycho::new(
            probe,
            object,
            exit,
            diff,
            masks,
            vec![scan.geometry],
            pods,
        )?;
        ptycho.reset_exits();
        Ok(ptycho)
    }

    /// Checks every pod's views against their containers and geometry.
    pub fn validate(&self) -> Result<()> {
        for pod in &self.pods {
            let geo = self.geometries.get(pod.geometry).ok_or_else(|| {
                Error::InvalidParameter(format!("pod refers to missing geometry {}", pod.geometry))
            })?;
            self.probe.check(&pod.probe)?;
            self.object.check(&pod.object)?;
            self.exit.check(&pod.exit)?;
            self.diff.check(&pod.diff)?;
            self.mask.check(&pod.mask)?;
            let shape = geo.shape();
            for (what, view) in [
                ("probe view", &pod.probe),
                ("object view", &pod.object),
                ("exit view", &pod.exit),
                ("diffraction view", &pod.diff),
                ("mask view", &pod.mask),
            ] {
                if view.shape != shape {
                    return Err(Error::ShapeMismatch {
                        what,
                        expected: shape.to_vec(),
                        got: view.shape.to_vec(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn active_pods(&self) -> impl Iterator<Item = (usize, &Pod)> {
        self.pods.iter().enumerate().filter(|(_, pod)| pod.active)
    }

    /// Groups the active pods by diffraction view, in order of first appearance.
    pub fn frames(&self) -> Vec<Frame> {
        let mut index: HashMap<View, usize> = HashMap::new();
        let mut frames: Vec<Frame> = Vec::new();
        for (i, pod) in self.active_pods() {
            match index.get(&pod.diff) {
                Some(&f) => frames[f].pods.push(i),
                None => {
                    index.insert(pod.diff, frames.len());
                    frames.push(Frame {
                        diff: pod.diff,
                        mask: pod.mask,
                        geometry: pod.geometry,
                        pods: vec![i],
                    });
                }
            }
        }
        frames
    }

    /// Number of active pods whose object view covers each object pixel.
    pub fn object_viewcover(&self) -> Container<f64> {
        let mut cover = Container {
            storages: self
                .object
                .storages()
                .iter()
                .map(|s| Storage::zeros(s.shape(), s.psize))
                .collect(),
        };
        for (_, pod) in self.active_pods() {
            cover.view_mut(&pod.object).mapv_inplace(|c| c + 1.0);
        }
        cover
    }

    /// Writes `probe · object` of every active pod into its exit view.
    pub fn reset_exits(&mut self) {
        let Ptycho {
            probe,
            object,
            exit,
            pods,
            ..
        } = self;
        for pod in pods.iter().filter(|pod| pod.active) {
            let pr = probe.view(&pod.probe);
            let ob = object.view(&pod.object);
            let mut ex = exit.view_mut(&pod.exit);
            ndarray::Zip::from(&mut ex)
                .and(&pr)
                .and(&ob)
                .for_each(|e, &p, &o| *e = p * o);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryConfig;
    use crate::grids::Pair;

    fn geo(shape: usize) -> Geo {
        Geo::new(&GeometryConfig {
            shape: Some(Pair::Both(shape)),
            ..GeometryConfig::default()
        })
        .unwrap()
    }

    fn scan(positions: Vec<[usize; 2]>, modes: usize) -> ScanData {
        let n = positions.len();
        ScanData {
            geometry: geo(4),
            positions,
            probe: Array3::from_elem((modes, 4, 4), Complex::new(1.0, 0.0)),
            object: Array2::from_elem((8, 8), Complex::new(1.0, 0.0)),
            intensities: Array3::zeros((n, 4, 4)),
            mask: None,
        }
    }

    #[test]
    fn views_address_windows() {
        let mut c: Container<f64> = Container::new();
        let id = c.add(Storage::new(
            Array3::from_shape_fn((2, 5, 6), |(l, r, k)| (100 * l + 10 * r + k) as f64),
            [1.0, 1.0],
        ));
        let v = View::new(id, 1, [2, 3], [2, 2]);
        c.check(&v).unwrap();

        assert_eq!(c.view(&v), ndarray::arr2(&[[123.0, 124.0], [133.0, 134.0]]));

        c.view_mut(&v).fill(0.0);
        assert_eq!(c.storages()[0].data[[1, 3, 4]], 0.0);
        assert_eq!(c.storages()[0].data[[0, 3, 4]], 34.0);
        assert_eq!(v.center(), [3.0, 4.0]);
    }

    #[test]
    fn check_rejects_bad_views() {
        let mut c: Container<f64> = Container::new();
        let id = c.add(Storage::zeros([1, 4, 4], [1.0, 1.0]));

        assert!(matches!(
            c.check(&View::new(id, 0, [1, 0], [4, 4])),
            Err(Error::ViewOutOfBounds { .. })
        ));
        assert!(c.check(&View::new(id, 1, [0, 0], [4, 4])).is_err());
        assert_eq!(
            c.check(&View::new(StorageId(3), 0, [0, 0], [1, 1])),
            Err(Error::UnknownStorage(StorageId(3)))
        );
    }

    #[test]
    fn from_scan_creates_pods_per_mode() {
        let ptycho = Ptycho::from_scan(scan(vec![[0, 0], [4, 4], [2, 3]], 2)).unwrap();

        assert_eq!(ptycho.pods.len(), 6);
        let frames = ptycho.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].pods, vec![2, 3]);
        assert_eq!(ptycho.pods[3].probe.layer, 1);
        assert_eq!(ptycho.pods[3].exit.layer, 3);
        assert_eq!(ptycho.mask.storages()[0].data.sum(), 48.0);
    }

    #[test]
    fn from_scan_rejects_positions_outside_object() {
        let err = Ptycho::from_scan(scan(vec![[0, 0], [5, 0]], 1)).unwrap_err();
        assert!(matches!(err, Error::ViewOutOfBounds { .. }));
    }

    #[test]
    fn from_scan_rejects_mismatched_intensities() {
        let mut data = scan(vec![[0, 0], [1, 1]], 1);
        data.intensities = Array3::zeros((3, 4, 4));
        assert!(matches!(
            Ptycho::from_scan(data),
            Err(Error::ShapeMismatch {
                what: "intensities",
                ..
            })
        ));
    }

    #[test]
    fn inactive_pods_are_skipped() {
        let mut ptycho = Ptycho::from_scan(scan(vec![[0, 0], [4, 4]], 1)).unwrap();
        ptycho.pods[0].active = false;

        let frames = ptycho.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].pods, vec![1]);

        let cover = ptycho.object_viewcover();
        assert_eq!(cover.storages()[0].data.sum(), 16.0);
    }

    #[test]
    fn viewcover_counts_overlaps() {
        let ptycho = Ptycho::from_scan(scan(vec![[0, 0], [2, 2]], 1)).unwrap();
        let cover = ptycho.object_viewcover();
        let cover = &cover.storages()[0].data;

        assert_eq!(cover[[0, 0, 0]], 1.0);
        assert_eq!(cover[[0, 2, 3]], 2.0);
        assert_eq!(cover[[0, 7, 7]], 0.0);
    }

    #[test]
    fn reset_exits_multiplies_views() {
        let mut data = scan(vec![[0, 0]], 1);
        data.probe.fill(Complex::new(0.0, 2.0));
        data.object.fill(Complex::new(3.0, 0.0));
        let mut ptycho = Ptycho::from_scan(data).unwrap();

        ptycho.reset_exits();

        assert!(ptycho.exit.storages()[0]
            .data
            .iter()
            .all(|&e| e == Complex::new(0.0, 6.0)));
    }

    #[test]
    fn assign_requires_matching_layout() {
        let mut a: Container<f64> = Container::new();
        a.add(Storage::zeros([1, 2, 2], [1.0, 1.0]));
        let mut b = a.clone();
        b.fill(2.0);
        a.assign(&b).unwrap();
        assert_eq!(a, b);

        b.add(Storage::zeros([1, 2, 2], [1.0, 1.0]));
        assert!(a.assign(&b).is_err());
    }
}
