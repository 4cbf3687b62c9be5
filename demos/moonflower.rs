use image::{Rgb, RgbImage};
use ndarray::{s, Array2, Array3, ArrayView2, Zip};
use num_complex::Complex;
use palette::{Lch, Srgb};
use ptycho_retrieval::container::ScanData;
use ptycho_retrieval::grids::Pair;
use ptycho_retrieval::{run, EngineConfig, Field, Geo, GeometryConfig, Ptycho};
use tracing_subscriber::EnvFilter;

const FRAME: usize = 64;
const OBJECT: usize = 160;
const STEP: usize = 8;

pub fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let geo = Geo::new(&GeometryConfig {
        energy: Some(6.2),
        distance: Some(7.0),
        psize: Some(Pair::Both(172e-6)),
        shape: Some(Pair::Both(FRAME)),
        ..GeometryConfig::default()
    })?;
    println!("{}", geo);

    let object = moonflower(OBJECT);
    let probe = pinhole_probe(&geo, 5.0);
    save_complex_image("moonflower_object.png", object.view())?;
    save_complex_image("moonflower_probe.png", probe.view())?;

    let far = geo.propagator().fw_field(&Field {
        values: probe.clone(),
        pitch: (geo.resolution()[0], geo.resolution()[1]),
    });
    println!(
        "probe flux {} -> {}",
        Field {
            values: probe.clone(),
            pitch: (geo.resolution()[0], geo.resolution()[1]),
        }
        .intensity_integral(),
        far.intensity_integral()
    );

    let positions = spiral(OBJECT - FRAME, STEP);
    let mut intensities = Array3::zeros((positions.len(), FRAME, FRAME));
    for (i, pos) in positions.iter().enumerate() {
        let view = object.slice(s![pos[0]..pos[0] + FRAME, pos[1]..pos[1] + FRAME]);
        let exit = Zip::from(&probe).and(&view).map_collect(|&p, &o| p * o);
        let far = geo.propagator().fw(exit.view());
        intensities
            .slice_mut(s![i, .., ..])
            .assign(&far.mapv(|f| f.norm_sqr()));
    }
    save_grayscale_real_image(
        "moonflower_diffraction.png",
        log_intensity(intensities.slice(s![0, .., ..]), 1e-6).view(),
    )?;

    let scan = ScanData {
        probe: pinhole_probe(&geo, 4.0).into_shape((1, FRAME, FRAME))?,
        geometry: geo,
        positions,
        object: Array2::from_elem((OBJECT, OBJECT), Complex::new(1.0, 0.0)),
        intensities,
        mask: None,
    };

    for (name, config, iterations) in [
        ("dm", r#"{"name": "DM", "probe_update_start": 2}"#, 80),
        ("epie", r#"{"name": "EPIE", "seed": 42}"#, 40),
        (
            "multislice",
            r#"{"name": "ePIE_multislice", "number_of_slices": 2, "slice_thickness": 1e-6}"#,
            40,
        ),
    ] {
        let config: EngineConfig = serde_json::from_str(config)?;
        let mut engine = config.build()?;
        let mut ptycho = Ptycho::from_scan(scan.clone())?;

        let trace = run(engine.as_mut(), &mut ptycho, iterations)?;
        if let (Some(first), Some(last)) = (
            trace.first().and_then(|e| e.mean()),
            trace.last().and_then(|e| e.mean()),
        ) {
            println!("{}: fmag {:e} -> {:e}", engine.name(), first.fmag, last.fmag);
        }

        save_complex_image(
            format!("moonflower_{}_object.png", name),
            ptycho.object.storages()[0].data.slice(s![0, .., ..]),
        )?;
        save_complex_image(
            format!("moonflower_{}_probe.png", name),
            ptycho.probe.storages()[0].data.slice(s![0, .., ..]),
        )?;
    }
    Ok(())
}

/// Phase object with petals of raised transmission and a phase ramp around the center.
fn moonflower(n: usize) -> Array2<Complex<f64>> {
    let c = n as f64 / 2.0;
    Array2::from_shape_fn((n, n), |(i, j)| {
        let y = i as f64 - c;
        let x = j as f64 - c;
        let r = (x * x + y * y).sqrt() / c;
        let theta = y.atan2(x);
        let petals = (0.5 + 0.5 * (8.0 * theta).cos()) * (-(r - 0.45).powi(2) / 0.04).exp();
        let amplitude = 0.7 + 0.3 * petals;
        let phase = std::f64::consts::PI * 0.5 * petals * (1.0 - r).max(0.0);
        Complex::from_polar(amplitude, phase)
    })
}

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

/// Far-field pattern of a circular aperture, which gives a focused, ringing probe.
fn pinhole_probe(geo: &Geo, radius: f64) -> Array2<Complex<f64>> {
    let [h, w] = geo.shape();
    let c = [(h / 2) as f64, (w / 2) as f64];
    let aperture = Array2::from_shape_fn((h, w), |(i, j)| {
        let r = ((i as f64 - c[0]).powi(2) + (j as f64 - c[1]).powi(2)).sqrt();
        Complex::new(1.0 - soft_greater_than(r, radius, 1.0), 0.0)
    });
    let probe = geo.propagator().bw(aperture.view());
    let max = probe.iter().fold(0.0, |m: f64, p| m.max(p.norm()));
    probe.mapv(|p| p / max)
}

/// Fermat spiral of positions inside `[0, extent]²`, roughly `step` pixels apart.
fn spiral(extent: usize, step: usize) -> Vec<[usize; 2]> {
    let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    let c = extent as f64 / 2.0;
    (0..)
        .map(|k| (step as f64 * (k as f64).sqrt() * 0.6, k as f64 * golden))
        .take_while(|&(r, _)| r <= c * 1.45)
        .map(|(r, theta)| [c + r * theta.sin(), c + r * theta.cos()])
        .filter(|p| p.iter().all(|&x| x >= 0.0 && x <= extent as f64))
        .map(|p| [p[0].round() as usize, p[1].round() as usize])
        .collect()
}

pub fn log_intensity(arr: ArrayView2<f64>, min: f64) -> Array2<f64> {
    let log_min = -min.ln();
    let max = arr.iter().fold(0.0, |max, e| e.max(max));
    arr.map(|e| ((e / max).ln() / log_min + 1.0).max(0.0).min(1.0))
}

pub fn save_grayscale_real_image<T: AsRef<std::path::Path> + std::fmt::Debug>(
    file_name: T,
    arr: ArrayView2<f64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (h, w) = arr.dim();
    let max: f64 = arr.iter().fold(0.0, |max, val| val.max(max));
    println!("h:{} w:{} max:{} - {:?}", h, w, max, file_name);

    let mut img = RgbImage::new(w as u32, h as u32);
    for (x, y, p) in img.enumerate_pixels_mut() {
        let value = (arr[[y as usize, x as usize]] / max).min(1.0).max(0.0);
        let v = (value * 255.0) as u8;
        *p = Rgb([v, v, v]);
    }
    img.save(file_name)?;
    Ok(())
}

pub fn save_complex_image<T: AsRef<std::path::Path> + std::fmt::Debug>(
    file_name: T,
    arr: ArrayView2<Complex<f64>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (h, w) = arr.dim();
    let max_sqr: f64 = arr.iter().fold(0.0, |max, val| val.norm_sqr().max(max));
    let sum_sqr: f64 = arr.iter().fold(0.0, |sum, val| val.norm_sqr() + sum);
    println!(
        "h:{} w:{} max_sqr:{} sum_sqr:{} - {:?}",
        h, w, max_sqr, sum_sqr, file_name
    );

    let max = max_sqr.sqrt();

    let mut img = RgbImage::new(w as u32, h as u32);
    for (x, y, p) in img.enumerate_pixels_mut() {
        let (r, theta) = arr[[y as usize, x as usize]].to_polar();
        let r = r / max;

        let colour = Srgb::from(Lch::new(
            r * 100.0,
            r * 128.0,
            360.0 * (theta / ::std::f64::consts::PI + 1.0) * 0.5,
        ));
        *p = Rgb([
            (colour.red * 255.0) as u8,
            (colour.green * 255.0) as u8,
            (colour.blue * 255.0) as u8,
        ]);
    }

    img.save(file_name)?;
    Ok(())
}
