//! Converts TWD97 grid coordinates to WGS84 longitude/latitude.
//!
//! TWD97 is a Transverse Mercator grid over the GRS80 ellipsoid, centered on
//! 121°E. The inverse uses the three-term Krüger series, which is closed-form:
//! there is no iteration, and it is accurate well below a millimetre inside the
//! zone. The constants below are specific to this zone and ellipsoid.

use std::f64::consts::PI;
use std::fmt;

/// Semi-major axis of GRS80, in kilometres.
const SEMI_MAJOR_AXIS: f64 = 6378.137;

/// Flattening of GRS80.
const FLATTENING: f64 = 1.0 / 298.257222101;

/// Central meridian, in degrees.
const ORIGIN_LONGITUDE: f64 = 121.0;

/// False northing, in kilometres.
const FALSE_NORTHING: f64 = 0.0;

/// False easting, in kilometres.
const FALSE_EASTING: f64 = 250.0;

/// Scale factor on the central meridian.
const SCALE_FACTOR: f64 = 0.9999;

/// Series constants derived from the ellipsoid.
#[derive(Debug)]
struct Constants {
    /// Meridian-arc scale: `a / (1 + n) * (1 + n²/4 + n⁴/64)`.
    a: f64,

    /// Footpoint latitude series:
    ///
    /// * `b1 = n/2 - 2n²/3 + 37n³/96`
    /// * `b2 = n²/48 + n³/15`
    /// * `b3 = 17n³/480`
    b: [f64; 3],

    /// Latitude series:
    ///
    /// * `d1 = 2n - 2n²/3 - 2n³`
    /// * `d2 = 7n²/3 - 8n³/5`
    /// * `d3 = 56n³/15`
    d: [f64; 3],
}

impl Constants {
    fn new() -> Constants {
        // third flattening
        let n = FLATTENING / (2.0 - FLATTENING);
        let n2 = n.powi(2);
        let n3 = n.powi(3);
        let n4 = n.powi(4);

        Constants {
            a: SEMI_MAJOR_AXIS / (1.0 + n) * (1.0 + n2 / 4.0 + n4 / 64.0),
            b: [
                n / 2.0 - n2 * 2.0 / 3.0 + n3 * 37.0 / 96.0,
                n2 / 48.0 + n3 / 15.0,
                n3 * 17.0 / 480.0,
            ],
            d: [
                2.0 * n - n2 * 2.0 / 3.0 - 2.0 * n3,
                n2 * 7.0 / 3.0 - n3 * 8.0 / 5.0,
                n3 * 56.0 / 15.0,
            ],
        }
    }
}

lazy_static! {
    static ref CONSTANTS: Constants = Constants::new();
}

/// A TWD97 grid position: easting and northing, in metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Twd97(pub f64, pub f64);

/// A WGS84 position, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wgs84 {
    pub lon: f64,
    pub lat: f64,
}

impl fmt::Display for Wgs84 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{})", self.lon, self.lat)
    }
}

impl Twd97 {
    pub fn to_wgs84(&self) -> Wgs84 {
        let (lon, lat) = twd97_to_wgs84(self.0, self.1);
        Wgs84 { lon: lon, lat: lat }
    }
}

fn degrees(radians: f64) -> f64 {
    radians / PI * 180.0
}

/// Converts a TWD97 easting/northing (metres) to WGS84 `(longitude, latitude)`
/// (degrees).
///
/// The signature matches the coordinate translator the shapefile readers take,
/// so it can be passed to them directly.
///
/// # Example
///
/// ```
/// use twshape::geo::twd97_to_wgs84;
///
/// let (lon, lat) = twd97_to_wgs84(250000., 2605000.);
/// assert_eq!(121.0, lon);
/// assert!((lat - 23.548299).abs() < 1e-4);
/// ```
pub fn twd97_to_wgs84(x: f64, y: f64) -> (f64, f64) {
    let c = &*CONSTANTS;
    let [b1, b2, b3] = c.b;
    let [d1, d2, d3] = c.d;

    // metres to kilometres
    let x = x / 1000.0;
    let y = y / 1000.0;

    let xi = (y - FALSE_NORTHING) / (SCALE_FACTOR * c.a);
    let eta = (x - FALSE_EASTING) / (SCALE_FACTOR * c.a);

    let xi_p = xi
        - b1 * (2.0 * xi).sin() * (2.0 * eta).cosh()
        - b2 * (4.0 * xi).sin() * (4.0 * eta).cosh()
        - b3 * (6.0 * xi).sin() * (6.0 * eta).cosh();
    let eta_p = eta
        - b1 * (2.0 * xi).cos() * (2.0 * eta).sinh()
        - b2 * (4.0 * xi).cos() * (4.0 * eta).sinh()
        - b3 * (6.0 * xi).cos() * (6.0 * eta).sinh();

    let chi = (xi_p.sin() / eta_p.cosh()).asin();

    let lat = degrees(
        chi
        + d1 * (2.0 * chi).sin()
        + d2 * (4.0 * chi).sin()
        + d3 * (6.0 * chi).sin()
    );
    let lon = ORIGIN_LONGITUDE + degrees(eta_p.sinh().atan2(xi_p.cos()));

    (lon, lat)
}
