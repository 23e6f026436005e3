//! Earth-related constants and functions
//!
//! This module contains the small set of geophysical models the estimator needs: the WGS84
//! ellipsoid constants, the Somigliana gravity model, the Earth rotation rate expressed in the
//! local-level (NED) frame, and a local tangent-plane map projection used to turn GNSS geodetic
//! fixes into north/east offsets from the navigation origin.
//!
//! # Coordinate Systems
//! The estimator navigates in a flat local North-East-Down (NED) frame anchored at an origin
//! that is set once GNSS quality checks pass. Positions are meters relative to that origin,
//! velocities are meters per second in NED, and gravity acts along the positive down axis.
//! The flat-frame approximation holds for the short ranges (a few tens of kilometers) typical
//! of small autonomous vehicles; the projection below uses the principal radii of curvature at
//! the origin so that the scale error stays small inside that envelope.
//!
//! The projection is the linearized form of Groves' curvilinear-to-local conversion
//! (Equation 2.119 of _Principles of GNSS, Inertial, and Multisensor Integrated Navigation
//! Systems, 2nd Edition_):
//!
//! $$
//! \delta n = (R_N + h)\,\delta L, \qquad \delta e = (R_E + h)\cos L_0\,\delta\lambda
//! $$
use ::nalgebra::{Matrix3, Vector2, Vector3};

// Earth constants (WGS84)
/// Earth's rotation rate rad/s ($\omega_{ie}$)
pub const RATE: f64 = 7.2921159e-5;
/// Earth's equitorial radius in meters
pub const EQUATORIAL_RADIUS: f64 = 6378137.0; // meters
/// Earth's polar radius in meters
pub const POLAR_RADIUS: f64 = 6356752.31425; // meters
/// Earth's eccentricity ($e$)
pub const ECCENTRICITY: f64 = 0.0818191908425; // unit-less
/// Earth's eccentricity squared ($e^2$)
pub const ECCENTRICITY_SQUARED: f64 = ECCENTRICITY * ECCENTRICITY;
/// Earth's gravitational acceleration at the equator ($g_e$) in $m/s^2$
pub const GE: f64 = 9.7803253359; // m/s^2, equatorial radius
/// Earth's gravitational acceleration at the poles ($g_p$) in $m/s^2$
pub const GP: f64 = 9.8321849378; // $m/s^2$, polar radius
/// Somigliana's constant ($K$)
pub const K: f64 = (POLAR_RADIUS * GP - EQUATORIAL_RADIUS * GE) / (EQUATORIAL_RADIUS * GE); // Somigliana's constant
/// Standard gravity used before a navigation origin is known
pub const STANDARD_GRAVITY: f64 = 9.80665;

/// Convert a three-element vector to a skew-symmetric matrix
///
/// Groves' notation uses a lot of skew-symmetric matrices to represent cross products
/// and to perform more concise matrix operations (particularly involving rotations).
///
/// $$
/// x = \begin{bmatrix} a \\\\ b \\\\ c \end{bmatrix} \rightarrow X = \begin{bmatrix} 0 & -c & b \\\\ c & 0 & -a \\\\ -b & a & 0 \end{bmatrix}
/// $$
///
/// # Example
/// ```rust
/// use nalgebra::{Vector3, Matrix3};
/// use navfuse::earth;
/// let v: Vector3<f64> = Vector3::new(1.0, 2.0, 3.0);
/// let skew: Matrix3<f64> = earth::vector_to_skew_symmetric(&v);
/// assert_eq!(skew * v, Vector3::zeros());
/// ```
pub fn vector_to_skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    let mut skew: Matrix3<f64> = Matrix3::zeros();
    skew[(0, 1)] = -v[2];
    skew[(0, 2)] = v[1];
    skew[(1, 0)] = v[2];
    skew[(1, 2)] = -v[0];
    skew[(2, 0)] = -v[1];
    skew[(2, 1)] = v[0];
    skew
}
/// Calculate principal radii of curvature
///
/// The [principal radii of curvature](https://en.wikipedia.org/wiki/Earth_radius) are used to
/// convert small latitude and longitude differences into north and east distances.
///
/// # Parameters
/// - `latitude` - The WGS84 latitude in degrees
/// - `altitude` - The WGS84 altitude in meters
///
/// # Returns
/// A tuple of (meridian radius, transverse radius, distance to the polar axis) in meters
pub fn principal_radii(latitude: &f64, altitude: &f64) -> (f64, f64, f64) {
    let latitude_rad: f64 = (latitude).to_radians();
    let sin_lat: f64 = latitude_rad.sin();
    let sin_lat_sq: f64 = sin_lat * sin_lat;
    let r_n: f64 = (EQUATORIAL_RADIUS * (1.0 - ECCENTRICITY_SQUARED))
        / (1.0 - ECCENTRICITY_SQUARED * sin_lat_sq).powf(3.0 / 2.0);
    let r_e: f64 = EQUATORIAL_RADIUS / (1.0 - ECCENTRICITY_SQUARED * sin_lat_sq).sqrt();
    let r_p: f64 = r_e * latitude_rad.cos() + altitude;
    (r_n, r_e, r_p)
}
/// Calculate the WGS84 gravity scalar
///
/// The gravity model is based on the [Somigliana
/// method](https://en.wikipedia.org/wiki/Theoretical_gravity#Somigliana_equation) with a
/// free-air correction for altitude.
///
/// # Parameters
/// - `latitude` - The WGS84 latitude in degrees
/// - `altitude` - The WGS84 altitude in meters
///
/// # Returns
/// The magnitude of gravity in m/s^2, acting along the local down axis
pub fn gravity(latitude: &f64, altitude: &f64) -> f64 {
    let sin_lat: f64 = (latitude).to_radians().sin();
    let g0: f64 = (GE * (1.0 + K * sin_lat * sin_lat))
        / (1.0 - ECCENTRICITY_SQUARED * sin_lat * sin_lat).sqrt();
    g0 - 3.08e-6 * altitude
}
/// Calculate the Earth rotation rate vector in the local-level (NED) frame
///
/// # Parameters
/// - `latitude` - The WGS84 latitude in degrees
///
/// # Returns
/// The Earth's rotation rate vector in rad/s, north/east/down components
pub fn earth_rate_lla(latitude: &f64) -> Vector3<f64> {
    let sin_lat: f64 = (latitude).to_radians().sin();
    let cos_lat: f64 = (latitude).to_radians().cos();
    Vector3::new(RATE * cos_lat, 0.0, -RATE * sin_lat)
}

/// Local tangent-plane projection anchored at the navigation origin.
///
/// Created once when the GNSS receiver first passes its quality checks; from then on every
/// fix is expressed as a north/east offset in meters from this point. The radii of curvature
/// are evaluated once at the origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MapProjection {
    /// Origin latitude in degrees
    pub latitude: f64,
    /// Origin longitude in degrees
    pub longitude: f64,
    /// Origin ellipsoidal altitude in meters
    pub altitude: f64,
    meridian_radius: f64,
    transverse_radius: f64,
}
impl MapProjection {
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        let (r_n, r_e, _) = principal_radii(&latitude, &altitude);
        MapProjection {
            latitude,
            longitude,
            altitude,
            meridian_radius: r_n + altitude,
            transverse_radius: (r_e + altitude) * latitude.to_radians().cos(),
        }
    }
    /// Project a geodetic position (degrees) to north/east meters from the origin.
    pub fn project(&self, latitude: f64, longitude: f64) -> Vector2<f64> {
        let mut delta_lon = longitude - self.longitude;
        if delta_lon > 180.0 {
            delta_lon -= 360.0;
        } else if delta_lon < -180.0 {
            delta_lon += 360.0;
        }
        Vector2::new(
            (latitude - self.latitude).to_radians() * self.meridian_radius,
            delta_lon.to_radians() * self.transverse_radius,
        )
    }
    /// Inverse of [`MapProjection::project`]; returns (latitude, longitude) in degrees.
    pub fn reproject(&self, north: f64, east: f64) -> (f64, f64) {
        let latitude = self.latitude + (north / self.meridian_radius).to_degrees();
        let longitude = self.longitude + (east / self.transverse_radius).to_degrees();
        (latitude, longitude)
    }
    /// Gravity magnitude at the origin.
    pub fn gravity(&self) -> f64 {
        gravity(&self.latitude, &self.altitude)
    }
    /// Earth rotation rate in the local NED frame at the origin.
    pub fn earth_rate(&self) -> Vector3<f64> {
        earth_rate_lla(&self.latitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    #[test]
    fn vector_to_skew_symmetric() {
        let v: Vector3<f64> = Vector3::new(1.0, 2.0, 3.0);
        let skew: Matrix3<f64> = super::vector_to_skew_symmetric(&v);
        assert_eq!(skew[(0, 1)], -v[2]);
        assert_eq!(skew[(0, 2)], v[1]);
        assert_eq!(skew[(1, 0)], v[2]);
        assert_eq!(skew[(1, 2)], -v[0]);
        assert_eq!(skew[(2, 0)], -v[1]);
        assert_eq!(skew[(2, 1)], v[0]);
        let w = Vector3::new(-0.5, 0.25, 2.0);
        assert_eq!(skew * w, v.cross(&w));
    }
    #[test]
    fn gravity() {
        assert_approx_eq!(super::gravity(&90.0, &0.0), GP);
        assert_approx_eq!(super::gravity(&0.0, &0.0), GE);
        assert!(super::gravity(&45.0, &1000.0) < super::gravity(&45.0, &0.0));
    }
    #[test]
    fn earth_rate() {
        let rate = earth_rate_lla(&0.0);
        assert_approx_eq!(rate[0], RATE);
        assert_approx_eq!(rate[2], 0.0);
        let rate = earth_rate_lla(&90.0);
        assert_approx_eq!(rate[0], 0.0, 1e-12);
        assert_approx_eq!(rate[2], -RATE);
    }
    #[test]
    fn projection_round_trip() {
        let origin = MapProjection::new(47.397742, 8.545594, 488.0);
        let ne = origin.project(47.398742, 8.546594);
        // roughly 111 m north and 75 m east at this latitude
        assert_approx_eq!(ne[0], 111.2, 0.5);
        assert_approx_eq!(ne[1], 75.4, 0.5);
        let (lat, lon) = origin.reproject(ne[0], ne[1]);
        assert_approx_eq!(lat, 47.398742, 1e-9);
        assert_approx_eq!(lon, 8.546594, 1e-9);
    }
    #[test]
    fn projection_wraps_date_line() {
        let origin = MapProjection::new(0.0, 179.9999, 0.0);
        let ne = origin.project(0.0, -179.9999);
        assert!(ne[1] > 0.0 && ne[1] < 30.0);
    }
}
