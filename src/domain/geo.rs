//! Great-circle distance helpers

/// Mean Earth radius used for all distance calculations (meters)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in meters between two lat/lng points given in degrees
#[inline]
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();

    let sin_lat = (d_lat / 2.0).sin();
    let sin_lng = (d_lng / 2.0).sin();
    let h = sin_lat * sin_lat + lat1_rad.cos() * lat2_rad.cos() * sin_lng * sin_lng;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Anything that has a position on the globe
pub trait GeoPoint {
    fn lat(&self) -> f64;
    fn lng(&self) -> f64;

    fn distance_to<P: GeoPoint + ?Sized>(&self, other: &P) -> f64 {
        haversine_m(self.lat(), self.lng(), other.lat(), other.lng())
    }
}

/// Sum of consecutive-point distances along a path
pub fn path_length_m<P: GeoPoint>(points: &[P]) -> f64 {
    points.windows(2).map(|pair| pair[0].distance_to(&pair[1])).sum()
}
