use serde::Serialize;

const EARTH_RADIUS_KM: f64 = 6371.0;
const KM_PER_DEGREE_LAT: f64 = 111.0;

/// Geographic bounding box in degrees. `north > south`, `east > west`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

/// Center of one search tile. Transient: only the derived location key is
/// ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchPoint {
    pub lat: f64,
    pub lng: f64,
    pub radius_meters: u32,
}

impl SearchPoint {
    /// Stable key for the freshness cache. Four decimals keeps tiles distinct
    /// down to ~11 m while absorbing float noise from grid regeneration.
    pub fn location_key(&self) -> String {
        format!("{:.4},{:.4}", self.lat, self.lng)
    }
}

/// Tiles the bounding box into a raster of evenly spaced search points,
/// north to south, west to east within each row. Longitude spacing is
/// corrected by cos(latitude) so spacing stays isotropic in meters. Both the
/// southern and eastern boundaries are included so the grid has no edge gaps.
pub fn generate(bbox: &BoundingBox, spacing_km: f64) -> Vec<SearchPoint> {
    let radius_meters = (spacing_km * 1000.0).round() as u32;
    let lat_step = spacing_km / KM_PER_DEGREE_LAT;

    let mut points = Vec::new();
    let mut lat = bbox.north;
    loop {
        let lon_step = spacing_km / (KM_PER_DEGREE_LAT * lat.to_radians().cos());
        let mut lng = bbox.west;
        loop {
            points.push(SearchPoint {
                lat,
                lng,
                radius_meters,
            });
            if lng >= bbox.east {
                break;
            }
            lng = (lng + lon_step).min(bbox.east);
        }
        if lat <= bbox.south {
            break;
        }
        lat = (lat - lat_step).max(bbox.south);
    }
    points
}

/// Great-circle distance in kilometers.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}
