//! Projection seam between flat-DB lat/lon and cache x/y coordinates.
//!
//! The projection's config string is folded into the cache config, so two
//! caches built with different projections never share a directory.

use flatchart::LatLonBounds;

pub trait Projection: Send + Sync {
    /// Stable text identifying this projection and its parameters.
    fn config_string(&self) -> String;

    /// Whether this projection is usable over the given library's extent.
    fn can_project_library(&self, database_num: i32, library_name: &str, bounds: LatLonBounds) -> bool;

    /// Project to cache coordinates.
    fn project_pos(&self, lat_deg: f64, lon_deg: f64) -> [f32; 2];

    /// Project a math-convention azimuth (radians, counter-clockwise from
    /// east) at the already-projected position (x, y).
    fn project_azimuth_rad(&self, x: f32, y: f32, azimuth_rad: f64) -> f64;
}

/// Equirectangular: x is longitude, y is latitude, both in degrees. Valid
/// everywhere, azimuths pass through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlateCarree;

impl Projection for PlateCarree {
    fn config_string(&self) -> String {
        "plateCarree".to_string()
    }

    fn can_project_library(&self, _database_num: i32, _library_name: &str, _bounds: LatLonBounds) -> bool {
        true
    }

    fn project_pos(&self, lat_deg: f64, lon_deg: f64) -> [f32; 2] {
        [lon_deg as f32, lat_deg as f32]
    }

    fn project_azimuth_rad(&self, _x: f32, _y: f32, azimuth_rad: f64) -> f64 {
        azimuth_rad
    }
}

/// Projected bounding box of a lat/lon box, found by projecting sample
/// points along each edge. Returns [xMin, xMax, yMin, yMax].
pub fn compute_xy_min_max(proj: &dyn Projection, points_per_edge: usize, bounds: LatLonBounds) -> [f32; 4] {
    let points_per_edge = points_per_edge.max(1);

    let mut x_min = f32::INFINITY;
    let mut x_max = f32::NEG_INFINITY;
    let mut y_min = f32::INFINITY;
    let mut y_max = f32::NEG_INFINITY;

    let mut sample = |lat_deg: f64, lon_deg: f64| {
        let [x, y] = proj.project_pos(lat_deg, lon_deg);
        x_min = x_min.min(x);
        x_max = x_max.max(x);
        y_min = y_min.min(y);
        y_max = y_max.max(y);
    };

    // Walk the edges clockwise from the northwest corner; each edge omits
    // its final point, which the next edge supplies.
    for i in 0..points_per_edge {
        let a = i as f64 / points_per_edge as f64;
        sample(bounds.lat_max, (1.0 - a) * bounds.lon_min + a * bounds.lon_max);
    }
    for i in 0..points_per_edge {
        let a = i as f64 / points_per_edge as f64;
        sample((1.0 - a) * bounds.lat_max + a * bounds.lat_min, bounds.lon_max);
    }
    for i in 0..points_per_edge {
        let a = i as f64 / points_per_edge as f64;
        sample(bounds.lat_min, (1.0 - a) * bounds.lon_max + a * bounds.lon_min);
    }
    for i in 0..points_per_edge {
        let a = i as f64 / points_per_edge as f64;
        sample((1.0 - a) * bounds.lat_min + a * bounds.lat_max, bounds.lon_min);
    }

    [x_min, x_max, y_min, y_max]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plate_carree_bounds_match_corners() {
        let bounds = LatLonBounds { lat_min: 10.0, lat_max: 20.0, lon_min: -40.0, lon_max: -30.0 };
        let xy = compute_xy_min_max(&PlateCarree, 2, bounds);
        assert_eq!(xy, [-40.0, -30.0, 10.0, 20.0]);
    }

    #[test]
    fn single_sample_per_edge_still_covers_all_corners() {
        let bounds = LatLonBounds { lat_min: -5.0, lat_max: 5.0, lon_min: 0.0, lon_max: 8.0 };
        let xy = compute_xy_min_max(&PlateCarree, 1, bounds);
        assert_eq!(xy, [0.0, 8.0, -5.0, 5.0]);
    }
}
