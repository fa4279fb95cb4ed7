use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Milliseconds since Unix epoch.
pub type Timestamp = i64;

/// Number of milliseconds in common units.
pub const MS: i64 = 1_000;
pub const MINUTE_MS: i64 = 60 * MS;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two lat/lng pairs, in meters.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// One sample of a geographic track.
///
/// `lat`/`lng`/`alt`/`time` are the ingested values and never change after
/// append. Everything else is filled in by the attribute pipeline, one field
/// per attribute, in registration order.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrackPoint {
    pub lat: f64,
    pub lng: f64,
    /// Raw altitude in source units, when the source had one.
    pub alt: Option<f64>,
    /// Source timestamp, ms since epoch.
    pub time: Option<Timestamp>,
    /// Elevation after unit conversion, clamping and hole repair.
    pub z: Option<f64>,
    /// Cumulative distance from the first point (km unless rescaled).
    pub dist: Option<f64>,
    /// Cumulative elapsed time in ms.
    pub duration: Option<i64>,
    /// Grade in percent.
    pub slope: Option<f64>,
    /// Unit-factor scaled speed (km/h by default).
    pub speed: Option<f64>,
    /// Unit-factor scaled acceleration (m/s^2 by default).
    pub acceleration: Option<f64>,
    /// Pixel x of this point in the last chart layout pass.
    pub x_diag_coord: Option<f64>,
}

impl TrackPoint {
    pub fn new(lat: f64, lng: f64, alt: Option<f64>, time: Option<Timestamp>) -> Self {
        Self {
            lat,
            lng,
            alt,
            time,
            ..Self::default()
        }
    }

    /// Geodesic distance to another point, in meters.
    pub fn distance_to(&self, other: &TrackPoint) -> f64 {
        haversine_distance(self.lat, self.lng, other.lat, other.lng)
    }
}

/// A derived per-point field, addressable by name so scales, lookups and the
/// pipeline can all work against the same accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointField {
    Dist,
    Time,
    Duration,
    Z,
    Slope,
    Speed,
    Acceleration,
}

impl PointField {
    pub fn value(&self, p: &TrackPoint) -> Option<f64> {
        match self {
            PointField::Dist => p.dist,
            PointField::Time => p.time.map(|t| t as f64),
            PointField::Duration => p.duration.map(|d| d as f64),
            PointField::Z => p.z,
            PointField::Slope => p.slope,
            PointField::Speed => p.speed,
            PointField::Acceleration => p.acceleration,
        }
    }

    pub fn set(&self, p: &mut TrackPoint, v: f64) {
        match self {
            PointField::Dist => p.dist = Some(v),
            PointField::Time => p.time = Some(v as Timestamp),
            PointField::Duration => p.duration = Some(v as i64),
            PointField::Z => p.z = Some(v),
            PointField::Slope => p.slope = Some(v),
            PointField::Speed => p.speed = Some(v),
            PointField::Acceleration => p.acceleration = Some(v),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PointField::Dist => "dist",
            PointField::Time => "time",
            PointField::Duration => "duration",
            PointField::Z => "z",
            PointField::Slope => "slope",
            PointField::Speed => "speed",
            PointField::Acceleration => "acceleration",
        }
    }
}

/// Ordered, append-only (except for pipeline hole collapse) track storage.
///
/// A point's array index is its identity for the lifetime of the track; the
/// generation counter makes (generation, index) durable across `clear()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Track {
    points: Vec<TrackPoint>,
    generation: u64,
}

impl Track {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TrackPoint> {
        self.points.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut TrackPoint> {
        self.points.get_mut(index)
    }

    pub fn first(&self) -> Option<&TrackPoint> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&TrackPoint> {
        self.points.last()
    }

    pub fn as_slice(&self) -> &[TrackPoint] {
        &self.points
    }

    pub fn as_mut_slice(&mut self) -> &mut [TrackPoint] {
        &mut self.points
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TrackPoint> {
        self.points.iter()
    }

    pub fn push(&mut self, point: TrackPoint) -> usize {
        self.points.push(point);
        self.points.len() - 1
    }

    /// Remove the point at `index`, collapsing later indices down by one.
    /// Used by the pipeline when a hole cannot be repaired.
    pub fn remove(&mut self, index: usize) -> TrackPoint {
        self.points.remove(index)
    }

    /// Drop every point and start a new generation. Indices from the old
    /// generation are never considered live again.
    pub fn clear(&mut self) {
        self.points.clear();
        self.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// (min, max) of a derived field over all points where it is defined.
    pub fn extent(&self, field: PointField) -> Option<(f64, f64)> {
        let mut ext: Option<(f64, f64)> = None;
        for p in &self.points {
            if let Some(v) = field.value(p) {
                ext = Some(match ext {
                    None => (v, v),
                    Some((lo, hi)) => (lo.min(v), hi.max(v)),
                });
            }
        }
        ext
    }
}

impl<'a> IntoIterator for &'a Track {
    type Item = &'a TrackPoint;
    type IntoIter = std::slice::Iter<'a, TrackPoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

/// Incrementally maintained aggregate statistics for a whole track.
///
/// Each attribute's update step writes here one point at a time; nothing is
/// ever recomputed by rescanning the track. Keys are statistic names like
/// `elevation_max` or `ascent`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunningSummary {
    values: HashMap<String, f64>,
}

impl RunningSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn value_or(&self, name: &str, default: f64) -> f64 {
        self.get(name).unwrap_or(default)
    }

    pub fn set(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), value);
    }

    /// Add `delta` to the accumulator, returning the new total.
    pub fn add(&mut self, name: &str, delta: f64) -> f64 {
        let e = self.values.entry(name.to_string()).or_insert(0.0);
        *e += delta;
        *e
    }

    pub fn track_max(&mut self, name: &str, value: f64) {
        let e = self
            .values
            .entry(name.to_string())
            .or_insert(f64::NEG_INFINITY);
        if value > *e {
            *e = value;
        }
    }

    pub fn track_min(&mut self, name: &str, value: f64) {
        let e = self.values.entry(name.to_string()).or_insert(f64::INFINITY);
        if value < *e {
            *e = value;
        }
    }

    /// Two-term exponential blend: `avg = (value + avg) / 2`, seeded with the
    /// first value. Biased toward recent points on purpose.
    pub fn blend_avg(&mut self, name: &str, value: f64) {
        let next = match self.get(name) {
            Some(avg) => (value + avg) / 2.0,
            None => value,
        };
        self.set(name, next);
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Clamp `value` into an optional inclusive `[min, max]` range.
pub fn clamp_range(value: f64, range: Option<(f64, f64)>) -> f64 {
    match range {
        Some((lo, hi)) => value.min(hi).max(lo),
        None => value,
    }
}

/// Round to a fixed number of decimal places.
pub fn round_num(value: f64, decimals: u32) -> f64 {
    let k = 10f64.powi(decimals as i32);
    (value * k).round() / k
}

/// Fixed-decimals rendering, `format_fixed(3.5, 2)` -> "3.50".
pub fn format_fixed(value: f64, decimals: usize) -> String {
    format!("{value:.decimals$}")
}

/// Render a millisecond duration as `3d 01:24'10"`. Hours always appear,
/// days only when nonzero; seconds are rounded with carry.
pub fn format_time(t: i64) -> String {
    let mut d = t / DAY_MS;
    let mut h = (t - d * DAY_MS) / HOUR_MS;
    let mut m = (t - d * DAY_MS - h * HOUR_MS) / MINUTE_MS;
    let s_ms = t - d * DAY_MS - h * HOUR_MS - m * MINUTE_MS;
    let mut s = ((s_ms as f64) / MS as f64).round() as i64;
    if s == 60 {
        m += 1;
        s = 0;
    }
    if m == 60 {
        h += 1;
        m = 0;
    }
    if h == 24 {
        d += 1;
        h = 0;
    }
    let day_part = if d != 0 { format!("{d}d ") } else { String::new() };
    format!("{day_part}{h:02}:{m:02}'{s:02}\"")
}

/// Render a clock time-of-day (`HH:MM:SS`) for a timestamp, UTC.
pub fn format_clock(ts: Timestamp) -> String {
    let ms_into_day = ts.rem_euclid(DAY_MS);
    let h = ms_into_day / HOUR_MS;
    let m = (ms_into_day % HOUR_MS) / MINUTE_MS;
    let s = (ms_into_day % MINUTE_MS) / MS;
    format!("{h:02}:{m:02}:{s:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_point(lat: f64, lng: f64, alt: f64) -> TrackPoint {
        TrackPoint::new(lat, lng, Some(alt), None)
    }

    #[test]
    fn haversine_one_degree_latitude() {
        // One degree of latitude is ~111.195 km on a spherical Earth.
        let dist = haversine_distance(0.0, 0.0, 1.0, 0.0);
        assert!((dist - 111_195.0).abs() < 200.0);
    }

    #[test]
    fn haversine_zero_for_same_point() {
        assert_eq!(haversine_distance(45.5, 9.2, 45.5, 9.2), 0.0);
    }

    #[test]
    fn track_extent_skips_undefined() {
        let mut track = Track::new();
        track.push(mk_point(45.0, 9.0, 100.0));
        track.push(mk_point(45.1, 9.0, 250.0));
        track.push(mk_point(45.2, 9.0, 50.0));
        // z not yet computed by any pipeline
        assert_eq!(track.extent(PointField::Z), None);
        for i in 0..track.len() {
            let alt = track.get(i).unwrap().alt;
            if let Some(a) = alt {
                PointField::Z.set(track.get_mut(i).unwrap(), a);
            }
        }
        assert_eq!(track.extent(PointField::Z), Some((50.0, 250.0)));
    }

    #[test]
    fn clear_bumps_generation() {
        let mut track = Track::new();
        track.push(mk_point(0.0, 0.0, 1.0));
        let g0 = track.generation();
        track.clear();
        assert!(track.is_empty());
        assert_eq!(track.generation(), g0 + 1);
    }

    #[test]
    fn summary_blend_avg_recurrence() {
        let mut summary = RunningSummary::new();
        summary.blend_avg("elevation_avg", 100.0);
        assert_eq!(summary.get("elevation_avg"), Some(100.0));
        summary.blend_avg("elevation_avg", 200.0);
        // (200 + 100) / 2, not the arithmetic mean of a rescan
        assert_eq!(summary.get("elevation_avg"), Some(150.0));
        summary.blend_avg("elevation_avg", 50.0);
        assert_eq!(summary.get("elevation_avg"), Some(100.0));
    }

    #[test]
    fn summary_max_min_seed_from_first_value() {
        let mut summary = RunningSummary::new();
        summary.track_max("elevation_max", -20.0);
        summary.track_min("elevation_min", -20.0);
        assert_eq!(summary.get("elevation_max"), Some(-20.0));
        assert_eq!(summary.get("elevation_min"), Some(-20.0));
        summary.track_max("elevation_max", -30.0);
        summary.track_min("elevation_min", -5.0);
        assert_eq!(summary.get("elevation_max"), Some(-20.0));
        assert_eq!(summary.get("elevation_min"), Some(-20.0));
    }

    #[test]
    fn clamp_range_is_inclusive() {
        assert_eq!(clamp_range(5.0, Some((-3.0, 3.0))), 3.0);
        assert_eq!(clamp_range(-5.0, Some((-3.0, 3.0))), -3.0);
        assert_eq!(clamp_range(1.0, Some((-3.0, 3.0))), 1.0);
        assert_eq!(clamp_range(99.0, None), 99.0);
    }

    #[test]
    fn round_num_five_decimals() {
        assert_eq!(round_num(0.123_456_789, 5), 0.12346);
        assert_eq!(round_num(12.0, 5), 12.0);
    }

    #[test]
    fn format_time_carries_and_pads() {
        assert_eq!(format_time(0), "00:00'00\"");
        assert_eq!(format_time(10 * MS), "00:00'10\"");
        assert_eq!(format_time(HOUR_MS + 24 * MINUTE_MS + 10 * MS), "01:24'10\"");
        assert_eq!(format_time(DAY_MS + 3 * HOUR_MS), "1d 03:00'00\"");
        // 59.6s rounds up and carries through minute/hour/day
        assert_eq!(format_time(DAY_MS - 400), "1d 00:00'00\"");
    }

    #[test]
    fn format_clock_wraps_by_day() {
        assert_eq!(format_clock(0), "00:00:00");
        assert_eq!(format_clock(DAY_MS + HOUR_MS + 30 * MINUTE_MS), "01:30:00");
    }
}
