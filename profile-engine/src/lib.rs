use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use track_core::{clamp_range, round_num, PointField, RunningSummary, Track};

/// The derived attributes, in mandatory processing order. Later attributes
/// may read fields the earlier ones stored (slope needs dist and z, speed
/// needs dist and time, acceleration needs speed and time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    Distance,
    Time,
    Elevation,
    Slope,
    Speed,
    Acceleration,
}

impl AttributeKind {
    /// Point field this attribute fills.
    pub fn field(&self) -> PointField {
        match self {
            AttributeKind::Distance => PointField::Dist,
            AttributeKind::Time => PointField::Time,
            AttributeKind::Elevation => PointField::Z,
            AttributeKind::Slope => PointField::Slope,
            AttributeKind::Speed => PointField::Speed,
            AttributeKind::Acceleration => PointField::Acceleration,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AttributeKind::Distance => "distance",
            AttributeKind::Time => "time",
            AttributeKind::Elevation => "elevation",
            AttributeKind::Slope => "slope",
            AttributeKind::Speed => "speed",
            AttributeKind::Acceleration => "acceleration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAttributeKindError;

impl fmt::Display for ParseAttributeKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown attribute kind")
    }
}

impl std::error::Error for ParseAttributeKindError {}

impl FromStr for AttributeKind {
    type Err = ParseAttributeKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "distance" | "dist" => Ok(AttributeKind::Distance),
            "time" => Ok(AttributeKind::Time),
            "elevation" | "altitude" | "z" => Ok(AttributeKind::Elevation),
            "slope" => Ok(AttributeKind::Slope),
            "speed" => Ok(AttributeKind::Speed),
            "acceleration" => Ok(AttributeKind::Acceleration),
            _ => Err(ParseAttributeKindError),
        }
    }
}

/// Outlier handling for one attribute. The signed step from the previous
/// stored value is capped first, then the absolute range applies; the step
/// cap must see the raw delta, so this order is fixed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClampPolicy {
    pub delta_max: Option<f64>,
    pub range: Option<(f64, f64)>,
}

impl ClampPolicy {
    pub fn apply(&self, prev: Option<f64>, value: f64) -> f64 {
        let mut v = value;
        if let (Some(max), Some(prev)) = (self.delta_max, prev) {
            let delta = v - prev;
            if delta.abs() > max {
                v = prev + max * delta.signum();
            }
        }
        clamp_range(v, self.range)
    }
}

/// Unit factors and clamp policies the attribute engines read. The chart
/// options layer builds one of these from user-facing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    pub distance_factor: f64,
    pub altitude_factor: f64,
    pub speed_factor: f64,
    pub acceleration_factor: f64,
    pub time_factor: f64,
    /// Assumed average speed (km/h) for synthesizing missing timestamps.
    pub time_avg_speed: f64,
    /// Leave elevation holes alone instead of repairing them.
    pub skip_null_z_coords: bool,
    pub altitude: ClampPolicy,
    pub slope: ClampPolicy,
    pub speed: ClampPolicy,
    pub acceleration: ClampPolicy,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            distance_factor: 1.0,
            altitude_factor: 1.0,
            speed_factor: 1.0,
            acceleration_factor: 1.0,
            time_factor: 3600.0,
            time_avg_speed: 3.6,
            skip_null_z_coords: false,
            altitude: ClampPolicy::default(),
            slope: ClampPolicy::default(),
            speed: ClampPolicy::default(),
            acceleration: ClampPolicy::default(),
        }
    }
}

/// Which optional series run. Distance, time and elevation always do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledAttributes {
    pub slope: bool,
    pub speed: bool,
    pub acceleration: bool,
}

/// One derived attribute: stateful, incremental, run in registration order
/// per appended point.
pub trait AttributeEngine {
    fn kind(&self) -> AttributeKind;

    fn field(&self) -> PointField {
        self.kind().field()
    }

    /// When false, a hole at the previous point is repaired (or the point
    /// dropped) before the current point is processed.
    fn skip_null(&self) -> bool {
        true
    }

    fn reset(&mut self);

    /// Raw value for the point at `index`. Reads only already-computed
    /// fields of the current and previous points.
    fn fetch(&mut self, track: &Track, index: usize) -> Option<f64>;

    /// Fold the fetched value into the running summary and return what gets
    /// stored (possibly smoothed/clamped).
    fn update(
        &mut self,
        value: f64,
        _track: &mut Track,
        _index: usize,
        _summary: &mut RunningSummary,
    ) -> f64 {
        value
    }
}

// ---------- individual attribute engines -------------------------------------

/// Cumulative geodesic distance. The per-step delta is rounded to 5 decimal
/// places of a kilometer to keep float noise out of the running total.
struct DistanceEngine {
    factor: f64,
}

impl AttributeEngine for DistanceEngine {
    fn kind(&self) -> AttributeKind {
        AttributeKind::Distance
    }

    fn reset(&mut self) {}

    fn fetch(&mut self, track: &Track, index: usize) -> Option<f64> {
        let p = track.get(index)?;
        let prev = track.get(index.saturating_sub(1))?;
        let delta = p.distance_to(prev) * self.factor;
        Some(round_num(delta / 1000.0, 5))
    }

    fn update(
        &mut self,
        delta: f64,
        _track: &mut Track,
        _index: usize,
        summary: &mut RunningSummary,
    ) -> f64 {
        // stored value is the running total, so dist never decreases
        summary.add("distance", delta)
    }
}

/// Timestamps: the source value when present, else synthesized from the
/// distance delta at the configured average speed. A track whose first point
/// has no timestamp anchors at 0. Also maintains cumulative duration.
struct TimeEngine {
    avg_speed: f64,
    time_factor: f64,
}

impl TimeEngine {
    fn new(params: &PipelineParams) -> Self {
        let base = if params.time_avg_speed != 0.0 {
            params.time_avg_speed
        } else {
            3.6
        };
        let factor = if params.speed_factor != 0.0 {
            params.speed_factor
        } else {
            1.0
        };
        Self {
            avg_speed: base * factor,
            time_factor: params.time_factor,
        }
    }
}

impl AttributeEngine for TimeEngine {
    fn kind(&self) -> AttributeKind {
        AttributeKind::Time
    }

    fn reset(&mut self) {}

    fn fetch(&mut self, track: &Track, index: usize) -> Option<f64> {
        let p = track.get(index)?;
        if let Some(t) = p.time {
            return Some(t as f64);
        }
        if index == 0 {
            return Some(0.0);
        }
        let prev = track.get(index - 1)?;
        let t0 = prev.time.unwrap_or(0) as f64;
        let dx = p.dist.unwrap_or(0.0) - prev.dist.unwrap_or(0.0);
        let dt = dx / self.avg_speed * self.time_factor * 1000.0;
        Some(t0 + dt)
    }

    fn update(
        &mut self,
        time: f64,
        track: &mut Track,
        index: usize,
        summary: &mut RunningSummary,
    ) -> f64 {
        let prev_t = track
            .get(index.saturating_sub(1))
            .and_then(|p| p.time)
            .unwrap_or(time as i64) as f64;
        let total = summary.add("time", (time - prev_t).abs());
        if let Some(p) = track.get_mut(index) {
            p.duration = Some(total as i64);
        }
        time
    }
}

/// Elevation: unit factor, outlier smoothing, running max/min/avg.
struct ElevationEngine {
    factor: f64,
    clamp: ClampPolicy,
    skip_null: bool,
}

impl AttributeEngine for ElevationEngine {
    fn kind(&self) -> AttributeKind {
        AttributeKind::Elevation
    }

    fn skip_null(&self) -> bool {
        self.skip_null
    }

    fn reset(&mut self) {}

    fn fetch(&mut self, track: &Track, index: usize) -> Option<f64> {
        let alt = track.get(index)?.alt?;
        Some(alt * self.factor)
    }

    fn update(
        &mut self,
        z: f64,
        track: &mut Track,
        index: usize,
        summary: &mut RunningSummary,
    ) -> f64 {
        let prev_z = if index > 0 {
            track.get(index - 1).and_then(|p| p.z)
        } else {
            None
        };
        let z = self.clamp.apply(prev_z, z);
        summary.track_max("elevation_max", z);
        summary.track_min("elevation_min", z);
        summary.blend_avg("elevation_avg", z);
        z
    }
}

/// Grade in percent, plus total ascent/descent from the elevation deltas.
struct SlopeEngine {
    clamp: ClampPolicy,
}

impl SlopeEngine {
    fn elevation_delta(track: &Track, index: usize) -> Option<f64> {
        let z = track.get(index)?.z?;
        let prev_z = track.get(index.saturating_sub(1))?.z?;
        Some(z - prev_z)
    }
}

impl AttributeEngine for SlopeEngine {
    fn kind(&self) -> AttributeKind {
        AttributeKind::Slope
    }

    fn reset(&mut self) {}

    fn fetch(&mut self, track: &Track, index: usize) -> Option<f64> {
        let p = track.get(index)?;
        let prev = track.get(index.saturating_sub(1))?;
        let dx = (p.dist.unwrap_or(0.0) - prev.dist.unwrap_or(0.0)) * 1000.0;
        match Self::elevation_delta(track, index) {
            Some(dz) if dx != 0.0 => Some(dz / dx * 100.0),
            _ => Some(0.0),
        }
    }

    fn update(
        &mut self,
        slope: f64,
        track: &mut Track,
        index: usize,
        summary: &mut RunningSummary,
    ) -> f64 {
        let prev_slope = if index > 0 {
            track.get(index - 1).and_then(|p| p.slope)
        } else {
            None
        };
        let slope = self.clamp.apply(prev_slope, slope);
        if let Some(dz) = Self::elevation_delta(track, index) {
            if dz > 0.0 {
                summary.add("ascent", dz);
            } else if dz < 0.0 {
                summary.add("descent", -dz);
            }
        }
        summary.track_max("slope_max", slope);
        summary.track_min("slope_min", slope);
        summary.blend_avg("slope_avg", slope);
        round_num(slope, 2)
    }
}

/// Speed over the distance/time deltas, scaled by the time and speed unit
/// factors (km/h with the defaults).
struct SpeedEngine {
    time_factor: f64,
    speed_factor: f64,
    clamp: ClampPolicy,
}

impl AttributeEngine for SpeedEngine {
    fn kind(&self) -> AttributeKind {
        AttributeKind::Speed
    }

    fn reset(&mut self) {}

    fn fetch(&mut self, track: &Track, index: usize) -> Option<f64> {
        let p = track.get(index)?;
        let prev = track.get(index.saturating_sub(1))?;
        let dx = (p.dist.unwrap_or(0.0) - prev.dist.unwrap_or(0.0)) * 1000.0;
        let dt = match (p.time, prev.time) {
            (Some(a), Some(b)) => (a - b) as f64,
            _ => 0.0,
        };
        if dt > 0.0 {
            Some((dx / dt * self.time_factor).abs() * self.speed_factor)
        } else {
            Some(0.0)
        }
    }

    fn update(
        &mut self,
        speed: f64,
        track: &mut Track,
        index: usize,
        summary: &mut RunningSummary,
    ) -> f64 {
        let prev_speed = if index > 0 {
            track.get(index - 1).and_then(|p| p.speed)
        } else {
            None
        };
        let speed = self.clamp.apply(prev_speed, speed);
        summary.track_max("speed_max", speed);
        summary.track_min("speed_min", speed);
        summary.blend_avg("speed_avg", speed);
        round_num(speed, 2)
    }
}

/// Acceleration from the speed delta, converted back to m/s before dividing
/// by the time delta in seconds.
struct AccelerationEngine {
    time_factor: f64,
    acceleration_factor: f64,
    clamp: ClampPolicy,
}

impl AttributeEngine for AccelerationEngine {
    fn kind(&self) -> AttributeKind {
        AttributeKind::Acceleration
    }

    fn reset(&mut self) {}

    fn fetch(&mut self, track: &Track, index: usize) -> Option<f64> {
        let p = track.get(index)?;
        let prev = track.get(index.saturating_sub(1))?;
        let dv = (p.speed.unwrap_or(0.0) - prev.speed.unwrap_or(0.0)) * (1000.0 / self.time_factor);
        let dt = match (p.time, prev.time) {
            (Some(a), Some(b)) => (a - b) as f64 / 1000.0,
            _ => 0.0,
        };
        if dt > 0.0 {
            Some((dv / dt).abs() * self.acceleration_factor)
        } else {
            Some(0.0)
        }
    }

    fn update(
        &mut self,
        acceleration: f64,
        track: &mut Track,
        index: usize,
        summary: &mut RunningSummary,
    ) -> f64 {
        let prev_acc = if index > 0 {
            track.get(index - 1).and_then(|p| p.acceleration)
        } else {
            None
        };
        let acceleration = self.clamp.apply(prev_acc, acceleration);
        summary.track_max("acceleration_max", acceleration);
        summary.track_min("acceleration_min", acceleration);
        summary.blend_avg("acceleration_avg", acceleration);
        round_num(acceleration, 2)
    }
}

// ---------- factory -----------------------------------------------------------

pub fn create_engine(kind: AttributeKind, params: &PipelineParams) -> Box<dyn AttributeEngine> {
    match kind {
        AttributeKind::Distance => Box::new(DistanceEngine {
            factor: params.distance_factor,
        }),
        AttributeKind::Time => Box::new(TimeEngine::new(params)),
        AttributeKind::Elevation => Box::new(ElevationEngine {
            factor: params.altitude_factor,
            clamp: params.altitude,
            skip_null: params.skip_null_z_coords,
        }),
        AttributeKind::Slope => Box::new(SlopeEngine {
            clamp: params.slope,
        }),
        AttributeKind::Speed => Box::new(SpeedEngine {
            time_factor: params.time_factor,
            speed_factor: params.speed_factor,
            clamp: params.speed,
        }),
        AttributeKind::Acceleration => Box::new(AccelerationEngine {
            time_factor: params.time_factor,
            acceleration_factor: params.acceleration_factor,
            clamp: params.acceleration,
        }),
    }
}

// ---------- pipeline ----------------------------------------------------------

/// What happened to the track while processing one appended point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointOutcome {
    /// Point processed in place.
    Stored { index: usize },
    /// An unrepairable hole removed the preceding point; the processed
    /// point's final index is one lower than where it was appended.
    CollapsedPrevious { index: usize },
}

impl PointOutcome {
    pub fn index(&self) -> usize {
        match *self {
            PointOutcome::Stored { index } => index,
            PointOutcome::CollapsedPrevious { index } => index,
        }
    }
}

/// Ordered attribute processor. Engines run in a fixed order for each
/// appended point, and point `i` is only touched after `i-1` completed every
/// engine, so a `fetch` can rely on every earlier field of both points.
pub struct ProfilePipeline {
    engines: Vec<Box<dyn AttributeEngine>>,
    last_valid: Vec<Option<f64>>,
}

impl ProfilePipeline {
    pub fn new(params: &PipelineParams, enabled: EnabledAttributes) -> Self {
        let mut kinds = vec![
            AttributeKind::Distance,
            AttributeKind::Time,
            AttributeKind::Elevation,
        ];
        if enabled.slope {
            kinds.push(AttributeKind::Slope);
        }
        // acceleration reads stored speeds, so speed runs whenever either is on
        if enabled.speed || enabled.acceleration {
            kinds.push(AttributeKind::Speed);
        }
        if enabled.acceleration {
            kinds.push(AttributeKind::Acceleration);
        }
        let engines: Vec<_> = kinds.iter().map(|&k| create_engine(k, params)).collect();
        let last_valid = vec![None; engines.len()];
        Self {
            engines,
            last_valid,
        }
    }

    pub fn kinds(&self) -> Vec<AttributeKind> {
        self.engines.iter().map(|e| e.kind()).collect()
    }

    pub fn reset(&mut self) {
        for e in &mut self.engines {
            e.reset();
        }
        for lv in &mut self.last_valid {
            *lv = None;
        }
    }

    /// Run every engine for the point appended at `index`. May repair a hole
    /// at `index - 1` or, failing that, remove that point entirely.
    pub fn on_point_added(
        &mut self,
        track: &mut Track,
        summary: &mut RunningSummary,
        index: usize,
    ) -> PointOutcome {
        let mut index = index;
        let mut collapsed = false;

        for ei in 0..self.engines.len() {
            let engine = &mut self.engines[ei];
            let field = engine.field();

            if !engine.skip_null() && index > 0 {
                let prev_defined = track
                    .get(index - 1)
                    .and_then(|p| field.value(p))
                    .is_some();
                if !prev_defined {
                    let curr = engine.fetch(track, index);
                    let repaired = match (self.last_valid[ei], curr) {
                        (Some(lv), Some(c)) => Some((lv + c) / 2.0),
                        (Some(lv), None) => Some(lv),
                        (None, Some(c)) => Some(c),
                        (None, None) => None,
                    };
                    match repaired {
                        Some(v) => {
                            if let Some(p) = track.get_mut(index - 1) {
                                field.set(p, v);
                            }
                        }
                        None => {
                            debug!(
                                "removing point {} with unrepairable {}",
                                index - 1,
                                field.name()
                            );
                            track.remove(index - 1);
                            index -= 1;
                            collapsed = true;
                        }
                    }
                }
            }

            match engine.fetch(track, index) {
                Some(raw) => {
                    if let Some(p) = track.get_mut(index) {
                        field.set(p, raw);
                    }
                    let stored = engine.update(raw, track, index, summary);
                    if let Some(p) = track.get_mut(index) {
                        field.set(p, stored);
                    }
                    self.last_valid[ei] = Some(stored);
                }
                None => {
                    trace!("{} undefined at point {}", engine.kind().name(), index);
                }
            }
        }

        if collapsed {
            PointOutcome::CollapsedPrevious { index }
        } else {
            PointOutcome::Stored { index }
        }
    }

    /// Recompute every attribute for every point, e.g. after a bulk load.
    /// Wipes the computed fields and the aggregates first. Previously
    /// synthesized timestamps are kept (they are indistinguishable from
    /// source ones once stored).
    pub fn rebuild_all(&mut self, track: &mut Track, summary: &mut RunningSummary) {
        self.reset();
        summary.reset();
        for p in track.as_mut_slice() {
            p.z = None;
            p.dist = None;
            p.duration = None;
            p.slope = None;
            p.speed = None;
            p.acceleration = None;
            p.x_diag_coord = None;
        }
        let mut i = 0;
        while i < track.len() {
            let outcome = self.on_point_added(track, summary, i);
            i = outcome.index() + 1;
        }
        trace!("pipeline rebuilt {} points", track.len());
    }
}
