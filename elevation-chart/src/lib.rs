//! Headless elevation profile chart for a geo track.
//!
//! The chart owns scales, series registrations, gesture state and the summary
//! panel, but never touches a DOM or a map. Geometry leaves through a
//! [`RendererBackend`], user intent comes in as plain method calls, and
//! everything the embedding layer must react to flows back out as
//! [`ChartEvent`]s drained from a queue or pushed into an [`EventSink`].
//!
//! [`ElevationProfile`] is the facade wiring track storage, the attribute
//! pipeline, the chart and the summary together.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::str::FromStr;

use log::{debug, trace};
use profile_engine::{ClampPolicy, EnabledAttributes, PipelineParams, ProfilePipeline};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use track_core::{
    format_clock, format_fixed, format_time, PointField, RunningSummary, Timestamp, Track,
    TrackPoint,
};

/// Kilometres to miles.
pub const MILE_FACTOR: f64 = 0.621371;
/// Metres to feet.
pub const FOOT_FACTOR: f64 = 3.28084;

const ZOOM_MIN: f64 = 1.0;
const ZOOM_MAX: f64 = 10.0;
const TICK_LEN: f64 = 6.0;
const RIGHT_AXIS_STEP: f64 = 40.0;
const RIGHT_AXIS_MARGIN: f64 = 30.0;
const LEGEND_STEP: f64 = 55.0;
const LEGEND_MARGIN: f64 = 30.0;
const AXIS_COLOR: &str = "#000";
const DIM_AXIS_COLOR: &str = "#555";
const GRID_COLOR: &str = "#eee";
const FOCUS_COLOR: &str = "#000";
const BRUSH_COLOR: &str = "#777";
const TOOLTIP_BG: &str = "#fff";
const TOOLTIP_BORDER: &str = "#555";

// ---------- errors ----------------------------------------------------------

#[derive(Debug, Error)]
pub enum ChartError {
    /// The margins leave no drawable area inside the viewport.
    #[error("viewport {width}x{height} leaves no room inside the margins")]
    ViewportTooSmall { width: f64, height: f64 },
    #[error("invalid chart options: {0}")]
    InvalidOptions(#[from] serde_json::Error),
    #[error("invalid theme color: {0}")]
    InvalidColor(#[from] ParseColorError),
}

// ---------- themes ----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("not a #RGB or #RRGGBB hex color: {0:?}")]
pub struct ParseColorError(pub String);

/// Parsed form of a `#RGB`/`#RRGGBB` hex color. Backends receive colors as
/// CSS strings; this is for embedders that need channel values, and for
/// rejecting bad palette literals at setup time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: f32,
}

impl Rgba {
    pub fn with_alpha(mut self, a: f32) -> Self {
        self.a = a;
        self
    }

    pub fn css(&self) -> String {
        format!("rgba({},{},{},{})", self.r, self.g, self.b, self.a)
    }
}

impl FromStr for Rgba {
    type Err = ParseColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseColorError(s.to_string());
        let hex = s.strip_prefix('#').ok_or_else(err)?;
        let (r, g, b) = match hex.len() {
            3 => {
                let digits: Vec<u8> = hex
                    .chars()
                    .map(|c| c.to_digit(16).map(|v| (v * 17) as u8))
                    .collect::<Option<_>>()
                    .ok_or_else(err)?;
                (digits[0], digits[1], digits[2])
            }
            6 => {
                let channel = |i: usize| {
                    hex.get(i..i + 2)
                        .and_then(|d| u8::from_str_radix(d, 16).ok())
                        .ok_or_else(err)
                };
                (channel(0)?, channel(2)?, channel(4)?)
            }
            _ => return Err(err()),
        };
        Ok(Rgba { r, g, b, a: 1.0 })
    }
}

/// Fill color, fill opacity and stroke of one named theme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    pub area: String,
    pub alpha: f32,
    pub stroke: String,
}

impl Theme {
    /// Built-in theme lookup. A trailing `-theme` suffix is accepted.
    pub fn named(name: &str) -> Option<Theme> {
        let mk = |area: &str, alpha: f32, stroke: &str| Theme {
            area: area.to_string(),
            alpha,
            stroke: stroke.to_string(),
        };
        match name.trim_end_matches("-theme") {
            "lightblue" => Some(mk("#3366CC", 0.45, "#3366CC")),
            "magenta" => Some(mk("#FF005E", 0.8, "#000")),
            "yellow" => Some(mk("#FF0", 0.8, "#000")),
            "purple" => Some(mk("#732C7B", 0.8, "#000")),
            "steelblue" => Some(mk("#4682B4", 0.8, "#000")),
            "red" => Some(mk("#F00", 0.8, "#000")),
            "lime" => Some(mk("#9CC222", 0.8, "#566B13")),
            _ => None,
        }
    }
}

impl Default for Theme {
    fn default() -> Self {
        Theme {
            area: "#3366CC".to_string(),
            alpha: 0.45,
            stroke: "#3366CC".to_string(),
        }
    }
}

// ---------- viewport --------------------------------------------------------

/// Pixel margins around the plot area. Axes, stacked right-hand scales and
/// the legend are drawn inside them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Margins {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

impl Default for Margins {
    fn default() -> Self {
        Margins {
            top: 30.0,
            right: 30.0,
            bottom: 30.0,
            left: 40.0,
        }
    }
}

/// Outer pixel size plus margins. Every scale range is derived from the
/// inner area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    pub margins: Margins,
}

impl Viewport {
    pub fn new(width: f64, height: f64, margins: Margins) -> Result<Self, ChartError> {
        let v = Viewport {
            width,
            height,
            margins,
        };
        if v.inner_width() <= 0.0 || v.inner_height() <= 0.0 {
            return Err(ChartError::ViewportTooSmall { width, height });
        }
        Ok(v)
    }

    pub fn inner_width(&self) -> f64 {
        self.width - self.margins.left - self.margins.right
    }

    pub fn inner_height(&self) -> f64 {
        self.height - self.margins.top - self.margins.bottom
    }

    /// Tick counts follow the drawable area, one tick per ~75px of width.
    pub fn x_ticks(&self) -> usize {
        (self.inner_width() / 75.0).round().max(1.0) as usize
    }

    /// One tick per ~30px of height.
    pub fn y_ticks(&self) -> usize {
        (self.inner_height() / 30.0).round().max(1.0) as usize
    }
}

// ---------- options ---------------------------------------------------------

/// How a derived series participates: not at all, drawn on the chart, or
/// feeding only the summary panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeriesMode {
    #[default]
    Off,
    Chart,
    Summary,
}

impl SeriesMode {
    pub fn computes(self) -> bool {
        self != SeriesMode::Off
    }

    pub fn charts(self) -> bool {
        self == SeriesMode::Chart
    }

    fn as_str(self) -> &'static str {
        match self {
            SeriesMode::Off => "off",
            SeriesMode::Chart => "chart",
            SeriesMode::Summary => "summary",
        }
    }
}

impl Serialize for SeriesMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// Accepts both booleans and the string forms, so `"altitude": true` and
// `"slope": "summary"` parse alike.
impl<'de> Deserialize<'de> for SeriesMode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ModeVisitor;

        impl serde::de::Visitor<'_> for ModeVisitor {
            type Value = SeriesMode;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a boolean or one of \"off\", \"chart\", \"summary\"")
            }

            fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<SeriesMode, E> {
                Ok(if v { SeriesMode::Chart } else { SeriesMode::Off })
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<SeriesMode, E> {
                match v {
                    "off" => Ok(SeriesMode::Off),
                    "chart" | "on" => Ok(SeriesMode::Chart),
                    "summary" => Ok(SeriesMode::Summary),
                    _ => Err(E::unknown_variant(v, &["off", "chart", "summary"])),
                }
            }
        }

        deserializer.deserialize_any(ModeVisitor)
    }
}

/// Shape of the map-side position indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerMode {
    #[default]
    ElevationLine,
    PositionMarker,
}

/// Everything configurable, JSON-compatible under camelCase keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChartOptions {
    pub width: f64,
    pub height: f64,
    pub margins: Margins,
    pub x_attr: PointField,
    pub y_attr: PointField,
    pub x_label: String,
    pub y_label: String,
    pub slope_label: String,
    pub speed_label: Option<String>,
    pub acceleration_label: Option<String>,
    pub time_label: String,
    pub decimals_x: usize,
    pub decimals_y: usize,
    pub imperial: bool,
    pub force_axis_bounds: bool,
    pub y_axis_min: Option<f64>,
    pub y_axis_max: Option<f64>,
    pub distance: SeriesMode,
    pub altitude: SeriesMode,
    pub slope: SeriesMode,
    pub speed: SeriesMode,
    pub acceleration: SeriesMode,
    pub time: SeriesMode,
    /// Adds a wall-clock row to the tooltip when points carry timestamps.
    pub timestamps: bool,
    pub dragging: bool,
    pub zooming: bool,
    pub ruler: bool,
    pub legend: bool,
    pub theme: String,
    /// Explicit palette, taking precedence over the named theme.
    pub custom_palette: Option<Theme>,
    pub marker: MarkerMode,
    /// Treat incoming samples as `(lng, lat)`.
    pub reverse_coords: bool,
    pub distance_factor: f64,
    pub altitude_factor: f64,
    pub speed_factor: f64,
    pub acceleration_factor: f64,
    pub time_factor: f64,
    pub time_avg_speed: f64,
    pub skip_null_z_coords: bool,
    pub altitude_delta_max: Option<f64>,
    pub altitude_range: Option<(f64, f64)>,
    pub slope_delta_max: Option<f64>,
    pub slope_range: Option<(f64, f64)>,
    pub speed_delta_max: Option<f64>,
    pub speed_range: Option<(f64, f64)>,
    pub acceleration_delta_max: Option<f64>,
    pub acceleration_range: Option<(f64, f64)>,
}

impl Default for ChartOptions {
    fn default() -> Self {
        ChartOptions {
            width: 600.0,
            height: 200.0,
            margins: Margins::default(),
            x_attr: PointField::Dist,
            y_attr: PointField::Z,
            x_label: "km".to_string(),
            y_label: "m".to_string(),
            slope_label: "%".to_string(),
            speed_label: None,
            acceleration_label: None,
            time_label: "t".to_string(),
            decimals_x: 2,
            decimals_y: 0,
            imperial: false,
            force_axis_bounds: false,
            y_axis_min: None,
            y_axis_max: None,
            distance: SeriesMode::Chart,
            altitude: SeriesMode::Chart,
            slope: SeriesMode::Off,
            speed: SeriesMode::Off,
            acceleration: SeriesMode::Off,
            time: SeriesMode::Off,
            timestamps: false,
            dragging: true,
            zooming: true,
            ruler: true,
            legend: true,
            theme: "lightblue-theme".to_string(),
            custom_palette: None,
            marker: MarkerMode::default(),
            reverse_coords: false,
            distance_factor: 1.0,
            altitude_factor: 1.0,
            speed_factor: 1.0,
            acceleration_factor: 1.0,
            time_factor: 3600.0,
            time_avg_speed: 3.6,
            skip_null_z_coords: false,
            altitude_delta_max: None,
            altitude_range: None,
            slope_delta_max: None,
            slope_range: None,
            speed_delta_max: None,
            speed_range: None,
            acceleration_delta_max: None,
            acceleration_range: None,
        }
    }
}

impl ChartOptions {
    pub fn from_json(json: &str) -> Result<Self, ChartError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Resolved theme: the explicit palette when given, else the named
    /// theme; unknown names fall back to lightblue.
    pub fn palette(&self) -> Theme {
        if let Some(custom) = &self.custom_palette {
            return custom.clone();
        }
        Theme::named(&self.theme).unwrap_or_else(|| {
            debug!("unknown theme {:?}, falling back to lightblue", self.theme);
            Theme::default()
        })
    }

    /// Unit factors and clamps for the attribute pipeline. The imperial
    /// switch overrides the distance and altitude factors.
    pub fn pipeline_params(&self) -> PipelineParams {
        let mut params = PipelineParams {
            distance_factor: self.distance_factor,
            altitude_factor: self.altitude_factor,
            speed_factor: self.speed_factor,
            acceleration_factor: self.acceleration_factor,
            time_factor: self.time_factor,
            time_avg_speed: self.time_avg_speed,
            skip_null_z_coords: self.skip_null_z_coords,
            altitude: ClampPolicy {
                delta_max: self.altitude_delta_max,
                range: self.altitude_range,
            },
            slope: ClampPolicy {
                delta_max: self.slope_delta_max,
                range: self.slope_range,
            },
            speed: ClampPolicy {
                delta_max: self.speed_delta_max,
                range: self.speed_range,
            },
            acceleration: ClampPolicy {
                delta_max: self.acceleration_delta_max,
                range: self.acceleration_range,
            },
        };
        if self.imperial {
            params.distance_factor = MILE_FACTOR;
            params.altitude_factor = FOOT_FACTOR;
        }
        params
    }

    pub fn enabled_attributes(&self) -> EnabledAttributes {
        EnabledAttributes {
            slope: self.slope.computes(),
            speed: self.speed.computes(),
            acceleration: self.acceleration.computes(),
        }
    }

    pub fn x_unit(&self) -> String {
        if self.imperial {
            "mi".to_string()
        } else {
            self.x_label.clone()
        }
    }

    pub fn y_unit(&self) -> String {
        if self.imperial {
            "ft".to_string()
        } else {
            self.y_label.clone()
        }
    }

    pub fn speed_unit(&self) -> String {
        self.speed_label
            .clone()
            .unwrap_or_else(|| if self.imperial { "mph" } else { "km/h" }.to_string())
    }

    pub fn acceleration_unit(&self) -> String {
        self.acceleration_label
            .clone()
            .unwrap_or_else(|| if self.imperial { "ft/s" } else { "m/s" }.to_string())
    }
}

// ---------- events ----------------------------------------------------------

/// Phase of a zoom gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoomPhase {
    Start,
    Zoom,
    End,
}

/// Intent events the chart emits instead of acting on a DOM or map itself.
/// Serialized with a `type` tag so they cross a JS boundary as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChartEvent {
    EledataUpdated {
        index: usize,
    },
    ElechartUpdated,
    MouseEnter,
    MouseMove {
        index: usize,
        x_coord: f64,
    },
    MouseOut,
    /// Brush selection finished; latlng of the first and last selected point.
    Dragged {
        dragstart: (f64, f64),
        dragend: (f64, f64),
    },
    /// Ruler moved; latlng runs at or above the ruler elevation.
    RulerFilter {
        coords: Vec<Vec<(f64, f64)>>,
    },
    Zoom {
        phase: ZoomPhase,
        scale: f64,
        identity: bool,
    },
    ElepathToggle {
        name: String,
        enabled: bool,
    },
    MarginsUpdated {
        margins: Margins,
    },
}

/// Push-style consumer of chart events; the seam the embedding layer
/// implements to drive a map or DOM.
pub trait EventSink {
    fn on_event(&mut self, event: &ChartEvent);
}

// ---------- scales ----------------------------------------------------------

/// Linear data-to-pixel mapping with inversion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearScale {
    pub domain: (f64, f64),
    pub range: (f64, f64),
}

impl LinearScale {
    pub fn new(domain: (f64, f64), range: (f64, f64)) -> Self {
        LinearScale { domain, range }
    }

    pub fn scale(&self, value: f64) -> f64 {
        let span = (self.domain.1 - self.domain.0).max(1e-9);
        let t = (value - self.domain.0) / span;
        self.range.0 + t * (self.range.1 - self.range.0)
    }

    pub fn invert(&self, px: f64) -> f64 {
        let span = self.range.1 - self.range.0;
        if span.abs() < f64::EPSILON {
            return self.domain.0;
        }
        let t = (px - self.range.0) / span;
        self.domain.0 + t * (self.domain.1 - self.domain.0)
    }

    /// Evenly spaced tick values across the domain, endpoints included.
    pub fn ticks(&self, count: usize) -> Vec<f64> {
        let count = count.max(1);
        let step = (self.domain.1 - self.domain.0) / count as f64;
        (0..=count).map(|i| self.domain.0 + step * i as f64).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisPosition {
    Bottom,
    Top,
    Left,
    Right,
}

/// Declarative scale registration: which attribute drives the domain, where
/// the axis sits and how configured bounds override the data extent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleSpec {
    pub name: String,
    pub axis: Axis,
    pub position: AxisPosition,
    pub attr: PointField,
    pub label: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub force_bounds: bool,
    /// Whether the axis is drawn; the scale itself is always computed.
    pub visible: bool,
}

impl ScaleSpec {
    /// Data domain: the attribute extent, widened or overridden by the
    /// configured bounds. An empty track falls back to `[0, 1]`.
    pub fn domain(&self, track: &Track) -> (f64, f64) {
        let (mut lo, mut hi) = track.extent(self.attr).unwrap_or((0.0, 1.0));
        if let Some(min) = self.min {
            if min < lo || self.force_bounds {
                lo = min;
            }
        }
        if let Some(max) = self.max {
            if max > hi || self.force_bounds {
                hi = max;
            }
        }
        (lo, hi)
    }

    /// Pixel range; y runs downward so larger values sit higher.
    pub fn range(&self, viewport: &Viewport) -> (f64, f64) {
        match self.axis {
            Axis::X => (0.0, viewport.inner_width()),
            Axis::Y => (viewport.inner_height(), 0.0),
        }
    }
}

/// One-dimensional zoom transform `(k, tx)` applied to the x scales.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoomTransform {
    pub k: f64,
    pub x: f64,
}

impl ZoomTransform {
    pub const IDENTITY: ZoomTransform = ZoomTransform { k: 1.0, x: 0.0 };

    pub fn is_identity(&self) -> bool {
        (self.k - 1.0).abs() < 1e-9 && self.x.abs() < 1e-9
    }

    /// Pixel coordinate pulled back through the transform.
    pub fn invert_x(&self, px: f64) -> f64 {
        (px - self.x) / self.k
    }

    /// New scale with the same range and the domain seen through the
    /// inverted transform.
    pub fn rescale_x(&self, base: &LinearScale) -> LinearScale {
        let d0 = base.invert(self.invert_x(base.range.0));
        let d1 = base.invert(self.invert_x(base.range.1));
        LinearScale::new((d0, d1), base.range)
    }
}

impl Default for ZoomTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Owns every registered scale. While the zooming flag is held the
/// data-driven domain recompute is suppressed, so a live transform is never
/// clobbered by data updates.
#[derive(Debug, Default)]
pub struct ScaleManager {
    specs: Vec<ScaleSpec>,
    scales: HashMap<String, LinearScale>,
    zooming: bool,
}

impl ScaleManager {
    pub fn register(&mut self, spec: ScaleSpec) {
        if let Some(existing) = self.specs.iter_mut().find(|s| s.name == spec.name) {
            *existing = spec;
        } else {
            self.specs.push(spec);
        }
    }

    pub fn specs(&self) -> &[ScaleSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&LinearScale> {
        self.scales.get(name)
    }

    pub fn set(&mut self, name: &str, scale: LinearScale) {
        self.scales.insert(name.to_string(), scale);
    }

    pub fn zooming(&self) -> bool {
        self.zooming
    }

    pub fn set_zooming(&mut self, zooming: bool) {
        self.zooming = zooming;
    }

    /// Recompute every scale from the track extent. A no-op while zooming.
    pub fn update_scales(&mut self, track: &Track, viewport: &Viewport) {
        if self.zooming {
            return;
        }
        for spec in &self.specs {
            let scale = LinearScale::new(spec.domain(track), spec.range(viewport));
            self.scales.insert(spec.name.clone(), scale);
        }
    }

    /// Horizontal offset of a right-hand axis, stacked outward in
    /// registration order.
    fn right_axis_offset(&self, name: &str) -> f64 {
        let mut slot = 0;
        for spec in &self.specs {
            if spec.axis == Axis::Y && spec.position == AxisPosition::Right && spec.visible {
                if spec.name == name {
                    return slot as f64 * RIGHT_AXIS_STEP;
                }
                slot += 1;
            }
        }
        0.0
    }

    fn visible_right_axes(&self) -> usize {
        self.specs
            .iter()
            .filter(|s| s.axis == Axis::Y && s.position == AxisPosition::Right && s.visible)
            .count()
    }
}

// ---------- lookup ----------------------------------------------------------

/// First index whose attribute is at or past the inverted pixel coordinate.
/// Returns 0 on an empty track so stray gestures stay harmless.
pub fn index_for_x_coord(
    track: &Track,
    scale: &LinearScale,
    attr: PointField,
    x_coord: f64,
) -> usize {
    if track.is_empty() {
        return 0;
    }
    let target = scale.invert(x_coord);
    let points = track.as_slice();
    let mut left = 0usize;
    let mut right = points.len();
    while left < right {
        let mid = left + (right - left) / 2;
        let v = attr.value(&points[mid]).unwrap_or(f64::NEG_INFINITY);
        if v < target {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left.min(points.len() - 1)
}

/// Index of the point geodesically closest to the given location.
pub fn index_for_latlng(track: &Track, lat: f64, lng: f64) -> Option<usize> {
    let probe = TrackPoint::new(lat, lng, None, None);
    track
        .iter()
        .enumerate()
        .map(|(i, p)| (i, p.distance_to(&probe)))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

/// Latlng runs of consecutive points whose elevation is at or above the
/// elevation the pixel row maps to. Each contiguous run becomes one segment.
pub fn coords_above_y(track: &Track, scale: &LinearScale, y_coord: f64) -> Vec<Vec<(f64, f64)>> {
    let threshold = scale.invert(y_coord);
    let mut segments: Vec<Vec<(f64, f64)>> = Vec::new();
    let mut prev: Option<usize> = None;
    for (i, p) in track.iter().enumerate() {
        let z = match p.z {
            Some(z) => z,
            None => continue,
        };
        if z < threshold {
            continue;
        }
        let latlng = (p.lat, p.lng);
        if prev.map_or(false, |j| j + 1 == i) {
            if let Some(run) = segments.last_mut() {
                run.push(latlng);
            }
        } else {
            segments.push(vec![latlng]);
        }
        prev = Some(i);
    }
    segments
}

// ---------- series registrations --------------------------------------------

/// One filled series drawn on the chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaSpec {
    pub name: String,
    pub label: String,
    pub y_attr: PointField,
    pub scale_x: String,
    pub scale_y: String,
    pub color: String,
    pub stroke: String,
    pub stroke_opacity: f32,
    pub fill_opacity: f32,
    /// Registered for drawing at all; summary-only series are not.
    pub visible: bool,
    /// Toggled from the legend.
    pub hidden: bool,
}

/// Content of one tooltip row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TooltipKind {
    XAttr,
    YAttr,
    Date,
    Duration,
    Slope,
    Speed,
    Acceleration,
}

/// One row of the hover tooltip; rows render sorted by `order`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TooltipSpec {
    pub name: String,
    pub kind: TooltipKind,
    pub order: u32,
}

// ---------- summary panel ---------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryFormat {
    /// Two decimals plus unit.
    Fixed,
    /// Rounded to a whole number plus unit.
    Rounded,
    /// `HH:MM'SS"` elapsed time.
    Duration,
}

/// One line of the summary panel, reading a named stat from the running
/// summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryItem {
    pub name: String,
    pub label: String,
    pub stat: String,
    pub unit: String,
    pub order: u32,
    pub format: SummaryFormat,
}

impl SummaryItem {
    fn render(&self, summary: &RunningSummary) -> String {
        let v = summary.value_or(&self.stat, 0.0);
        match self.format {
            SummaryFormat::Fixed => format!("{} {}", format_fixed(v, 2), self.unit),
            SummaryFormat::Rounded => format!("{} {}", v.round() as i64, self.unit),
            SummaryFormat::Duration => format_time(v as i64),
        }
    }
}

/// A rendered summary line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub name: String,
    pub label: String,
    pub value: String,
}

/// Stateless rebuild of the panel rows, sorted by display order. Repairs
/// and re-ingests are reflected simply because nothing is cached.
pub fn summary_rows(items: &[SummaryItem], summary: &RunningSummary) -> Vec<SummaryRow> {
    let mut sorted: Vec<&SummaryItem> = items.iter().collect();
    sorted.sort_by_key(|item| item.order);
    sorted
        .iter()
        .map(|item| SummaryRow {
            name: item.name.clone(),
            label: item.label.clone(),
            value: item.render(summary),
        })
        .collect()
}

fn default_summary_items(options: &ChartOptions) -> Vec<SummaryItem> {
    let item = |name: &str, label: &str, stat: &str, unit: String, order, format| SummaryItem {
        name: name.to_string(),
        label: label.to_string(),
        stat: stat.to_string(),
        unit,
        order,
        format,
    };
    let mut items = vec![
        item(
            "totlen",
            "Total Length: ",
            "distance",
            options.x_unit(),
            10,
            SummaryFormat::Fixed,
        ),
        item(
            "maxele",
            "Max Elevation: ",
            "elevation_max",
            options.y_unit(),
            30,
            SummaryFormat::Fixed,
        ),
        item(
            "minele",
            "Min Elevation: ",
            "elevation_min",
            options.y_unit(),
            30,
            SummaryFormat::Fixed,
        ),
        item(
            "avgele",
            "Avg Elevation: ",
            "elevation_avg",
            options.y_unit(),
            30,
            SummaryFormat::Fixed,
        ),
    ];
    if options.time.computes() {
        items.push(item(
            "tottime",
            "Total Time: ",
            "time",
            String::new(),
            20,
            SummaryFormat::Duration,
        ));
    }
    if options.slope.computes() {
        items.push(item(
            "ascent",
            "Total Ascent: ",
            "ascent",
            options.y_unit(),
            40,
            SummaryFormat::Rounded,
        ));
        items.push(item(
            "descent",
            "Total Descent: ",
            "descent",
            options.y_unit(),
            40,
            SummaryFormat::Rounded,
        ));
        items.push(item(
            "minslope",
            "Min Slope: ",
            "slope_min",
            options.slope_label.clone(),
            40,
            SummaryFormat::Rounded,
        ));
        items.push(item(
            "maxslope",
            "Max Slope: ",
            "slope_max",
            options.slope_label.clone(),
            40,
            SummaryFormat::Rounded,
        ));
        items.push(item(
            "avgslope",
            "Avg Slope: ",
            "slope_avg",
            options.slope_label.clone(),
            40,
            SummaryFormat::Rounded,
        ));
    }
    if options.speed.computes() {
        items.push(item(
            "minspeed",
            "Min Speed: ",
            "speed_min",
            options.speed_unit(),
            50,
            SummaryFormat::Rounded,
        ));
        items.push(item(
            "maxspeed",
            "Max Speed: ",
            "speed_max",
            options.speed_unit(),
            50,
            SummaryFormat::Rounded,
        ));
        items.push(item(
            "avgspeed",
            "Avg Speed: ",
            "speed_avg",
            options.speed_unit(),
            50,
            SummaryFormat::Rounded,
        ));
    }
    if options.acceleration.computes() {
        items.push(item(
            "minacceleration",
            "Min Acceleration: ",
            "acceleration_min",
            options.acceleration_unit(),
            60,
            SummaryFormat::Rounded,
        ));
        items.push(item(
            "maxacceleration",
            "Max Acceleration: ",
            "acceleration_max",
            options.acceleration_unit(),
            60,
            SummaryFormat::Rounded,
        ));
        items.push(item(
            "avgacceleration",
            "Avg Acceleration: ",
            "acceleration_avg",
            options.acceleration_unit(),
            60,
            SummaryFormat::Rounded,
        ));
    }
    items
}

// ---------- renderer backends -----------------------------------------------

/// Horizontal anchoring of a text run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAnchor {
    Start,
    Middle,
    End,
}

/// Drawing surface seam. Every backend receives the same geometry in the
/// same order; what it does with it is its own business. An empty color
/// string means no paint.
pub trait RendererBackend {
    fn begin_frame(&mut self, width: f64, height: f64);
    fn draw_area(
        &mut self,
        points: &[(f64, f64)],
        baseline: f64,
        fill: &str,
        fill_opacity: f32,
        stroke: &str,
        stroke_opacity: f32,
    );
    fn draw_segments(&mut self, segments: &[(f64, f64, f64, f64)], color: &str, width: f32);
    #[allow(clippy::too_many_arguments)]
    fn draw_rect(
        &mut self,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        fill: &str,
        fill_opacity: f32,
        stroke: &str,
        stroke_opacity: f32,
    );
    fn draw_circle(&mut self, x: f64, y: f64, radius: f64, fill: &str);
    fn draw_text(&mut self, x: f64, y: f64, text: &str, anchor: TextAnchor, color: &str);
    /// Bounding box of a text run, if the backend can measure text. Layout
    /// that needs a measurement is skipped when it cannot.
    fn measure_text(&self, text: &str) -> Option<(f64, f64)>;
}

fn path_round(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// SVG path data for a filled area: the sample polyline closed down to the
/// baseline.
pub fn area_path_d(points: &[(f64, f64)], baseline: f64) -> String {
    if points.is_empty() {
        return String::new();
    }
    let mut d = String::new();
    for (i, (x, y)) in points.iter().enumerate() {
        let cmd = if i == 0 { 'M' } else { 'L' };
        let _ = write!(d, "{}{},{}", cmd, path_round(*x), path_round(*y));
    }
    let first = points[0].0;
    let last = points[points.len() - 1].0;
    let _ = write!(
        d,
        "L{},{}L{},{}Z",
        path_round(last),
        path_round(baseline),
        path_round(first),
        path_round(baseline)
    );
    d
}

fn segments_path_d(segments: &[(f64, f64, f64, f64)]) -> String {
    let mut d = String::new();
    for (x1, y1, x2, y2) in segments {
        let _ = write!(
            d,
            "M{},{}L{},{}",
            path_round(*x1),
            path_round(*y1),
            path_round(*x2),
            path_round(*y2)
        );
    }
    d
}

fn paint(color: &str) -> &str {
    if color.is_empty() {
        "none"
    } else {
        color
    }
}

/// One SVG element produced by [`SvgBackend`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum SvgNode {
    Path {
        d: String,
        fill: String,
        fill_opacity: f32,
        stroke: String,
        stroke_opacity: f32,
        stroke_width: f32,
    },
    Rect {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        fill: String,
        fill_opacity: f32,
        stroke: String,
        stroke_opacity: f32,
    },
    Circle {
        cx: f64,
        cy: f64,
        r: f64,
        fill: String,
    },
    Text {
        x: f64,
        y: f64,
        text: String,
        anchor: TextAnchor,
        fill: String,
    },
}

const SVG_CHAR_WIDTH: f64 = 7.0;
const SVG_LINE_HEIGHT: f64 = 14.0;

/// Backend producing an SVG fragment. Font metrics are estimated, which is
/// enough for tooltip layout without a DOM.
#[derive(Debug, Default)]
pub struct SvgBackend {
    width: f64,
    height: f64,
    nodes: Vec<SvgNode>,
}

impl SvgBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[SvgNode] {
        &self.nodes
    }

    /// Serialize the recorded frame as a standalone `<svg>` element.
    pub fn to_svg(&self) -> String {
        let mut out = format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{}\" height=\"{}\">",
            self.width, self.height
        );
        for node in &self.nodes {
            match node {
                SvgNode::Path {
                    d,
                    fill,
                    fill_opacity,
                    stroke,
                    stroke_opacity,
                    stroke_width,
                } => {
                    let _ = write!(
                        out,
                        "<path d=\"{}\" fill=\"{}\" fill-opacity=\"{}\" stroke=\"{}\" stroke-opacity=\"{}\" stroke-width=\"{}\"/>",
                        d, paint(fill), fill_opacity, paint(stroke), stroke_opacity, stroke_width
                    );
                }
                SvgNode::Rect {
                    x,
                    y,
                    width,
                    height,
                    fill,
                    fill_opacity,
                    stroke,
                    stroke_opacity,
                } => {
                    let _ = write!(
                        out,
                        "<rect x=\"{}\" y=\"{}\" width=\"{}\" height=\"{}\" fill=\"{}\" fill-opacity=\"{}\" stroke=\"{}\" stroke-opacity=\"{}\"/>",
                        x, y, width, height, paint(fill), fill_opacity, paint(stroke), stroke_opacity
                    );
                }
                SvgNode::Circle { cx, cy, r, fill } => {
                    let _ = write!(
                        out,
                        "<circle cx=\"{}\" cy=\"{}\" r=\"{}\" fill=\"{}\"/>",
                        cx,
                        cy,
                        r,
                        paint(fill)
                    );
                }
                SvgNode::Text {
                    x,
                    y,
                    text,
                    anchor,
                    fill,
                } => {
                    let anchor = match anchor {
                        TextAnchor::Start => "start",
                        TextAnchor::Middle => "middle",
                        TextAnchor::End => "end",
                    };
                    let _ = write!(
                        out,
                        "<text x=\"{}\" y=\"{}\" text-anchor=\"{}\" fill=\"{}\">{}</text>",
                        x,
                        y,
                        anchor,
                        paint(fill),
                        text
                    );
                }
            }
        }
        out.push_str("</svg>");
        out
    }
}

impl RendererBackend for SvgBackend {
    fn begin_frame(&mut self, width: f64, height: f64) {
        self.width = width;
        self.height = height;
        self.nodes.clear();
    }

    fn draw_area(
        &mut self,
        points: &[(f64, f64)],
        baseline: f64,
        fill: &str,
        fill_opacity: f32,
        stroke: &str,
        stroke_opacity: f32,
    ) {
        self.nodes.push(SvgNode::Path {
            d: area_path_d(points, baseline),
            fill: fill.to_string(),
            fill_opacity,
            stroke: stroke.to_string(),
            stroke_opacity,
            stroke_width: 1.0,
        });
    }

    fn draw_segments(&mut self, segments: &[(f64, f64, f64, f64)], color: &str, width: f32) {
        self.nodes.push(SvgNode::Path {
            d: segments_path_d(segments),
            fill: String::new(),
            fill_opacity: 0.0,
            stroke: color.to_string(),
            stroke_opacity: 1.0,
            stroke_width: width,
        });
    }

    fn draw_rect(
        &mut self,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        fill: &str,
        fill_opacity: f32,
        stroke: &str,
        stroke_opacity: f32,
    ) {
        self.nodes.push(SvgNode::Rect {
            x,
            y,
            width,
            height,
            fill: fill.to_string(),
            fill_opacity,
            stroke: stroke.to_string(),
            stroke_opacity,
        });
    }

    fn draw_circle(&mut self, x: f64, y: f64, radius: f64, fill: &str) {
        self.nodes.push(SvgNode::Circle {
            cx: x,
            cy: y,
            r: radius,
            fill: fill.to_string(),
        });
    }

    fn draw_text(&mut self, x: f64, y: f64, text: &str, anchor: TextAnchor, color: &str) {
        self.nodes.push(SvgNode::Text {
            x,
            y,
            text: text.to_string(),
            anchor,
            fill: color.to_string(),
        });
    }

    fn measure_text(&self, text: &str) -> Option<(f64, f64)> {
        Some((text.chars().count() as f64 * SVG_CHAR_WIDTH, SVG_LINE_HEIGHT))
    }
}

/// Flat draw command, the canvas-style rendition of a frame. Commands
/// serialize cleanly, so a frame can cross a process or wire boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DrawCommand {
    BeginFrame {
        width: f64,
        height: f64,
    },
    Area {
        points: Vec<(f64, f64)>,
        baseline: f64,
        fill: String,
        fill_opacity: f32,
        stroke: String,
        stroke_opacity: f32,
    },
    Segments {
        segments: Vec<(f64, f64, f64, f64)>,
        color: String,
        width: f32,
    },
    Rect {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        fill: String,
        fill_opacity: f32,
        stroke: String,
        stroke_opacity: f32,
    },
    Circle {
        x: f64,
        y: f64,
        radius: f64,
        fill: String,
    },
    Text {
        x: f64,
        y: f64,
        text: String,
        anchor: TextAnchor,
        color: String,
    },
}

/// Backend recording draw commands verbatim. It reports no font metrics,
/// so measured layout (the tooltip) is skipped; a consumer with real
/// metrics can lay its own tooltip over the frame.
#[derive(Debug, Default)]
pub struct CommandBackend {
    commands: Vec<DrawCommand>,
}

impl CommandBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<DrawCommand> {
        std::mem::take(&mut self.commands)
    }
}

impl RendererBackend for CommandBackend {
    fn begin_frame(&mut self, width: f64, height: f64) {
        self.commands.clear();
        self.commands.push(DrawCommand::BeginFrame { width, height });
    }

    fn draw_area(
        &mut self,
        points: &[(f64, f64)],
        baseline: f64,
        fill: &str,
        fill_opacity: f32,
        stroke: &str,
        stroke_opacity: f32,
    ) {
        self.commands.push(DrawCommand::Area {
            points: points.to_vec(),
            baseline,
            fill: fill.to_string(),
            fill_opacity,
            stroke: stroke.to_string(),
            stroke_opacity,
        });
    }

    fn draw_segments(&mut self, segments: &[(f64, f64, f64, f64)], color: &str, width: f32) {
        self.commands.push(DrawCommand::Segments {
            segments: segments.to_vec(),
            color: color.to_string(),
            width,
        });
    }

    fn draw_rect(
        &mut self,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        fill: &str,
        fill_opacity: f32,
        stroke: &str,
        stroke_opacity: f32,
    ) {
        self.commands.push(DrawCommand::Rect {
            x,
            y,
            width,
            height,
            fill: fill.to_string(),
            fill_opacity,
            stroke: stroke.to_string(),
            stroke_opacity,
        });
    }

    fn draw_circle(&mut self, x: f64, y: f64, radius: f64, fill: &str) {
        self.commands.push(DrawCommand::Circle {
            x,
            y,
            radius,
            fill: fill.to_string(),
        });
    }

    fn draw_text(&mut self, x: f64, y: f64, text: &str, anchor: TextAnchor, color: &str) {
        self.commands.push(DrawCommand::Text {
            x,
            y,
            text: text.to_string(),
            anchor,
            color: color.to_string(),
        });
    }

    fn measure_text(&self, _text: &str) -> Option<(f64, f64)> {
        None
    }
}

// ---------- chart -----------------------------------------------------------

/// Symmetric legend slots around the centre, in units of the legend step:
/// `[0]`, `[-1, 1]`, `[-2, 0, 2]` and so on.
fn legend_offsets(n: usize) -> Vec<f64> {
    let half = n / 2;
    let odd = n % 2 == 1;
    let positive: Vec<i64> = (0..half)
        .map(|i| (i as i64 + 1) * 2 - i64::from(!odd))
        .collect();
    let mut slots: Vec<i64> = positive.iter().rev().map(|v| -v).collect();
    if odd {
        slots.push(0);
    }
    slots.extend(&positive);
    slots.into_iter().map(|v| v as f64).collect()
}

/// Trims a trailing `.0`, so whole numbers print bare.
fn display_num(v: f64) -> String {
    if (v - v.round()).abs() < 1e-9 {
        format!("{}", v.round() as i64)
    } else {
        let s = format!("{:.2}", v);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Tick label for an x axis: durations as wall-clock `HH:MM:SS` with the
/// zero tick suppressed, plain numbers otherwise.
fn x_tick_label(attr: PointField, t: f64) -> Option<String> {
    if attr == PointField::Duration {
        if t == 0.0 {
            return None;
        }
        return Some(format_clock(t as i64));
    }
    Some(display_num(t))
}

/// Map-side indicator geometry, in the map pane's pixel space.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerGeometry {
    pub point: (f64, f64),
    pub radius: f64,
    /// Upward elevation stem, present in elevation-line mode.
    pub line_to: Option<(f64, f64)>,
    /// Attribute labels, first line closest to the point.
    pub labels: Vec<String>,
}

/// The chart proper: scales, registrations, gesture state and rendering.
/// All gesture coordinates are in plot space, origin at the inner top-left
/// corner.
pub struct Chart {
    options: ChartOptions,
    viewport: Viewport,
    scales: ScaleManager,
    areas: Vec<AreaSpec>,
    tooltips: Vec<TooltipSpec>,
    zoom: ZoomTransform,
    is_dragging: bool,
    drag_start_x: Option<f64>,
    drag_selection: Option<(f64, f64)>,
    last_pointer_y: f64,
    hover_index: Option<usize>,
    ruler_y: f64,
    ruler_label: Option<String>,
    chart_enabled: bool,
    dirty: bool,
    events: Vec<ChartEvent>,
}

impl Chart {
    pub fn new(options: ChartOptions) -> Result<Self, ChartError> {
        let mut options = options;
        if options.legend {
            options.margins.bottom += LEGEND_MARGIN;
        }
        let viewport = Viewport::new(options.width, options.height, options.margins)?;
        let palette = options.palette();
        palette.area.parse::<Rgba>()?;
        palette.stroke.parse::<Rgba>()?;
        let mut chart = Chart {
            options,
            viewport,
            scales: ScaleManager::default(),
            areas: Vec::new(),
            tooltips: Vec::new(),
            zoom: ZoomTransform::IDENTITY,
            is_dragging: false,
            drag_start_x: None,
            drag_selection: None,
            last_pointer_y: 0.0,
            hover_index: None,
            ruler_y: viewport.inner_height(),
            ruler_label: None,
            chart_enabled: false,
            dirty: true,
            events: Vec::new(),
        };
        chart.register_defaults();
        chart.chart_enabled = chart.areas.iter().any(|a| a.visible && !a.hidden);
        Ok(chart)
    }

    fn register_defaults(&mut self) {
        let o = self.options.clone();
        let theme = o.palette();

        self.scales.register(ScaleSpec {
            name: "distance".to_string(),
            axis: Axis::X,
            position: AxisPosition::Bottom,
            attr: o.x_attr,
            label: o.x_unit(),
            min: None,
            max: None,
            force_bounds: false,
            visible: o.distance.charts(),
        });
        if o.time.charts() {
            self.scales.register(ScaleSpec {
                name: "time".to_string(),
                axis: Axis::X,
                position: AxisPosition::Top,
                attr: PointField::Duration,
                label: o.time_label.clone(),
                min: Some(0.0),
                max: None,
                force_bounds: false,
                visible: true,
            });
        }
        self.scales.register(ScaleSpec {
            name: "altitude".to_string(),
            axis: Axis::Y,
            position: AxisPosition::Left,
            attr: o.y_attr,
            label: o.y_unit(),
            min: o.y_axis_min,
            max: o.y_axis_max,
            force_bounds: o.force_axis_bounds,
            visible: o.altitude.charts(),
        });
        if o.slope.charts() {
            // domain widened to at least [-1, 1] so the zero line shows
            self.scales.register(ScaleSpec {
                name: "slope".to_string(),
                axis: Axis::Y,
                position: AxisPosition::Right,
                attr: PointField::Slope,
                label: o.slope_label.clone(),
                min: Some(-1.0),
                max: Some(1.0),
                force_bounds: false,
                visible: true,
            });
        }
        if o.speed.charts() {
            self.scales.register(ScaleSpec {
                name: "speed".to_string(),
                axis: Axis::Y,
                position: AxisPosition::Right,
                attr: PointField::Speed,
                label: o.speed_unit(),
                min: Some(0.0),
                max: Some(1.0),
                force_bounds: false,
                visible: true,
            });
        }
        if o.acceleration.charts() {
            self.scales.register(ScaleSpec {
                name: "acceleration".to_string(),
                axis: Axis::Y,
                position: AxisPosition::Right,
                attr: PointField::Acceleration,
                label: o.acceleration_unit(),
                min: Some(0.0),
                max: Some(1.0),
                force_bounds: false,
                visible: true,
            });
        }

        if o.altitude.charts() {
            self.areas.push(AreaSpec {
                name: "altitude".to_string(),
                label: "Altitude".to_string(),
                y_attr: o.y_attr,
                scale_x: "distance".to_string(),
                scale_y: "altitude".to_string(),
                color: theme.area.clone(),
                stroke: theme.stroke.clone(),
                stroke_opacity: 1.0,
                fill_opacity: theme.alpha,
                visible: true,
                hidden: false,
            });
        }
        if o.slope.charts() {
            self.areas.push(AreaSpec {
                name: "slope".to_string(),
                label: "Slope".to_string(),
                y_attr: PointField::Slope,
                scale_x: "distance".to_string(),
                scale_y: "slope".to_string(),
                color: "#F00".to_string(),
                stroke: "#000".to_string(),
                stroke_opacity: 0.5,
                fill_opacity: 0.25,
                visible: true,
                hidden: false,
            });
        }
        if o.speed.charts() {
            self.areas.push(AreaSpec {
                name: "speed".to_string(),
                label: "Speed".to_string(),
                y_attr: PointField::Speed,
                scale_x: "distance".to_string(),
                scale_y: "speed".to_string(),
                color: "#03ffff".to_string(),
                stroke: "#000".to_string(),
                stroke_opacity: 0.5,
                fill_opacity: 0.25,
                visible: true,
                hidden: false,
            });
        }
        if o.acceleration.charts() {
            self.areas.push(AreaSpec {
                name: "acceleration".to_string(),
                label: "Acceleration".to_string(),
                y_attr: PointField::Acceleration,
                scale_x: "distance".to_string(),
                scale_y: "acceleration".to_string(),
                color: "#050402".to_string(),
                stroke: "#000".to_string(),
                stroke_opacity: 0.5,
                fill_opacity: 0.25,
                visible: true,
                hidden: false,
            });
        }

        self.tooltips.push(TooltipSpec {
            name: "y".to_string(),
            kind: TooltipKind::YAttr,
            order: 10,
        });
        self.tooltips.push(TooltipSpec {
            name: "x".to_string(),
            kind: TooltipKind::XAttr,
            order: 20,
        });
        if o.timestamps {
            self.tooltips.push(TooltipSpec {
                name: "date".to_string(),
                kind: TooltipKind::Date,
                order: 20,
            });
        }
        if o.time.computes() {
            self.tooltips.push(TooltipSpec {
                name: "time".to_string(),
                kind: TooltipKind::Duration,
                order: 20,
            });
        }
        if o.slope.computes() {
            self.tooltips.push(TooltipSpec {
                name: "slope".to_string(),
                kind: TooltipKind::Slope,
                order: 40,
            });
        }
        if o.speed.computes() {
            self.tooltips.push(TooltipSpec {
                name: "speed".to_string(),
                kind: TooltipKind::Speed,
                order: 50,
            });
        }
        if o.acceleration.computes() {
            self.tooltips.push(TooltipSpec {
                name: "acceleration".to_string(),
                kind: TooltipKind::Acceleration,
                order: 60,
            });
        }
        self.tooltips.sort_by_key(|t| t.order);
    }

    // --- accessors -----------------------------------------------------------

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn scales(&self) -> &ScaleManager {
        &self.scales
    }

    pub fn areas(&self) -> &[AreaSpec] {
        &self.areas
    }

    pub fn zoom(&self) -> ZoomTransform {
        self.zoom
    }

    pub fn hover_index(&self) -> Option<usize> {
        self.hover_index
    }

    pub fn chart_enabled(&self) -> bool {
        self.chart_enabled
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn take_events(&mut self) -> Vec<ChartEvent> {
        std::mem::take(&mut self.events)
    }

    fn push_event(&mut self, event: ChartEvent) {
        self.events.push(event);
    }

    fn x_scale(&self) -> LinearScale {
        match self.scales.get("distance") {
            Some(s) => *s,
            None => LinearScale::new((0.0, 1.0), (0.0, self.viewport.inner_width())),
        }
    }

    // --- scale upkeep --------------------------------------------------------

    pub fn update_scales(&mut self, track: &Track) {
        self.scales.update_scales(track, &self.viewport);
        self.dirty = true;
    }

    pub fn resize(&mut self, width: f64, height: f64, track: &Track) -> Result<(), ChartError> {
        self.viewport = Viewport::new(width, height, self.viewport.margins)?;
        self.options.width = width;
        self.options.height = height;
        self.ruler_y = self.ruler_y.min(self.viewport.inner_height());
        self.update_scales(track);
        Ok(())
    }

    /// Back to a blank view: no hover, no selection, identity zoom, ruler
    /// parked. Registrations and options stay.
    pub fn reset_view(&mut self, track: &Track) {
        self.hover_index = None;
        self.is_dragging = false;
        self.drag_start_x = None;
        self.drag_selection = None;
        self.zoom = ZoomTransform::IDENTITY;
        self.scales.set_zooming(false);
        self.ruler_y = self.viewport.inner_height();
        self.ruler_label = None;
        self.update_scales(track);
    }

    // --- interaction ---------------------------------------------------------

    pub fn on_mouse_enter(&mut self, track: &Track) {
        if track.is_empty() {
            return;
        }
        self.push_event(ChartEvent::MouseEnter);
    }

    pub fn on_mouse_down(&mut self, x: f64, y: f64, shift: bool, track: &Track) {
        if track.is_empty() {
            return;
        }
        self.last_pointer_y = y;
        // shift is reserved for the zoom gesture
        if !self.options.dragging || shift {
            return;
        }
        self.is_dragging = true;
        self.drag_start_x = Some(x);
        self.drag_selection = None;
    }

    pub fn on_mouse_move(&mut self, x: f64, y: f64, track: &Track) {
        if track.is_empty() {
            return;
        }
        self.last_pointer_y = y;
        if self.is_dragging {
            if let Some(start) = self.drag_start_x {
                let (x0, x1) = if x < start { (x, start) } else { (start, x) };
                self.drag_selection = Some((x0, x1));
                self.dirty = true;
            }
        }
        if !self.chart_enabled {
            return;
        }
        let scale = self.x_scale();
        let index = index_for_x_coord(track, &scale, self.options.x_attr, x);
        self.hover_index = Some(index);
        self.dirty = true;
        self.push_event(ChartEvent::MouseMove { index, x_coord: x });
    }

    pub fn on_mouse_up(&mut self, track: &Track) {
        if !self.is_dragging {
            return;
        }
        self.is_dragging = false;
        self.drag_start_x = None;
        let selection = self.drag_selection.take();
        self.dirty = true;
        let (x0, x1) = match selection {
            Some(s) if s.1 - s.0 > 1.0 => s,
            _ => return,
        };
        if track.is_empty() {
            return;
        }
        let scale = self.x_scale();
        let i0 = index_for_x_coord(track, &scale, self.options.x_attr, x0);
        let i1 = index_for_x_coord(track, &scale, self.options.x_attr, x1);
        if let (Some(p0), Some(p1)) = (track.get(i0), track.get(i1)) {
            self.push_event(ChartEvent::Dragged {
                dragstart: (p0.lat, p0.lng),
                dragend: (p1.lat, p1.lng),
            });
        }
    }

    pub fn on_mouse_out(&mut self) {
        self.hover_index = None;
        self.dirty = true;
        self.push_event(ChartEvent::MouseOut);
    }

    /// Hover driven from the map side: highlight the sample nearest the
    /// location.
    pub fn on_map_mouse_move(&mut self, lat: f64, lng: f64, track: &Track) {
        if !self.chart_enabled || track.is_empty() {
            return;
        }
        let index = match index_for_latlng(track, lat, lng) {
            Some(i) => i,
            None => return,
        };
        let point = match track.get(index) {
            Some(p) => p,
            None => return,
        };
        let x_coord = match point.x_diag_coord {
            Some(x) => x,
            None => self
                .x_scale()
                .scale(self.options.x_attr.value(point).unwrap_or(0.0)),
        };
        self.hover_index = Some(index);
        self.dirty = true;
        self.push_event(ChartEvent::MouseMove { index, x_coord });
    }

    /// Wheel step of the zoom gesture. Requires shift or the middle button
    /// held, so plain scrolling keeps scrolling the page.
    pub fn on_wheel(&mut self, x: f64, delta_y: f64, shift: bool, middle_button: bool, track: &Track) {
        if !self.options.zooming || track.is_empty() {
            return;
        }
        if !(shift || middle_button) {
            return;
        }
        if !self.scales.zooming() {
            self.scales.set_zooming(true);
            debug!("zoom gesture start");
            self.push_event(ChartEvent::Zoom {
                phase: ZoomPhase::Start,
                scale: self.zoom.k,
                identity: self.zoom.is_identity(),
            });
        }
        let factor = if delta_y < 0.0 { 1.1 } else { 0.9 };
        let k = (self.zoom.k * factor).clamp(ZOOM_MIN, ZOOM_MAX);
        // keep the sample under the pointer stationary
        let tx = x - (x - self.zoom.x) * (k / self.zoom.k);
        self.zoom = ZoomTransform { k, x: tx };
        self.clamp_translate();
        self.apply_zoom(track);
        self.push_event(ChartEvent::Zoom {
            phase: ZoomPhase::Zoom,
            scale: self.zoom.k,
            identity: self.zoom.is_identity(),
        });
    }

    fn clamp_translate(&mut self) {
        let w = self.viewport.inner_width();
        let min_tx = w * (1.0 - self.zoom.k);
        self.zoom.x = self.zoom.x.clamp(min_tx, 0.0);
    }

    /// Rebase the x scales on fresh data, then apply the live transform.
    /// The zooming flag is dropped only around the base recompute, so the
    /// suppressed path never observes a half-applied transform.
    fn apply_zoom(&mut self, track: &Track) {
        self.scales.set_zooming(false);
        self.scales.update_scales(track, &self.viewport);
        self.scales.set_zooming(true);
        let names: Vec<String> = self
            .scales
            .specs()
            .iter()
            .filter(|s| s.axis == Axis::X)
            .map(|s| s.name.clone())
            .collect();
        for name in names {
            if let Some(base) = self.scales.get(&name).copied() {
                self.scales.set(&name, self.zoom.rescale_x(&base));
            }
        }
        self.hover_index = None;
        self.is_dragging = false;
        self.drag_start_x = None;
        self.drag_selection = None;
        self.dirty = true;
    }

    /// End of the zoom gesture. Back at identity the base scales return and
    /// data-driven rescaling resumes; otherwise the transform stays pinned.
    pub fn on_zoom_end(&mut self, track: &Track) {
        if !self.scales.zooming() {
            return;
        }
        let identity = self.zoom.is_identity();
        if identity {
            self.scales.set_zooming(false);
            self.scales.update_scales(track, &self.viewport);
        }
        debug!("zoom gesture end, scale {}", self.zoom.k);
        self.dirty = true;
        self.push_event(ChartEvent::Zoom {
            phase: ZoomPhase::End,
            scale: self.zoom.k,
            identity,
        });
    }

    pub fn reset_zoom(&mut self, track: &Track) {
        self.zoom = ZoomTransform::IDENTITY;
        if self.scales.zooming() {
            self.on_zoom_end(track);
        } else {
            self.update_scales(track);
        }
    }

    /// Drag step of the ruler handle. Clamps to the plot and emits the
    /// filter intent with the latlng runs at or above the ruler line.
    pub fn on_ruler_drag(&mut self, y: f64, track: &Track) {
        if !self.options.ruler || track.is_empty() {
            return;
        }
        let h = self.viewport.inner_height();
        let y = y.clamp(0.0, h);
        self.ruler_y = y;
        let mut coords = Vec::new();
        if y > 0.0 && y < h {
            if let Some(scale) = self.scales.get("altitude") {
                let z = scale.invert(y);
                self.ruler_label = Some(format!(
                    "{} {}",
                    format_fixed(z, self.options.decimals_y),
                    self.options.y_unit()
                ));
                coords = coords_above_y(track, scale, y);
            }
        }
        self.dirty = true;
        self.push_event(ChartEvent::RulerFilter { coords });
    }

    /// Release of the ruler handle; parked at either edge it clears.
    pub fn on_ruler_end(&mut self) {
        let h = self.viewport.inner_height();
        if self.ruler_y <= 0.0 || self.ruler_y >= h {
            self.ruler_label = None;
            self.hover_index = None;
        }
        self.dirty = true;
    }

    /// Legend click: toggles the series in or out of the drawing. With every
    /// series hidden the hover machinery goes quiet too.
    pub fn on_legend_click(&mut self, name: &str) {
        let enabled = match self.areas.iter_mut().find(|a| a.name == name) {
            Some(area) => {
                area.hidden = !area.hidden;
                !area.hidden
            }
            None => return,
        };
        self.chart_enabled = self.areas.iter().any(|a| a.visible && !a.hidden);
        if !self.chart_enabled {
            self.hover_index = None;
        }
        self.dirty = true;
        self.push_event(ChartEvent::ElepathToggle {
            name: name.to_string(),
            enabled,
        });
    }

    // --- hover content -------------------------------------------------------

    fn tooltip_rows(&self, point: &TrackPoint) -> Vec<String> {
        let o = &self.options;
        let mut rows = Vec::new();
        for spec in &self.tooltips {
            let row = match spec.kind {
                TooltipKind::YAttr => o
                    .y_attr
                    .value(point)
                    .map(|v| format!("y: {} {}", format_fixed(v, o.decimals_y), o.y_unit())),
                TooltipKind::XAttr => o
                    .x_attr
                    .value(point)
                    .map(|v| format!("x: {} {}", format_fixed(v, o.decimals_x), o.x_unit())),
                TooltipKind::Date => point.time.map(|t| format!("t: {}", format_clock(t))),
                TooltipKind::Duration => point.duration.map(|d| format!("T: {}", format_time(d))),
                TooltipKind::Slope => point
                    .slope
                    .map(|m| format!("m: {}{}", display_num(m), o.slope_label)),
                TooltipKind::Speed => point
                    .speed
                    .map(|v| format!("v: {} {}", display_num(v), o.speed_unit())),
                TooltipKind::Acceleration => point
                    .acceleration
                    .map(|a| format!("a: {} {}", display_num(a), o.acceleration_unit())),
            };
            if let Some(row) = row {
                rows.push(row);
            }
        }
        rows
    }

    /// Label lines for the map-side marker: rounded values, shortest form.
    fn marker_labels(&self, point: &TrackPoint) -> Vec<String> {
        let o = &self.options;
        let mut labels = Vec::new();
        if let Some(v) = o.y_attr.value(point) {
            labels.push(format!("{} {}", format_fixed(v, o.decimals_y), o.y_unit()));
        }
        if o.slope.computes() {
            if let Some(m) = point.slope {
                labels.push(format!("{}{}", m.round() as i64, o.slope_label));
            }
        }
        if o.speed.computes() {
            if let Some(v) = point.speed {
                labels.push(format!("{} {}", v.round() as i64, o.speed_unit()));
            }
        }
        if o.acceleration.computes() {
            if let Some(a) = point.acceleration {
                labels.push(format!("{} {}", a.round() as i64, o.acceleration_unit()));
            }
        }
        labels
    }

    /// Geometry for the map-side position indicator. `projected` is the
    /// track point already projected into the map pane by the embedder.
    pub fn marker_geometry(
        &self,
        track: &Track,
        summary: &RunningSummary,
        index: usize,
        projected: (f64, f64),
    ) -> Option<MarkerGeometry> {
        let point = track.get(index)?;
        let (px, py) = projected;
        let line_to = match self.options.marker {
            MarkerMode::ElevationLine => {
                let z = point.z.unwrap_or(0.0);
                let max = summary.value_or("elevation_max", 0.0);
                let len = if max > 0.0 {
                    self.viewport.inner_height() / max * z
                } else {
                    0.0
                };
                Some((px, py - len))
            }
            MarkerMode::PositionMarker => None,
        };
        Some(MarkerGeometry {
            point: (px, py),
            radius: 6.0,
            line_to,
            labels: self.marker_labels(point),
        })
    }

    // --- rendering -----------------------------------------------------------

    /// Draw the full frame. Sampling the areas caches each point's pixel x
    /// back onto the track for the reverse lookups.
    pub fn render(&mut self, track: &mut Track, backend: &mut dyn RendererBackend) {
        self.audit_margins(track);
        trace!("redraw pass, {} points", track.len());
        backend.begin_frame(self.viewport.width, self.viewport.height);
        self.render_grid(backend);
        self.render_areas(track, backend);
        self.render_axes(backend);
        self.render_brush(backend);
        self.render_ruler(track, backend);
        self.render_focus(track, backend);
        if self.options.legend {
            self.render_legend(backend);
        }
        self.dirty = false;
        self.push_event(ChartEvent::ElechartUpdated);
    }

    /// Grow the right margin when stacked right-hand axes need the room.
    fn audit_margins(&mut self, track: &Track) {
        let right_axes = self.scales.visible_right_axes();
        if right_axes == 0 {
            return;
        }
        let needed = right_axes as f64 * RIGHT_AXIS_MARGIN;
        if self.viewport.margins.right < needed {
            debug!(
                "right margin {} -> {} for {} axes",
                self.viewport.margins.right, needed, right_axes
            );
            self.viewport.margins.right = needed;
            self.options.margins.right = needed;
            self.scales.update_scales(track, &self.viewport);
            self.push_event(ChartEvent::MarginsUpdated {
                margins: self.viewport.margins,
            });
        }
    }

    fn render_grid(&mut self, backend: &mut dyn RendererBackend) {
        let v = self.viewport;
        let (ox, oy) = (v.margins.left, v.margins.top);
        let mut segments = Vec::new();
        if let Some(x) = self.scales.get("distance") {
            for t in x.ticks(v.x_ticks()) {
                let px = ox + x.scale(t);
                segments.push((px, oy, px, oy + v.inner_height()));
            }
        }
        if let Some(y) = self.scales.get("altitude") {
            for t in y.ticks(v.y_ticks()) {
                let py = oy + y.scale(t);
                segments.push((ox, py, ox + v.inner_width(), py));
            }
        }
        if !segments.is_empty() {
            backend.draw_segments(&segments, GRID_COLOR, 1.0);
        }
    }

    fn render_areas(&mut self, track: &mut Track, backend: &mut dyn RendererBackend) {
        let v = self.viewport;
        let (ox, oy) = (v.margins.left, v.margins.top);
        let baseline = oy + v.inner_height();
        let x_attr = self.options.x_attr;
        for idx in 0..self.areas.len() {
            let spec = self.areas[idx].clone();
            if !spec.visible || spec.hidden {
                continue;
            }
            let sx = match self.scales.get(&spec.scale_x) {
                Some(s) => *s,
                None => continue,
            };
            let sy = match self.scales.get(&spec.scale_y) {
                Some(s) => *s,
                None => continue,
            };
            let mut points = Vec::with_capacity(track.len());
            for p in track.as_mut_slice() {
                let x = sx.scale(x_attr.value(p).unwrap_or(0.0));
                p.x_diag_coord = Some(x);
                let y = sy.scale(spec.y_attr.value(p).unwrap_or(0.0));
                points.push((ox + x, oy + y));
            }
            if points.is_empty() {
                continue;
            }
            backend.draw_area(
                &points,
                baseline,
                &spec.color,
                spec.fill_opacity,
                &spec.stroke,
                spec.stroke_opacity,
            );
        }
    }

    fn render_axes(&mut self, backend: &mut dyn RendererBackend) {
        let v = self.viewport;
        let (ox, oy) = (v.margins.left, v.margins.top);
        let (w, h) = (v.inner_width(), v.inner_height());
        let specs: Vec<ScaleSpec> = self.scales.specs().to_vec();
        for spec in specs.iter().filter(|s| s.visible) {
            let scale = match self.scales.get(&spec.name) {
                Some(s) => *s,
                None => continue,
            };
            let tick_count = match spec.axis {
                Axis::X => v.x_ticks(),
                Axis::Y => v.y_ticks(),
            };
            // extra right-hand axes draw dimmed so the altitude axis reads first
            let color = match spec.position {
                AxisPosition::Right => DIM_AXIS_COLOR,
                _ => AXIS_COLOR,
            };
            let mut marks = Vec::new();
            match spec.position {
                AxisPosition::Bottom => {
                    marks.push((ox, oy + h, ox + w, oy + h));
                    for t in scale.ticks(tick_count) {
                        let px = ox + scale.scale(t);
                        marks.push((px, oy + h, px, oy + h + TICK_LEN));
                        if let Some(label) = x_tick_label(spec.attr, t) {
                            backend.draw_text(px, oy + h + 18.0, &label, TextAnchor::Middle, color);
                        }
                    }
                    backend.draw_text(
                        ox + w + 10.0,
                        oy + h + 2.0,
                        &spec.label,
                        TextAnchor::Start,
                        color,
                    );
                }
                AxisPosition::Top => {
                    marks.push((ox, oy, ox + w, oy));
                    for t in scale.ticks(tick_count) {
                        let px = ox + scale.scale(t);
                        marks.push((px, oy, px, oy - TICK_LEN));
                        if let Some(label) = x_tick_label(spec.attr, t) {
                            backend.draw_text(px, oy - 8.0, &label, TextAnchor::Middle, color);
                        }
                    }
                    backend.draw_text(
                        ox + w + 10.0,
                        oy + 2.0,
                        &spec.label,
                        TextAnchor::Start,
                        color,
                    );
                }
                AxisPosition::Left => {
                    marks.push((ox, oy, ox, oy + h));
                    for t in scale.ticks(tick_count) {
                        let py = oy + scale.scale(t);
                        marks.push((ox, py, ox - TICK_LEN, py));
                        backend.draw_text(
                            ox - 8.0,
                            py + 3.0,
                            &display_num(t),
                            TextAnchor::End,
                            color,
                        );
                    }
                    backend.draw_text(ox - 3.0, oy - 8.0, &spec.label, TextAnchor::End, color);
                }
                AxisPosition::Right => {
                    let ax = ox + w + self.scales.right_axis_offset(&spec.name);
                    marks.push((ax, oy, ax, oy + h));
                    for t in scale.ticks(tick_count) {
                        let py = oy + scale.scale(t);
                        marks.push((ax, py, ax + TICK_LEN, py));
                        backend.draw_text(
                            ax + 8.0,
                            py + 3.0,
                            &display_num(t),
                            TextAnchor::Start,
                            color,
                        );
                    }
                    backend.draw_text(
                        ax + 25.0,
                        oy - 8.0,
                        &spec.label,
                        TextAnchor::Middle,
                        color,
                    );
                }
            }
            backend.draw_segments(&marks, color, 1.0);
        }
    }

    fn render_brush(&mut self, backend: &mut dyn RendererBackend) {
        let (x0, x1) = match self.drag_selection {
            Some(s) => s,
            None => return,
        };
        let v = self.viewport;
        backend.draw_rect(
            v.margins.left + x0,
            v.margins.top,
            x1 - x0,
            v.inner_height(),
            BRUSH_COLOR,
            0.3,
            "",
            0.0,
        );
    }

    fn render_ruler(&mut self, track: &Track, backend: &mut dyn RendererBackend) {
        if !self.options.ruler || track.is_empty() {
            return;
        }
        let v = self.viewport;
        let (ox, oy) = (v.margins.left, v.margins.top);
        let y = oy + self.ruler_y;
        if self.ruler_y > 0.0 && self.ruler_y < v.inner_height() {
            backend.draw_segments(&[(ox, y, ox + v.inner_width(), y)], FOCUS_COLOR, 1.0);
        }
        backend.draw_rect(
            ox + v.inner_width() + 2.0,
            y - 4.0,
            10.0,
            8.0,
            FOCUS_COLOR,
            0.8,
            "",
            0.0,
        );
        if let Some(label) = &self.ruler_label {
            backend.draw_text(
                ox + v.inner_width() - 8.0,
                y - 6.0,
                label,
                TextAnchor::End,
                FOCUS_COLOR,
            );
        }
    }

    fn render_focus(&mut self, track: &Track, backend: &mut dyn RendererBackend) {
        if !self.chart_enabled {
            return;
        }
        let index = match self.hover_index {
            Some(i) => i,
            None => return,
        };
        let point = match track.get(index) {
            Some(p) => p,
            None => return,
        };
        let x = match point.x_diag_coord {
            Some(x) => x,
            None => return,
        };
        let v = self.viewport;
        let (ox, oy) = (v.margins.left, v.margins.top);
        backend.draw_segments(
            &[(ox + x, oy, ox + x, oy + v.inner_height())],
            FOCUS_COLOR,
            1.0,
        );
        if let Some(sy) = self.scales.get("altitude") {
            if let Some(z) = self.options.y_attr.value(point) {
                backend.draw_circle(ox + x, oy + sy.scale(z), 4.0, FOCUS_COLOR);
            }
        }
        self.render_tooltip(point, x, backend);
    }

    /// Tooltip box next to the hovered sample. Flips sides past the middle
    /// of the plot and never crosses the top edge. Skipped entirely when the
    /// backend cannot measure text.
    fn render_tooltip(&self, point: &TrackPoint, x: f64, backend: &mut dyn RendererBackend) {
        let rows = self.tooltip_rows(point);
        if rows.is_empty() {
            return;
        }
        let mut text_w: f64 = 0.0;
        let mut line_h: f64 = 0.0;
        for row in &rows {
            let (rw, rh) = match backend.measure_text(row) {
                Some(m) => m,
                None => return,
            };
            text_w = text_w.max(rw);
            line_h = line_h.max(rh);
        }
        let pad = 4.0;
        let box_w = text_w + pad * 2.0;
        let box_h = line_h * rows.len() as f64 + pad * 2.0;
        let v = self.viewport;
        let (ox, oy) = (v.margins.left, v.margins.top);
        let xa = if x < v.inner_width() / 2.0 {
            x + 10.0
        } else {
            x - box_w - 10.0
        };
        let ya = (self.last_pointer_y - box_h).max(0.0);
        backend.draw_rect(
            ox + xa,
            oy + ya,
            box_w,
            box_h,
            TOOLTIP_BG,
            0.75,
            TOOLTIP_BORDER,
            0.25,
        );
        for (i, row) in rows.iter().enumerate() {
            backend.draw_text(
                ox + xa + pad,
                oy + ya + pad + line_h * (i as f64 + 1.0) - 3.0,
                row,
                TextAnchor::Start,
                AXIS_COLOR,
            );
        }
    }

    fn render_legend(&mut self, backend: &mut dyn RendererBackend) {
        let entries: Vec<AreaSpec> = self.areas.iter().filter(|a| a.visible).cloned().collect();
        if entries.is_empty() {
            return;
        }
        let v = self.viewport;
        let (ox, oy) = (v.margins.left, v.margins.top);
        let cx = v.inner_width() / 2.0;
        let ly = oy + v.inner_height() + v.margins.bottom / 2.0;
        for (area, tx) in entries.iter().zip(legend_offsets(entries.len())) {
            let rx = ox + cx - 50.0 + tx * LEGEND_STEP;
            let fill_opacity = if area.hidden { 0.0 } else { 0.25 };
            backend.draw_rect(rx, ly, 50.0, 10.0, &area.color, fill_opacity, AXIS_COLOR, 0.5);
            backend.draw_text(rx + 25.0, ly + 22.0, &area.label, TextAnchor::Middle, AXIS_COLOR);
        }
    }
}

// ---------- profile control -------------------------------------------------

/// One raw input sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoSample {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub alt: Option<f64>,
    #[serde(default)]
    pub time: Option<Timestamp>,
}

/// The full engine behind one facade: track storage, the attribute
/// pipeline, scales, chart and summary wired together.
pub struct ElevationProfile {
    options: ChartOptions,
    track: Track,
    summary: RunningSummary,
    pipeline: ProfilePipeline,
    chart: Chart,
    summary_items: Vec<SummaryItem>,
}

impl ElevationProfile {
    pub fn new(options: ChartOptions) -> Result<Self, ChartError> {
        let pipeline =
            ProfilePipeline::new(&options.pipeline_params(), options.enabled_attributes());
        let summary_items = default_summary_items(&options);
        let mut chart = Chart::new(options.clone())?;
        let track = Track::new();
        chart.update_scales(&track);
        Ok(ElevationProfile {
            options,
            track,
            summary: RunningSummary::new(),
            pipeline,
            chart,
            summary_items,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, ChartError> {
        Self::new(ChartOptions::from_json(json)?)
    }

    /// Append one sample, run the attribute pipeline and refresh scales.
    /// Returns the index the sample ended up at, which may have shifted if
    /// an unrepairable hole collapsed the previous point.
    pub fn add_point(
        &mut self,
        lat: f64,
        lng: f64,
        alt: Option<f64>,
        time: Option<Timestamp>,
    ) -> usize {
        let (lat, lng) = if self.options.reverse_coords {
            (lng, lat)
        } else {
            (lat, lng)
        };
        let index = self.track.push(TrackPoint::new(lat, lng, alt, time));
        let outcome = self
            .pipeline
            .on_point_added(&mut self.track, &mut self.summary, index);
        let index = outcome.index();
        self.chart.update_scales(&self.track);
        self.chart.push_event(ChartEvent::EledataUpdated { index });
        index
    }

    pub fn add_data(&mut self, samples: &[GeoSample]) {
        for s in samples {
            self.add_point(s.lat, s.lng, s.alt, s.time);
        }
    }

    /// Drop all data and derived state; registrations and options stay.
    pub fn clear(&mut self) {
        self.track.clear();
        self.summary.reset();
        self.pipeline.reset();
        self.chart.reset_view(&self.track);
    }

    pub fn resize(&mut self, width: f64, height: f64) -> Result<(), ChartError> {
        self.chart.resize(width, height, &self.track)?;
        self.options.width = width;
        self.options.height = height;
        Ok(())
    }

    pub fn redraw(&mut self, backend: &mut dyn RendererBackend) {
        self.chart.render(&mut self.track, backend);
    }

    /// Current summary panel content, rebuilt from scratch on every call.
    pub fn summary_rows(&self) -> Vec<SummaryRow> {
        summary_rows(&self.summary_items, &self.summary)
    }

    // --- gesture forwarding --------------------------------------------------

    pub fn on_mouse_enter(&mut self) {
        self.chart.on_mouse_enter(&self.track);
    }

    pub fn on_mouse_down(&mut self, x: f64, y: f64, shift: bool) {
        self.chart.on_mouse_down(x, y, shift, &self.track);
    }

    pub fn on_mouse_move(&mut self, x: f64, y: f64) {
        self.chart.on_mouse_move(x, y, &self.track);
    }

    pub fn on_mouse_up(&mut self) {
        self.chart.on_mouse_up(&self.track);
    }

    pub fn on_mouse_out(&mut self) {
        self.chart.on_mouse_out();
    }

    pub fn on_map_mouse_move(&mut self, lat: f64, lng: f64) {
        self.chart.on_map_mouse_move(lat, lng, &self.track);
    }

    pub fn on_wheel(&mut self, x: f64, delta_y: f64, shift: bool, middle_button: bool) {
        self.chart
            .on_wheel(x, delta_y, shift, middle_button, &self.track);
    }

    pub fn on_zoom_end(&mut self) {
        self.chart.on_zoom_end(&self.track);
    }

    pub fn reset_zoom(&mut self) {
        self.chart.reset_zoom(&self.track);
    }

    pub fn on_ruler_drag(&mut self, y: f64) {
        self.chart.on_ruler_drag(y, &self.track);
    }

    pub fn on_ruler_end(&mut self) {
        self.chart.on_ruler_end();
    }

    pub fn on_legend_click(&mut self, name: &str) {
        self.chart.on_legend_click(name);
    }

    pub fn marker_geometry(&self, index: usize, projected: (f64, f64)) -> Option<MarkerGeometry> {
        self.chart
            .marker_geometry(&self.track, &self.summary, index, projected)
    }

    // --- events --------------------------------------------------------------

    pub fn drain_events(&mut self) -> Vec<ChartEvent> {
        self.chart.take_events()
    }

    /// Deliver every queued event to the sink.
    pub fn pump_events(&mut self, sink: &mut dyn EventSink) {
        for event in self.chart.take_events() {
            sink.on_event(&event);
        }
    }

    // --- accessors -----------------------------------------------------------

    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn summary(&self) -> &RunningSummary {
        &self.summary
    }

    pub fn options(&self) -> &ChartOptions {
        &self.options
    }

    pub fn chart(&self) -> &Chart {
        &self.chart
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_options() -> ChartOptions {
        ChartOptions {
            width: 640.0,
            height: 200.0,
            ..ChartOptions::default()
        }
    }

    // Samples along a meridian, ~11.1m apart per 0.0001 deg of latitude.
    fn mk_profile(zs: &[f64]) -> ElevationProfile {
        let mut profile = ElevationProfile::new(mk_options()).unwrap();
        for (i, z) in zs.iter().enumerate() {
            profile.add_point(
                45.0 + i as f64 * 0.001,
                7.0,
                Some(*z),
                Some(i as i64 * 10_000),
            );
        }
        profile
    }

    fn mk_track(zs: &[f64]) -> Track {
        let mut track = Track::new();
        for (i, z) in zs.iter().enumerate() {
            let mut p = TrackPoint::new(45.0 + i as f64 * 0.001, 7.0, Some(*z), None);
            p.z = Some(*z);
            p.dist = Some(i as f64);
            track.push(p);
        }
        track
    }

    #[test]
    fn series_mode_accepts_bools_and_strings() {
        let o: ChartOptions =
            serde_json::from_str(r#"{"altitude": true, "slope": "summary", "speed": false}"#)
                .unwrap();
        assert_eq!(o.altitude, SeriesMode::Chart);
        assert_eq!(o.slope, SeriesMode::Summary);
        assert_eq!(o.speed, SeriesMode::Off);
        assert!(o.slope.computes());
        assert!(!o.slope.charts());
    }

    #[test]
    fn imperial_overrides_units_and_factors() {
        let o = ChartOptions {
            imperial: true,
            ..ChartOptions::default()
        };
        assert_eq!(o.x_unit(), "mi");
        assert_eq!(o.y_unit(), "ft");
        assert_eq!(o.speed_unit(), "mph");
        assert_eq!(o.acceleration_unit(), "ft/s");
        let p = o.pipeline_params();
        assert!((p.distance_factor - MILE_FACTOR).abs() < 1e-12);
        assert!((p.altitude_factor - FOOT_FACTOR).abs() < 1e-12);
    }

    #[test]
    fn viewport_rejects_margin_overflow() {
        assert!(Viewport::new(50.0, 50.0, Margins::default()).is_err());
        assert!(Viewport::new(600.0, 200.0, Margins::default()).is_ok());
    }

    #[test]
    fn unknown_theme_falls_back() {
        let o = ChartOptions {
            theme: "no-such-theme".to_string(),
            ..ChartOptions::default()
        };
        assert_eq!(o.palette(), Theme::default());
        assert_eq!(Theme::named("steelblue-theme").unwrap().area, "#4682B4");
    }

    #[test]
    fn domain_follows_attribute_extent() {
        let track = mk_track(&[10.0, 50.0, 5.0, 30.0]);
        let spec = ScaleSpec {
            name: "altitude".to_string(),
            axis: Axis::Y,
            position: AxisPosition::Left,
            attr: PointField::Z,
            label: "m".to_string(),
            min: None,
            max: None,
            force_bounds: false,
            visible: true,
        };
        assert_eq!(spec.domain(&track), (5.0, 50.0));
    }

    #[test]
    fn domain_bounds_override_extent() {
        let track = mk_track(&[10.0, 50.0, 5.0, 30.0]);
        let mut spec = ScaleSpec {
            name: "altitude".to_string(),
            axis: Axis::Y,
            position: AxisPosition::Left,
            attr: PointField::Z,
            label: "m".to_string(),
            min: Some(0.0),
            max: None,
            force_bounds: true,
            visible: true,
        };
        assert_eq!(spec.domain(&track), (0.0, 50.0));
        // a lower bound below the extent wins even without forcing
        spec.force_bounds = false;
        assert_eq!(spec.domain(&track), (0.0, 50.0));
        // one above it only wins when forced
        spec.min = Some(20.0);
        assert_eq!(spec.domain(&track), (5.0, 50.0));
        spec.force_bounds = true;
        assert_eq!(spec.domain(&track), (20.0, 50.0));
    }

    #[test]
    fn empty_track_stays_harmless() {
        let track = Track::new();
        let spec = ScaleSpec {
            name: "distance".to_string(),
            axis: Axis::X,
            position: AxisPosition::Bottom,
            attr: PointField::Dist,
            label: "km".to_string(),
            min: None,
            max: None,
            force_bounds: false,
            visible: true,
        };
        assert_eq!(spec.domain(&track), (0.0, 1.0));
        let scale = LinearScale::new((0.0, 1.0), (0.0, 500.0));
        assert_eq!(index_for_x_coord(&track, &scale, PointField::Dist, 250.0), 0);
        assert!(coords_above_y(&track, &scale, 10.0).is_empty());
        assert_eq!(index_for_latlng(&track, 45.0, 7.0), None);

        let mut profile = ElevationProfile::new(mk_options()).unwrap();
        profile.on_mouse_enter();
        profile.on_mouse_down(10.0, 10.0, false);
        profile.on_mouse_move(20.0, 10.0);
        profile.on_mouse_up();
        profile.on_wheel(10.0, -120.0, true, false);
        profile.on_ruler_drag(30.0);
        assert!(profile.drain_events().is_empty());
    }

    #[test]
    fn bisect_recovers_every_index() {
        let mut track = Track::new();
        for k in 0..=10 {
            let mut p = TrackPoint::new(0.0, 0.0, None, None);
            p.dist = Some(k as f64 * 10.0);
            track.push(p);
        }
        let scale = LinearScale::new((0.0, 100.0), (0.0, 500.0));
        for k in 0..=10usize {
            let px = scale.scale(k as f64 * 10.0);
            assert_eq!(index_for_x_coord(&track, &scale, PointField::Dist, px), k);
        }
        // past the right edge clamps to the last point
        assert_eq!(index_for_x_coord(&track, &scale, PointField::Dist, 600.0), 10);
    }

    #[test]
    fn nearest_latlng_picks_closest_sample() {
        let track = mk_track(&[100.0, 110.0, 120.0, 130.0]);
        assert_eq!(index_for_latlng(&track, 45.0021, 7.0), Some(2));
        assert_eq!(index_for_latlng(&track, 44.0, 7.0), Some(0));
    }

    #[test]
    fn coords_above_y_groups_contiguous_runs() {
        let track = mk_track(&[10.0, 10.0, 30.0, 30.0, 30.0, 10.0, 10.0, 30.0, 30.0]);
        // domain [10, 30], range [140, 0]: y 70 maps back to z 20
        let scale = LinearScale::new((10.0, 30.0), (140.0, 0.0));
        let segments = coords_above_y(&track, &scale, 70.0);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].len(), 3);
        assert_eq!(segments[1].len(), 2);
        assert!((segments[0][0].0 - 45.002).abs() < 1e-9);
        assert!((segments[1][0].0 - 45.007).abs() < 1e-9);
    }

    #[test]
    fn zoom_transform_rescales_domain() {
        let base = LinearScale::new((0.0, 100.0), (0.0, 500.0));
        let t = ZoomTransform { k: 2.0, x: 0.0 };
        let rescaled = t.rescale_x(&base);
        assert!((rescaled.domain.0 - 0.0).abs() < 1e-9);
        assert!((rescaled.domain.1 - 50.0).abs() < 1e-9);
        assert_eq!(rescaled.range, base.range);
        assert!(ZoomTransform::IDENTITY.is_identity());
        assert!(!t.is_identity());
    }

    #[test]
    fn wheel_zoom_needs_modifier_and_emits_phases() {
        let mut profile = mk_profile(&[100.0, 120.0, 140.0, 160.0, 180.0]);
        profile.drain_events();
        let base = *profile.chart().scales().get("distance").unwrap();

        profile.on_wheel(100.0, -120.0, false, false);
        assert!(profile.drain_events().is_empty());
        assert_eq!(*profile.chart().scales().get("distance").unwrap(), base);

        profile.on_wheel(100.0, -120.0, true, false);
        let events = profile.drain_events();
        assert!(matches!(
            events[0],
            ChartEvent::Zoom {
                phase: ZoomPhase::Start,
                ..
            }
        ));
        assert!(matches!(
            events[1],
            ChartEvent::Zoom {
                phase: ZoomPhase::Zoom,
                identity: false,
                ..
            }
        ));
        assert!(profile.chart().scales().zooming());
        let zoomed = *profile.chart().scales().get("distance").unwrap();
        assert!(zoomed.domain.0 >= base.domain.0);
        assert!(zoomed.domain.1 < base.domain.1);

        profile.on_zoom_end();
        let events = profile.drain_events();
        assert!(matches!(
            events[0],
            ChartEvent::Zoom {
                phase: ZoomPhase::End,
                identity: false,
                ..
            }
        ));
        // still zoomed in, so data-driven rescaling stays suppressed
        assert!(profile.chart().scales().zooming());

        profile.reset_zoom();
        let events = profile.drain_events();
        assert!(matches!(
            events[0],
            ChartEvent::Zoom {
                phase: ZoomPhase::End,
                identity: true,
                ..
            }
        ));
        assert!(!profile.chart().scales().zooming());
        assert_eq!(*profile.chart().scales().get("distance").unwrap(), base);
    }

    #[test]
    fn data_updates_never_clobber_live_transform() {
        let mut profile = mk_profile(&[100.0, 120.0, 140.0, 160.0, 180.0]);
        profile.on_wheel(100.0, -120.0, true, false);
        let zoomed = *profile.chart().scales().get("distance").unwrap();
        profile.add_point(45.02, 7.0, Some(200.0), Some(100_000));
        assert_eq!(*profile.chart().scales().get("distance").unwrap(), zoomed);
        // returning to identity resumes data-driven domains
        profile.reset_zoom();
        let fresh = *profile.chart().scales().get("distance").unwrap();
        assert!(fresh.domain.1 > zoomed.domain.1);
    }

    #[test]
    fn brush_drag_reports_selection_endpoints() {
        let mut profile = mk_profile(&[100.0, 110.0, 120.0, 130.0, 140.0]);
        profile.drain_events();
        let w = profile.chart().viewport().inner_width();
        profile.on_mouse_down(0.0, 10.0, false);
        profile.on_mouse_move(w, 10.0);
        profile.on_mouse_up();
        let events = profile.drain_events();
        let dragged = events
            .iter()
            .find_map(|e| match e {
                ChartEvent::Dragged { dragstart, dragend } => Some((*dragstart, *dragend)),
                _ => None,
            })
            .expect("dragged event");
        assert!((dragged.0 .0 - 45.0).abs() < 1e-9);
        assert!((dragged.1 .0 - 45.004).abs() < 1e-9);
        assert!(dragged.0 .0 < dragged.1 .0);
    }

    #[test]
    fn hover_reports_index_until_disabled() {
        let mut profile = mk_profile(&[100.0, 110.0, 120.0, 130.0]);
        profile.drain_events();
        let w = profile.chart().viewport().inner_width();
        profile.on_mouse_move(w, 10.0);
        let events = profile.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ChartEvent::MouseMove { index: 3, .. })));
        assert_eq!(profile.chart().hover_index(), Some(3));

        profile.on_legend_click("altitude");
        let events = profile.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            ChartEvent::ElepathToggle {
                enabled: false,
                ..
            }
        )));
        assert!(!profile.chart().chart_enabled());
        assert_eq!(profile.chart().hover_index(), None);

        profile.on_mouse_move(w / 2.0, 10.0);
        assert!(profile.drain_events().is_empty());
    }

    #[test]
    fn map_hover_matches_nearest_sample() {
        let mut profile = mk_profile(&[100.0, 110.0, 120.0, 130.0]);
        let mut backend = CommandBackend::new();
        profile.redraw(&mut backend);
        profile.drain_events();
        profile.on_map_mouse_move(45.0031, 7.0);
        let events = profile.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ChartEvent::MouseMove { index: 3, .. })));
    }

    #[test]
    fn ruler_drag_filters_high_ground() {
        let mut profile = mk_profile(&[100.0, 100.0, 200.0, 200.0, 100.0]);
        profile.drain_events();
        let h = profile.chart().viewport().inner_height();
        profile.on_ruler_drag(h / 2.0);
        let events = profile.drain_events();
        let coords = events
            .iter()
            .find_map(|e| match e {
                ChartEvent::RulerFilter { coords } => Some(coords.clone()),
                _ => None,
            })
            .expect("ruler filter event");
        assert_eq!(coords.len(), 1);
        assert_eq!(coords[0].len(), 2);
        // parked at the bottom edge the filter clears
        profile.on_ruler_drag(h);
        let events = profile.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ChartEvent::RulerFilter { coords } if coords.is_empty())));
        profile.on_ruler_end();
    }

    #[test]
    fn summary_rows_sorted_and_formatted() {
        let options = ChartOptions {
            slope: SeriesMode::Summary,
            time: SeriesMode::Summary,
            ..mk_options()
        };
        let mut profile = ElevationProfile::new(options).unwrap();
        for (i, z) in [100.0, 150.0, 120.0].iter().enumerate() {
            profile.add_point(45.0 + i as f64 * 0.001, 7.0, Some(*z), Some(i as i64 * 60_000));
        }
        let rows = profile.summary_rows();
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        let totlen_pos = names.iter().position(|n| *n == "totlen").unwrap();
        let tottime_pos = names.iter().position(|n| *n == "tottime").unwrap();
        let ascent_pos = names.iter().position(|n| *n == "ascent").unwrap();
        assert!(totlen_pos < tottime_pos && tottime_pos < ascent_pos);

        let totlen = &rows[totlen_pos];
        assert!(totlen.value.ends_with(" km"));
        assert!((totlen.value.trim_end_matches(" km").parse::<f64>().unwrap() - 0.22).abs() < 0.01);
        let tottime = &rows[tottime_pos];
        assert_eq!(tottime.value, "00:02'00\"");
        let ascent = &rows[ascent_pos];
        assert_eq!(ascent.value, "50 m");
    }

    #[test]
    fn tooltip_rows_follow_registrations() {
        let options = ChartOptions {
            slope: SeriesMode::Chart,
            speed: SeriesMode::Chart,
            ..mk_options()
        };
        let mut profile = ElevationProfile::new(options).unwrap();
        for (i, z) in [100.0, 150.0, 120.0].iter().enumerate() {
            profile.add_point(45.0 + i as f64 * 0.001, 7.0, Some(*z), Some(i as i64 * 60_000));
        }
        let point = profile.track().get(2).copied().unwrap();
        let rows = profile.chart().tooltip_rows(&point);
        assert!(rows[0].starts_with("y: 120 m"));
        assert!(rows.iter().any(|r| r.starts_with("x: ")));
        assert!(rows.iter().any(|r| r.starts_with("m: ") && r.ends_with('%')));
        assert!(rows.iter().any(|r| r.starts_with("v: ")));
        assert!(!rows.iter().any(|r| r.starts_with("a: ")));
    }

    #[test]
    fn backends_share_the_same_geometry() {
        let mut profile = mk_profile(&[100.0, 150.0, 120.0, 180.0]);
        let w = profile.chart().viewport().inner_width();
        profile.on_mouse_move(w / 4.0, 40.0);

        let mut svg = SvgBackend::new();
        profile.redraw(&mut svg);
        let mut cmd = CommandBackend::new();
        profile.redraw(&mut cmd);

        let (points, baseline) = cmd
            .commands()
            .iter()
            .find_map(|c| match c {
                DrawCommand::Area {
                    points, baseline, ..
                } => Some((points.clone(), *baseline)),
                _ => None,
            })
            .expect("area command");
        let expected = area_path_d(&points, baseline);
        assert!(svg
            .nodes()
            .iter()
            .any(|n| matches!(n, SvgNode::Path { d, .. } if *d == expected)));

        // the svg backend can measure text, so only it lays out the tooltip
        assert!(svg
            .nodes()
            .iter()
            .any(|n| matches!(n, SvgNode::Text { text, .. } if text.starts_with("y: "))));
        assert!(!cmd
            .commands()
            .iter()
            .any(|c| matches!(c, DrawCommand::Text { text, .. } if text.starts_with("y: "))));
    }

    #[test]
    fn render_caches_pixel_x_on_track() {
        let mut profile = mk_profile(&[100.0, 150.0, 120.0]);
        let mut backend = CommandBackend::new();
        profile.redraw(&mut backend);
        assert!(profile.track().iter().all(|p| p.x_diag_coord.is_some()));
        let xs: Vec<f64> = profile
            .track()
            .iter()
            .map(|p| p.x_diag_coord.unwrap())
            .collect();
        assert!(xs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn stacked_right_axes_grow_margin() {
        let options = ChartOptions {
            slope: SeriesMode::Chart,
            speed: SeriesMode::Chart,
            acceleration: SeriesMode::Chart,
            ..mk_options()
        };
        let mut profile = ElevationProfile::new(options).unwrap();
        for (i, z) in [100.0, 150.0, 120.0].iter().enumerate() {
            profile.add_point(45.0 + i as f64 * 0.001, 7.0, Some(*z), Some(i as i64 * 10_000));
        }
        profile.drain_events();
        let mut backend = CommandBackend::new();
        profile.redraw(&mut backend);
        let events = profile.drain_events();
        let grown = events
            .iter()
            .find_map(|e| match e {
                ChartEvent::MarginsUpdated { margins } => Some(*margins),
                _ => None,
            })
            .expect("margins event");
        assert_eq!(grown.right, 90.0);
        assert_eq!(profile.chart().viewport().margins.right, 90.0);
        // a second frame needs no further growth
        profile.redraw(&mut backend);
        assert!(!profile
            .drain_events()
            .iter()
            .any(|e| matches!(e, ChartEvent::MarginsUpdated { .. })));
    }

    #[test]
    fn events_serialize_with_type_tags() {
        let v = serde_json::to_value(ChartEvent::Zoom {
            phase: ZoomPhase::Start,
            scale: 1.5,
            identity: false,
        })
        .unwrap();
        assert_eq!(v["type"], "zoom");
        assert_eq!(v["phase"], "start");

        let v = serde_json::to_value(ChartEvent::MouseMove {
            index: 4,
            x_coord: 120.5,
        })
        .unwrap();
        assert_eq!(v["type"], "mouse_move");
        assert_eq!(v["index"], 4);

        let v = serde_json::to_value(ChartEvent::ElepathToggle {
            name: "altitude".to_string(),
            enabled: true,
        })
        .unwrap();
        assert_eq!(v["type"], "elepath_toggle");
    }

    #[test]
    fn legend_offsets_stay_symmetric() {
        assert_eq!(legend_offsets(1), vec![0.0]);
        assert_eq!(legend_offsets(2), vec![-1.0, 1.0]);
        assert_eq!(legend_offsets(3), vec![-2.0, 0.0, 2.0]);
        assert_eq!(legend_offsets(4), vec![-3.0, -1.0, 1.0, 3.0]);
    }

    #[test]
    fn marker_stem_scales_with_elevation() {
        let profile = {
            let mut p = mk_profile(&[50.0, 200.0, 100.0]);
            let mut backend = CommandBackend::new();
            p.redraw(&mut backend);
            p
        };
        let h = profile.chart().viewport().inner_height();
        let geom = profile.marker_geometry(1, (80.0, 300.0)).unwrap();
        let (_, stem_y) = geom.line_to.unwrap();
        // z equals elevation_max, so the stem spans the full plot height
        assert!((stem_y - (300.0 - h)).abs() < 1e-9);
        assert_eq!(geom.point, (80.0, 300.0));
        assert!(!geom.labels.is_empty());
    }

    #[test]
    fn ingest_emits_data_events_and_clear_resets() {
        let mut profile = mk_profile(&[100.0, 110.0]);
        let events = profile.drain_events();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, ChartEvent::EledataUpdated { .. }))
                .count(),
            2
        );
        let mut backend = CommandBackend::new();
        profile.redraw(&mut backend);
        assert!(profile
            .drain_events()
            .iter()
            .any(|e| matches!(e, ChartEvent::ElechartUpdated)));

        profile.clear();
        assert!(profile.track().is_empty());
        assert_eq!(profile.summary().get("distance"), None);
        let spec_domain = profile.chart().scales().get("distance").unwrap().domain;
        assert_eq!(spec_domain, (0.0, 1.0));
    }

    #[test]
    fn reverse_coords_swaps_ingest_order() {
        let options = ChartOptions {
            reverse_coords: true,
            ..mk_options()
        };
        let mut profile = ElevationProfile::new(options).unwrap();
        profile.add_point(7.0, 45.0, Some(100.0), None);
        let p = profile.track().get(0).unwrap();
        assert!((p.lat - 45.0).abs() < 1e-12);
        assert!((p.lng - 7.0).abs() < 1e-12);
    }

    #[test]
    fn event_sink_receives_drained_events() {
        struct Recorder(Vec<String>);
        impl EventSink for Recorder {
            fn on_event(&mut self, event: &ChartEvent) {
                if let Ok(v) = serde_json::to_value(event) {
                    self.0.push(v["type"].as_str().unwrap_or("").to_string());
                }
            }
        }
        let mut profile = mk_profile(&[100.0, 110.0]);
        let mut sink = Recorder(Vec::new());
        profile.pump_events(&mut sink);
        assert_eq!(sink.0, vec!["eledata_updated", "eledata_updated"]);
        assert!(profile.drain_events().is_empty());
    }

    #[test]
    fn display_num_trims_trailing_zeros() {
        assert_eq!(display_num(2.0), "2");
        assert_eq!(display_num(1.5), "1.5");
        assert_eq!(display_num(-3.25), "-3.25");
        assert_eq!(display_num(0.1), "0.1");
    }

    #[test]
    fn duration_axis_ticks_use_clock_format() {
        assert_eq!(x_tick_label(PointField::Duration, 0.0), None);
        assert_eq!(
            x_tick_label(PointField::Duration, 3_600_000.0),
            Some("01:00:00".to_string())
        );
        assert_eq!(x_tick_label(PointField::Dist, 2.5), Some("2.5".to_string()));
    }

    #[test]
    fn hex_colors_parse_in_both_widths() {
        let c: Rgba = "#3366CC".parse().unwrap();
        assert_eq!((c.r, c.g, c.b), (0x33, 0x66, 0xCC));
        let c: Rgba = "#F00".parse().unwrap();
        assert_eq!((c.r, c.g, c.b), (255, 0, 0));
        assert_eq!(c.with_alpha(0.5).css(), "rgba(255,0,0,0.5)");
        assert!("red".parse::<Rgba>().is_err());
        assert!("#GG0011".parse::<Rgba>().is_err());
        assert!("#12345".parse::<Rgba>().is_err());
    }

    #[test]
    fn custom_palette_overrides_theme_and_is_validated() {
        let options = ChartOptions {
            custom_palette: Some(Theme {
                area: "#112233".to_string(),
                alpha: 0.5,
                stroke: "#445566".to_string(),
            }),
            ..mk_options()
        };
        let profile = ElevationProfile::new(options).unwrap();
        let area = &profile.chart().areas()[0];
        assert_eq!(area.color, "#112233");
        assert_eq!(area.stroke, "#445566");

        let bad = ChartOptions {
            custom_palette: Some(Theme {
                area: "magenta".to_string(),
                alpha: 0.5,
                stroke: "#000".to_string(),
            }),
            ..mk_options()
        };
        assert!(matches!(
            ElevationProfile::new(bad),
            Err(ChartError::InvalidColor(_))
        ));
    }
}
