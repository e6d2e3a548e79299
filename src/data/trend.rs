//! Piecewise-linear trend of a sensor's readings.
//!
//! Each sensor's `(elapsed_s, value)` series is cut into straight segments. An
//! open segment buffers points; once it holds more than `min_points` fresh
//! points it is fitted by least squares after every update. The segment is
//! closed when the fit's largest residual exceeds `threshold` or the segment
//! grows past `max_points`:
//!
//! ```text
//!  closed: [first, second-to-last]-----+ new point
//!                                      |
//!  next:   anchor = fit(second-to-last) + new point ...
//! ```
//!
//! A closed segment is compressed to three anchors. The next segment starts
//! from the fitted second-to-last point and its line is constrained through
//! that anchor, so consecutive segments join without a jump. The anchor is
//! shared, not counted as a fresh point.
//!
//! A segment whose very first fit already exceeds the threshold is closed at
//! once with [`ClosureReason::NoFit`]. Its recorded line is the best fit of the
//! points before the newest one, and `max_residual` reports how far that line
//! misses them. Segments closed with [`ClosureReason::Residual`] always carry
//! their last accepted fit, which is within `threshold`.

use crate::config::TrendConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Straight line `y = slope·x + intercept`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineFit {
    /// Slope
    pub slope: f64,
    /// Intercept at x = 0
    pub intercept: f64,
}

impl LineFit {
    /// Horizontal line.
    pub fn flat(y: f64) -> Self {
        Self {
            slope: 0.0,
            intercept: y,
        }
    }

    /// Line value at `x`.
    pub fn value_at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }

    /// Ordinary least-squares fit; `None` for fewer than two distinct x values.
    pub fn least_squares(points: &[(f64, f64)]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }
        let n = points.len() as f64;
        let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
        let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

        let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
        let sxy: f64 = points
            .iter()
            .map(|p| (p.0 - mean_x) * (p.1 - mean_y))
            .sum();
        if sxx <= 0.0 || !sxx.is_finite() {
            return None;
        }

        let slope = sxy / sxx;
        Some(Self {
            slope,
            intercept: mean_y - slope * mean_x,
        })
    }

    /// Least-squares fit constrained through `anchor`.
    pub fn through(anchor: (f64, f64), points: &[(f64, f64)]) -> Option<Self> {
        let (ax, ay) = anchor;
        let sxx: f64 = points.iter().map(|p| (p.0 - ax).powi(2)).sum();
        let sxy: f64 = points.iter().map(|p| (p.0 - ax) * (p.1 - ay)).sum();
        if sxx <= 0.0 || !sxx.is_finite() {
            return None;
        }

        let slope = sxy / sxx;
        Some(Self {
            slope,
            intercept: ay - slope * ax,
        })
    }

    /// Largest absolute residual of `points` against this line.
    pub fn max_residual(&self, points: &[(f64, f64)]) -> f64 {
        points
            .iter()
            .map(|&(x, y)| (y - self.value_at(x)).abs())
            .fold(0.0, f64::max)
    }
}

/// Why a segment was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosureReason {
    /// The refit including the newest point exceeded the residual threshold.
    Residual,
    /// The segment's first fit already exceeded the residual threshold.
    NoFit,
    /// The segment reached its maximum size.
    MaxPoints,
}

/// A finished segment, compressed to its anchors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrendSegment {
    /// Index of the segment's first point in the sensor's series
    pub start: usize,
    /// One past the segment's last point; the next segment starts at `end - 1`
    pub end: usize,
    /// First point, second-to-last point (both on the fit) and the point that closed it
    pub anchors: [(f64, f64); 3],
    /// Line fitted over `start..end`
    pub fit: LineFit,
    /// Largest residual of `fit` over the segment's points
    pub max_residual: f64,
    /// What closed the segment
    pub reason: ClosureReason,
}

/// Outcome of feeding one point.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrendUpdate {
    /// Index of the point in the series
    pub index: usize,
    /// Trend value at the point, when the open segment has an accepted fit
    pub fitted: Option<f64>,
    /// Segment closed by this point
    pub closed: Option<TrendSegment>,
}

/// Visible x range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlotRange {
    /// Left edge
    pub start: f64,
    /// Right edge (latest x)
    pub end: f64,
}

#[derive(Clone, Debug)]
struct OpenSegment {
    start: usize,
    points: Vec<(f64, f64)>,
    anchored: bool,
    fit: Option<LineFit>,
}

impl OpenSegment {
    fn starting_at(start: usize) -> Self {
        Self {
            start,
            points: Vec::new(),
            anchored: false,
            fit: None,
        }
    }

    fn fresh(&self) -> usize {
        self.points.len() - usize::from(self.anchored)
    }

    fn fit_points(points: &[(f64, f64)], anchored: bool) -> Option<LineFit> {
        match points.split_first() {
            Some((&anchor, rest)) if anchored => LineFit::through(anchor, rest),
            _ => LineFit::least_squares(points),
        }
    }

    /// Closes the segment before its newest point and opens the next one.
    fn close(self, reason: ClosureReason) -> (TrendSegment, OpenSegment) {
        let n = self.points.len();
        let newest = self.points[n - 1];
        let body = &self.points[..n - 1];

        let fit = self
            .fit
            .or_else(|| Self::fit_points(body, self.anchored))
            .unwrap_or_else(|| {
                if self.anchored {
                    LineFit::flat(body[0].1)
                } else {
                    LineFit::flat(body.iter().map(|p| p.1).sum::<f64>() / body.len() as f64)
                }
            });

        let first = body[0].0;
        let last = body[body.len() - 1].0;
        let join = (last, fit.value_at(last));
        let segment = TrendSegment {
            start: self.start,
            end: self.start + n - 1,
            anchors: [(first, fit.value_at(first)), join, newest],
            fit,
            max_residual: fit.max_residual(body),
            reason,
        };
        let next = OpenSegment {
            start: self.start + n - 2,
            points: vec![join, newest],
            anchored: true,
            fit: None,
        };
        (segment, next)
    }
}

/// Trend of one sensor.
#[derive(Clone, Debug, Default)]
pub struct SensorTrend {
    closed: Vec<TrendSegment>,
    open: Option<OpenSegment>,
    total: usize,
    range: Option<PlotRange>,
}

impl SensorTrend {
    /// Appends a point and re-segments if needed.
    pub fn update(&mut self, x: f64, y: f64, config: &TrendConfig) -> TrendUpdate {
        let index = self.total;
        self.total += 1;

        let mut open = self
            .open
            .take()
            .unwrap_or_else(|| OpenSegment::starting_at(index));
        open.points.push((x, y));

        let mut closed = None;
        if open.fresh() > config.min_points {
            let accepted = OpenSegment::fit_points(&open.points, open.anchored)
                .filter(|fit| fit.max_residual(&open.points) <= config.threshold);

            if open.fresh() > config.max_points {
                closed = Some(open.close(ClosureReason::MaxPoints));
            } else if accepted.is_some() {
                open.fit = accepted;
                self.open = Some(open);
            } else if open.fit.is_some() {
                closed = Some(open.close(ClosureReason::Residual));
            } else {
                closed = Some(open.close(ClosureReason::NoFit));
            }
        } else {
            self.open = Some(open);
        }

        let closed = closed.map(|(segment, next)| {
            self.open = Some(next);
            self.closed.push(segment.clone());
            segment
        });

        self.slide_range(x, config.display_window);

        TrendUpdate {
            index,
            fitted: self
                .open
                .as_ref()
                .and_then(|o| o.fit)
                .map(|fit| fit.value_at(x)),
            closed,
        }
    }

    fn slide_range(&mut self, x: f64, window: f64) {
        let open_start = self
            .open
            .as_ref()
            .and_then(|o| o.points.first())
            .map_or(x, |p| p.0);
        let mut range = self.range.unwrap_or(PlotRange { start: x, end: x });
        range.end = x;
        if x - open_start > window {
            range.start = range.start.max(x - window);
        }
        self.range = Some(range);
    }

    /// Segments closed so far, oldest first.
    pub fn segments(&self) -> &[TrendSegment] {
        &self.closed
    }

    /// Segments including the open one.
    pub fn segment_count(&self) -> usize {
        self.closed.len() + usize::from(self.open.is_some())
    }

    /// Points fed so far.
    pub fn len(&self) -> usize {
        self.total
    }

    /// True before the first point.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Current fit of the open segment.
    pub fn current_fit(&self) -> Option<LineFit> {
        self.open.as_ref().and_then(|o| o.fit)
    }

    /// Range a plot should show.
    pub fn plot_range(&self) -> Option<PlotRange> {
        self.range
    }

    /// Compressed trend line inside the plot range.
    pub fn polyline(&self) -> Vec<(f64, f64)> {
        let mut line: Vec<(f64, f64)> = Vec::new();
        for segment in &self.closed {
            for &anchor in &segment.anchors[..2] {
                if line.last() != Some(&anchor) {
                    line.push(anchor);
                }
            }
        }
        if let Some(open) = &self.open {
            match open.fit {
                Some(fit) => {
                    for &(x, _) in [open.points.first(), open.points.last()]
                        .into_iter()
                        .flatten()
                    {
                        let point = (x, fit.value_at(x));
                        if line.last() != Some(&point) {
                            line.push(point);
                        }
                    }
                }
                None => line.extend(open.points.iter().skip(usize::from(open.anchored))),
            }
        }
        match self.range {
            Some(range) => line
                .into_iter()
                .filter(|p| p.0 >= range.start && p.0 <= range.end)
                .collect(),
            None => line,
        }
    }
}

/// Trends of every sensor, keyed by sensor identifier.
#[derive(Clone, Debug)]
pub struct TrendSegmenter {
    config: TrendConfig,
    series: BTreeMap<String, SensorTrend>,
}

impl TrendSegmenter {
    /// Creates an empty segmenter.
    pub fn new(config: TrendConfig) -> Self {
        Self {
            config,
            series: BTreeMap::new(),
        }
    }

    /// Feeds one reading of `sensor`.
    pub fn update(&mut self, sensor: &str, x: f64, y: f64) -> TrendUpdate {
        if !(x.is_finite() && y.is_finite()) {
            return TrendUpdate::default();
        }
        self.series
            .entry(sensor.to_string())
            .or_default()
            .update(x, y, &self.config)
    }

    /// Trend of `sensor`, if it has received points.
    pub fn series(&self, sensor: &str) -> Option<&SensorTrend> {
        self.series.get(sensor)
    }

    /// Segmentation parameters.
    pub fn config(&self) -> &TrendConfig {
        &self.config
    }

    /// Drops every series.
    pub fn reset(&mut self) {
        self.series.clear();
    }
}
