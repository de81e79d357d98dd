//! Inverse-saturating normalizations
//!
//! Latencies, durations and counts live on `[0, inf)`. Before they leave the
//! machine they are mapped onto `(0, 1]` with `n = 1 / (1 + x / scale)`,
//! which has the exact inverse `x = scale * (1/n - 1)`.

/// An inverse-saturating mapping with a fixed scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Saturation {
    scale: f64,
}

/// Tool latency, 5 s maps to 0.5
pub const TOOL_LATENCY: Saturation = Saturation::new(5_000.0);

/// Command and team duration, one minute maps to 0.5
pub const TASK_DURATION: Saturation = Saturation::new(60_000.0);

/// Files touched by a command, 20 files map to 0.5
pub const FILE_COUNT: Saturation = Saturation::new(20.0);

impl Saturation {
    pub const fn new(scale: f64) -> Self {
        Self { scale }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Map `[0, inf)` onto `(0, 1]`. Negative and non-finite inputs are
    /// treated as zero.
    pub fn normalize(&self, raw: f64) -> f64 {
        let raw = if raw.is_finite() { raw.max(0.0) } else { 0.0 };
        1.0 / (1.0 + raw / self.scale)
    }

    /// Exact inverse of [`Saturation::normalize`]. Values outside `(0, 1]`
    /// are clamped first, so zero maps to `f64::INFINITY`.
    pub fn denormalize(&self, normalized: f64) -> f64 {
        let n = if normalized.is_nan() { 1.0 } else { normalized.clamp(0.0, 1.0) };
        if n == 0.0 {
            return f64::INFINITY;
        }
        self.scale * (1.0 / n - 1.0)
    }
}

/// Clamp a ratio to `[0, 1]`, mapping NaN to zero
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
