// Shared types module - Common types used across multiple modules
use serde::{Deserialize, Serialize};

/// The closed set of shapes the cloud can morph into. Every match over
/// Mode must be exhaustive so a new variant cannot slip through unhandled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Tree,
    Heart,
    Scatter,
    Saturn,
    Flower,
    Dna,
    Sphere,
}

impl Mode {
    pub fn all() -> [Mode; 7] {
        [
            Mode::Tree,
            Mode::Heart,
            Mode::Scatter,
            Mode::Saturn,
            Mode::Flower,
            Mode::Dna,
            Mode::Sphere,
        ]
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tree" => Some(Mode::Tree),
            "heart" => Some(Mode::Heart),
            "scatter" | "cloud" => Some(Mode::Scatter),
            "saturn" | "planet" => Some(Mode::Saturn),
            "flower" | "rose" => Some(Mode::Flower),
            "dna" | "helix" | "ribbon" => Some(Mode::Dna),
            "sphere" | "ball" => Some(Mode::Sphere),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Tree => "tree",
            Mode::Heart => "heart",
            Mode::Scatter => "scatter",
            Mode::Saturn => "saturn",
            Mode::Flower => "flower",
            Mode::Dna => "dna",
            Mode::Sphere => "sphere",
        }
    }

    pub fn next(&self) -> Self {
        let all = Mode::all();
        let idx = all.iter().position(|m| m == self).unwrap_or(0);
        all[(idx + 1) % all.len()]
    }

    /// Keyboard shortcut mapping: digits 1-7 in the order of `all()`.
    pub fn from_digit(d: char) -> Option<Self> {
        let idx = d.to_digit(10)? as usize;
        if idx == 0 {
            return None;
        }
        Mode::all().get(idx - 1).copied()
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One visually distinct particle population. Each role has its own buffer
/// sizes, damping and palette rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Main,
    Ribbon,
    Ambient,
}

impl GroupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupRole::Main => "main",
            GroupRole::Ribbon => "ribbon",
            GroupRole::Ambient => "ambient",
        }
    }
}

// Linear RGB color with float channels so live color buffers can blend
// smoothly. Packed as three f32 per particle in the websocket frame stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rgb {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb { r: 1.0, g: 1.0, b: 1.0 };

    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Rgb { r, g, b }
    }

    /// HSL to RGB, h/s/l all in 0..1. Hue wraps.
    pub fn from_hsl(h: f32, s: f32, l: f32) -> Self {
        let h = h.rem_euclid(1.0);
        let s = s.clamp(0.0, 1.0);
        let l = l.clamp(0.0, 1.0);
        if s == 0.0 {
            return Rgb::new(l, l, l);
        }
        let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
        let p = 2.0 * l - q;
        let hue = |mut t: f32| {
            t = t.rem_euclid(1.0);
            if t < 1.0 / 6.0 {
                p + (q - p) * 6.0 * t
            } else if t < 0.5 {
                q
            } else if t < 2.0 / 3.0 {
                p + (q - p) * (2.0 / 3.0 - t) * 6.0
            } else {
                p
            }
        };
        Rgb::new(hue(h + 1.0 / 3.0), hue(h), hue(h - 1.0 / 3.0))
    }

    /// Bounded lightness jitter: delta added to each channel and clamped.
    pub fn offset_lightness(&self, delta: f32) -> Self {
        Rgb::new(
            (self.r + delta).clamp(0.0, 1.0),
            (self.g + delta).clamp(0.0, 1.0),
            (self.b + delta).clamp(0.0, 1.0),
        )
    }

    pub fn is_finite(&self) -> bool {
        self.r.is_finite() && self.g.is_finite() && self.b.is_finite()
    }
}

/// One hand-pose classification as produced by the recognizer (or by the
/// browser-side classifier over the gesture websocket). Ephemeral: consumed
/// the tick it arrives, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GestureEvent {
    pub category: String,
    pub confidence: f32,
    #[serde(default)]
    pub hand_index: usize,
    #[serde(default)]
    pub timestamp_ms: u64,
}
