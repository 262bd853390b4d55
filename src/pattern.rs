// src/pattern.rs
//
// Pattern capability and the class-name registry.
//
// A pattern is a per-channel generator: it advances by scaled frame time
// and renders into the channel's color buffer. The engine core treats
// patterns as black boxes; the built-ins here exist for the demo binary,
// for default channels, and for tests.

use std::collections::HashMap;

use log::warn;
use serde_json::{Value, json};

use crate::color::{self, Argb};

/// A per-channel color generator.
pub trait Pattern: Send {
    /// Stable class name, used to reconstruct the pattern on load.
    fn class_name(&self) -> &'static str;

    /// Advance animation time by `delta_ms` (already speed-scaled).
    fn advance(&mut self, delta_ms: f64);

    /// Render the current frame into `colors`.
    fn render(&mut self, colors: &mut [Argb]);

    /// Pattern-specific state for persistence.
    fn save(&self) -> Value {
        json!({})
    }

    fn load(&mut self, _obj: &Value) {}
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

type PatternCtor = Box<dyn Fn() -> Box<dyn Pattern> + Send + Sync>;

/// Creates pattern instances from their class names.
///
/// Only used while loading a project; unknown class names are skipped
/// with a warning.
pub struct PatternRegistry {
    factories: HashMap<&'static str, PatternCtor>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry pre-loaded with the stock patterns.
    pub fn with_standard() -> Self {
        let mut registry = Self::new();
        registry.register("Solid", || Box::new(SolidPattern::default()));
        registry.register("Chase", || Box::new(ChasePattern::default()));
        registry.register("Gradient", || Box::new(GradientPattern::default()));
        registry
    }

    pub fn register(
        &mut self,
        class_name: &'static str,
        ctor: impl Fn() -> Box<dyn Pattern> + Send + Sync + 'static,
    ) {
        self.factories.insert(class_name, Box::new(ctor));
    }

    /// Instantiate a pattern by class name.
    pub fn create(&self, class_name: &str) -> Option<Box<dyn Pattern>> {
        match self.factories.get(class_name) {
            Some(ctor) => Some(ctor()),
            None => {
                warn!("unknown pattern class '{class_name}', skipping");
                None
            }
        }
    }
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::with_standard()
    }
}

// ───────────────────────────────────────────────────────────────────
// Stock patterns
// ───────────────────────────────────────────────────────────────────

/// Every point one constant color.
pub struct SolidPattern {
    pub color: Argb,
}

impl SolidPattern {
    pub fn new(color: Argb) -> Self {
        Self { color }
    }
}

impl Default for SolidPattern {
    fn default() -> Self {
        Self::new(color::WHITE)
    }
}

impl Pattern for SolidPattern {
    fn class_name(&self) -> &'static str {
        "Solid"
    }

    fn advance(&mut self, _delta_ms: f64) {}

    fn render(&mut self, colors: &mut [Argb]) {
        colors.fill(self.color);
    }

    fn save(&self) -> Value {
        json!({ "color": self.color })
    }

    fn load(&mut self, obj: &Value) {
        if let Some(c) = obj.get("color").and_then(Value::as_u64) {
            self.color = c as Argb;
        }
    }
}

/// A single lit point sweeping the strip.
pub struct ChasePattern {
    pub color: Argb,
    pub period_ms: f64,
    position: f64,
}

impl ChasePattern {
    pub fn new(color: Argb, period_ms: f64) -> Self {
        Self {
            color,
            period_ms,
            position: 0.0,
        }
    }
}

impl Default for ChasePattern {
    fn default() -> Self {
        Self::new(color::WHITE, 1000.0)
    }
}

impl Pattern for ChasePattern {
    fn class_name(&self) -> &'static str {
        "Chase"
    }

    fn advance(&mut self, delta_ms: f64) {
        if self.period_ms > 0.0 {
            self.position = (self.position + delta_ms / self.period_ms).fract();
        }
    }

    fn render(&mut self, colors: &mut [Argb]) {
        colors.fill(color::BLACK);
        if !colors.is_empty() {
            let index = ((self.position * colors.len() as f64) as usize).min(colors.len() - 1);
            colors[index] = self.color;
        }
    }

    fn save(&self) -> Value {
        json!({ "color": self.color, "periodMs": self.period_ms })
    }

    fn load(&mut self, obj: &Value) {
        if let Some(c) = obj.get("color").and_then(Value::as_u64) {
            self.color = c as Argb;
        }
        if let Some(p) = obj.get("periodMs").and_then(Value::as_f64) {
            self.period_ms = p;
        }
    }
}

/// A hue ramp rotating along the strip.
pub struct GradientPattern {
    pub period_ms: f64,
    phase: f64,
}

impl GradientPattern {
    pub fn new(period_ms: f64) -> Self {
        Self {
            period_ms,
            phase: 0.0,
        }
    }
}

impl Default for GradientPattern {
    fn default() -> Self {
        Self::new(5000.0)
    }
}

impl Pattern for GradientPattern {
    fn class_name(&self) -> &'static str {
        "Gradient"
    }

    fn advance(&mut self, delta_ms: f64) {
        if self.period_ms > 0.0 {
            self.phase = (self.phase + delta_ms / self.period_ms).fract();
        }
    }

    fn render(&mut self, colors: &mut [Argb]) {
        let n = colors.len();
        for (i, c) in colors.iter_mut().enumerate() {
            let hue = (self.phase + i as f64 / n as f64).fract() * 360.0;
            *c = color::hsb(hue, 100.0, 100.0);
        }
    }

    fn save(&self) -> Value {
        json!({ "periodMs": self.period_ms })
    }

    fn load(&mut self, obj: &Value) {
        if let Some(p) = obj.get("periodMs").and_then(Value::as_f64) {
            self.period_ms = p;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::rgb;

    #[test]
    fn test_solid_renders_constant() {
        let mut p = SolidPattern::new(rgb(255, 0, 0));
        let mut buf = vec![color::BLACK; 8];
        p.advance(16.0);
        p.render(&mut buf);
        assert!(buf.iter().all(|&c| c == rgb(255, 0, 0)));
    }

    #[test]
    fn test_chase_moves() {
        let mut p = ChasePattern::new(rgb(0, 0, 255), 100.0);
        let mut buf = vec![color::BLACK; 10];
        p.render(&mut buf);
        assert_eq!(buf[0], rgb(0, 0, 255));

        p.advance(50.0);
        p.render(&mut buf);
        assert_eq!(buf[5], rgb(0, 0, 255));
        assert_eq!(buf[0], color::BLACK);
    }

    #[test]
    fn test_registry_round_trip() {
        let registry = PatternRegistry::with_standard();
        let mut original = SolidPattern::new(rgb(1, 2, 3));
        let saved = original.save();

        let mut restored = registry.create(original.class_name()).unwrap();
        restored.load(&saved);

        let mut a = vec![color::BLACK; 4];
        let mut b = vec![color::BLACK; 4];
        original.render(&mut a);
        restored.render(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_registry_unknown_class() {
        let registry = PatternRegistry::with_standard();
        assert!(registry.create("NoSuchPattern").is_none());
    }
}
