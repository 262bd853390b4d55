// src/effect.rs
//
// Effect capability and the class-name registry.
//
// Effects post-process a color buffer in place: channels apply their
// effect chain after the pattern renders, and the master channel applies
// its chain to the final mixed output.

use std::collections::HashMap;

use log::warn;
use serde_json::{Value, json};

use crate::color::{self, Argb};

/// An in-place buffer post-processor.
pub trait Effect: Send {
    /// Stable class name, used to reconstruct the effect on load.
    fn class_name(&self) -> &'static str;

    /// Advance animation time by `delta_ms` (already speed-scaled).
    fn advance(&mut self, delta_ms: f64);

    /// Transform `colors` in place.
    fn apply(&mut self, colors: &mut [Argb]);

    fn save(&self) -> Value {
        json!({})
    }

    fn load(&mut self, _obj: &Value) {}
}

type EffectCtor = Box<dyn Fn() -> Box<dyn Effect> + Send + Sync>;

/// Creates effect instances from their class names during load.
pub struct EffectRegistry {
    factories: HashMap<&'static str, EffectCtor>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_standard() -> Self {
        let mut registry = Self::new();
        registry.register("Invert", || Box::new(InvertEffect));
        registry.register("Desaturate", || Box::new(DesaturateEffect::default()));
        registry
    }

    pub fn register(
        &mut self,
        class_name: &'static str,
        ctor: impl Fn() -> Box<dyn Effect> + Send + Sync + 'static,
    ) {
        self.factories.insert(class_name, Box::new(ctor));
    }

    pub fn create(&self, class_name: &str) -> Option<Box<dyn Effect>> {
        match self.factories.get(class_name) {
            Some(ctor) => Some(ctor()),
            None => {
                warn!("unknown effect class '{class_name}', skipping");
                None
            }
        }
    }
}

impl Default for EffectRegistry {
    fn default() -> Self {
        Self::with_standard()
    }
}

/// Inverts every RGB component.
pub struct InvertEffect;

impl Effect for InvertEffect {
    fn class_name(&self) -> &'static str {
        "Invert"
    }

    fn advance(&mut self, _delta_ms: f64) {}

    fn apply(&mut self, colors: &mut [Argb]) {
        for c in colors.iter_mut() {
            *c = color::rgb(
                255 - color::red(*c),
                255 - color::green(*c),
                255 - color::blue(*c),
            );
        }
    }
}

/// Pulls saturation toward gray by a fixed amount.
pub struct DesaturateEffect {
    pub amount: f64,
}

impl DesaturateEffect {
    pub fn new(amount: f64) -> Self {
        Self {
            amount: amount.clamp(0.0, 1.0),
        }
    }
}

impl Default for DesaturateEffect {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Effect for DesaturateEffect {
    fn class_name(&self) -> &'static str {
        "Desaturate"
    }

    fn advance(&mut self, _delta_ms: f64) {}

    fn apply(&mut self, colors: &mut [Argb]) {
        for c in colors.iter_mut() {
            let (h, s, v) = color::to_hsb(*c);
            *c = color::hsb(h, s * (1.0 - self.amount), v);
        }
    }

    fn save(&self) -> Value {
        json!({ "amount": self.amount })
    }

    fn load(&mut self, obj: &Value) {
        if let Some(a) = obj.get("amount").and_then(Value::as_f64) {
            self.amount = a.clamp(0.0, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::rgb;

    #[test]
    fn test_invert() {
        let mut buf = vec![rgb(0, 255, 10); 3];
        InvertEffect.apply(&mut buf);
        assert!(buf.iter().all(|&c| c == rgb(255, 0, 245)));
    }

    #[test]
    fn test_full_desaturate_is_gray() {
        let mut buf = vec![rgb(255, 0, 0); 2];
        DesaturateEffect::new(1.0).apply(&mut buf);
        assert!(buf.iter().all(|&c| c == rgb(255, 255, 255)));
    }

    #[test]
    fn test_registry_creates() {
        let registry = EffectRegistry::with_standard();
        assert!(registry.create("Invert").is_some());
        assert!(registry.create("NoSuchEffect").is_none());
    }
}
