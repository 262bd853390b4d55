// src/parameter.rs
//
// Typed, observable parameters.
//
// Every knob in the engine is one of these: a bounded real, a compound
// real with layered modulation, a boolean, a discrete integer, an
// enumerated choice, or a selection from a fixed set of owned objects.
// Parameters notify listeners synchronously on the mutating thread and
// belong to exactly one owning component, identified by a stable
// slash-separated path. Binding a parameter to a second owner is a
// contract violation.

use std::fmt;
use std::sync::Arc;

use crate::error::EngineError;

/// Value orientation, for UI and modulation mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    #[default]
    Unipolar,
    Bipolar,
}

/// Unit metadata for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Units {
    #[default]
    None,
    /// Milliseconds
    Ms,
    /// Seconds
    Seconds,
    /// Percentage (0-100)
    Percent,
    /// Frames per second
    Fps,
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::None => Ok(()),
            Units::Ms => write!(f, "ms"),
            Units::Seconds => write!(f, "s"),
            Units::Percent => write!(f, "%"),
            Units::Fps => write!(f, "fps"),
        }
    }
}

/// Identifier returned by listener registration, used for removal.
pub type ListenerId = u64;

/// A list of change listeners, invoked synchronously in registration order.
pub struct Listeners<T> {
    next: ListenerId,
    entries: Vec<(ListenerId, Box<dyn FnMut(T) + Send>)>,
}

impl<T: Copy> Listeners<T> {
    fn new() -> Self {
        Self {
            next: 0,
            entries: Vec::new(),
        }
    }

    fn add(&mut self, listener: Box<dyn FnMut(T) + Send>) -> ListenerId {
        let id = self.next;
        self.next += 1;
        self.entries.push((id, listener));
        id
    }

    fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(lid, _)| *lid != id);
        self.entries.len() != before
    }

    fn notify(&mut self, value: T) {
        for (_, listener) in &mut self.entries {
            listener(value);
        }
    }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listeners({})", self.entries.len())
    }
}

/// One-shot component binding: a parameter acquires its owner path once.
#[derive(Debug, Default)]
struct Binding {
    path: Option<String>,
}

impl Binding {
    fn bind(&mut self, label: &str, path: String) -> Result<(), EngineError> {
        if self.path.is_some() {
            return Err(EngineError::ParameterRebound(label.to_string()));
        }
        self.path = Some(path);
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Bounded real
// ───────────────────────────────────────────────────────────────────

/// A real-valued parameter clamped to [min, max].
pub struct BoundedParameter {
    label: String,
    value: f64,
    min: f64,
    max: f64,
    polarity: Polarity,
    units: Units,
    binding: Binding,
    listeners: Listeners<f64>,
}

impl BoundedParameter {
    pub fn new(label: impl Into<String>, default: f64, min: f64, max: f64) -> Self {
        Self {
            label: label.into(),
            value: default.clamp(min, max),
            min,
            max,
            polarity: Polarity::Unipolar,
            units: Units::None,
            binding: Binding::default(),
            listeners: Listeners::new(),
        }
    }

    pub fn polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = polarity;
        self
    }

    pub fn units(mut self, units: Units) -> Self {
        self.units = units;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn get_polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn get_units(&self) -> Units {
        self.units
    }

    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    /// Set the value, clamped to range. Setting the current value is
    /// silent; use `bang` to force notification.
    pub fn set_value(&mut self, value: f64) {
        let clamped = value.clamp(self.min, self.max);
        if clamped != self.value {
            self.value = clamped;
            self.listeners.notify(clamped);
        }
    }

    #[inline]
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Single-precision accessor.
    #[inline]
    pub fn valuef(&self) -> f32 {
        self.value as f32
    }

    pub fn normalized(&self) -> f64 {
        if self.max == self.min {
            0.0
        } else {
            (self.value - self.min) / (self.max - self.min)
        }
    }

    pub fn set_normalized(&mut self, normalized: f64) {
        self.set_value(self.min + normalized.clamp(0.0, 1.0) * (self.max - self.min));
    }

    /// Notify listeners of the current value without changing it.
    pub fn bang(&mut self) {
        self.listeners.notify(self.value);
    }

    /// Bind this parameter to its owning component path. One-shot.
    pub fn bind(&mut self, path: impl Into<String>) -> Result<(), EngineError> {
        self.binding.bind(&self.label, path.into())
    }

    pub fn path(&self) -> Option<&str> {
        self.binding.path.as_deref()
    }

    pub fn add_listener(&mut self, listener: Box<dyn FnMut(f64) + Send>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

impl fmt::Debug for BoundedParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BoundedParameter({} = {} in [{}, {}])",
            self.label, self.value, self.min, self.max
        )
    }
}

// ───────────────────────────────────────────────────────────────────
// Compound real (bounded + layered modulation)
// ───────────────────────────────────────────────────────────────────

/// A modulation layer: an external signal scaled by a depth.
///
/// Compound parameters do not own their modulation sources, they only
/// read from them.
pub struct ModulationInput {
    pub depth: f64,
    pub signal: Arc<dyn Fn() -> f64 + Send + Sync>,
}

/// A bounded parameter whose effective value layers modulation inputs
/// over the base value.
pub struct CompoundParameter {
    base: BoundedParameter,
    mods: Vec<ModulationInput>,
}

impl CompoundParameter {
    pub fn new(label: impl Into<String>, default: f64, min: f64, max: f64) -> Self {
        Self {
            base: BoundedParameter::new(label, default, min, max),
            mods: Vec::new(),
        }
    }

    pub fn polarity(mut self, polarity: Polarity) -> Self {
        self.base = self.base.polarity(polarity);
        self
    }

    /// Attach a modulation layer.
    pub fn add_modulation(&mut self, depth: f64, signal: Arc<dyn Fn() -> f64 + Send + Sync>) {
        self.mods.push(ModulationInput { depth, signal });
    }

    pub fn clear_modulation(&mut self) {
        self.mods.clear();
    }

    /// Effective value: base plus modulation, clamped to the base range.
    pub fn value(&self) -> f64 {
        let mut v = self.base.value();
        for m in &self.mods {
            v += (m.signal)() * m.depth;
        }
        let (min, max) = self.base.range();
        v.clamp(min, max)
    }

    #[inline]
    pub fn valuef(&self) -> f32 {
        self.value() as f32
    }

    /// The unmodulated base parameter.
    pub fn base(&self) -> &BoundedParameter {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut BoundedParameter {
        &mut self.base
    }

    pub fn set_value(&mut self, value: f64) {
        self.base.set_value(value);
    }
}

impl fmt::Debug for CompoundParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CompoundParameter({} = {}, {} mods)",
            self.base.label,
            self.value(),
            self.mods.len()
        )
    }
}

// ───────────────────────────────────────────────────────────────────
// Boolean
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct BooleanParameter {
    label: String,
    value: bool,
    binding: Binding,
    listeners: Listeners<bool>,
}

impl BooleanParameter {
    pub fn new(label: impl Into<String>, default: bool) -> Self {
        Self {
            label: label.into(),
            value: default,
            binding: Binding::default(),
            listeners: Listeners::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Set the value. Same-value writes are silent, which keeps
    /// listener-driven cascades finite.
    pub fn set_value(&mut self, value: bool) {
        if value != self.value {
            self.value = value;
            self.listeners.notify(value);
        }
    }

    #[inline]
    pub fn is_on(&self) -> bool {
        self.value
    }

    pub fn toggle(&mut self) {
        self.set_value(!self.value);
    }

    pub fn bang(&mut self) {
        self.listeners.notify(self.value);
    }

    pub fn bind(&mut self, path: impl Into<String>) -> Result<(), EngineError> {
        self.binding.bind(&self.label, path.into())
    }

    pub fn path(&self) -> Option<&str> {
        self.binding.path.as_deref()
    }

    pub fn add_listener(&mut self, listener: Box<dyn FnMut(bool) + Send>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Discrete integer in [0, cardinality)
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DiscreteParameter {
    label: String,
    value: usize,
    cardinality: usize,
    binding: Binding,
    listeners: Listeners<usize>,
}

impl DiscreteParameter {
    /// `cardinality` is the exclusive upper bound; it must be nonzero.
    pub fn new(label: impl Into<String>, default: usize, cardinality: usize) -> Self {
        debug_assert!(cardinality > 0, "discrete parameter needs at least one value");
        Self {
            label: label.into(),
            value: default.min(cardinality - 1),
            cardinality,
            binding: Binding::default(),
            listeners: Listeners::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    /// Set from a real value: rounds to the nearest integer, clamped to
    /// [0, cardinality).
    pub fn set_value(&mut self, value: f64) {
        let rounded = value.round().max(0.0) as usize;
        self.set_index(rounded);
    }

    pub fn set_index(&mut self, index: usize) {
        let clamped = index.min(self.cardinality - 1);
        if clamped != self.value {
            self.value = clamped;
            self.listeners.notify(clamped);
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.value
    }

    #[inline]
    pub fn value(&self) -> f64 {
        self.value as f64
    }

    #[inline]
    pub fn valuef(&self) -> f32 {
        self.value as f32
    }

    /// Grow or shrink the range, clamping the current value into it.
    /// A clamp that moves the value notifies listeners.
    pub fn set_cardinality(&mut self, cardinality: usize) {
        debug_assert!(cardinality > 0, "discrete parameter needs at least one value");
        self.cardinality = cardinality;
        if self.value >= cardinality {
            self.value = cardinality - 1;
            self.listeners.notify(self.value);
        }
    }

    pub fn bang(&mut self) {
        self.listeners.notify(self.value);
    }

    pub fn bind(&mut self, path: impl Into<String>) -> Result<(), EngineError> {
        self.binding.bind(&self.label, path.into())
    }

    pub fn path(&self) -> Option<&str> {
        self.binding.path.as_deref()
    }

    pub fn add_listener(&mut self, listener: Box<dyn FnMut(usize) + Send>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Enumerated choice
// ───────────────────────────────────────────────────────────────────

/// One of a fixed set of named values.
pub struct EnumParameter<T: Copy + PartialEq + Send + 'static> {
    label: String,
    value: T,
    options: Vec<(&'static str, T)>,
    binding: Binding,
    listeners: Listeners<T>,
}

impl<T: Copy + PartialEq + Send + 'static> EnumParameter<T> {
    pub fn new(label: impl Into<String>, default: T, options: Vec<(&'static str, T)>) -> Self {
        debug_assert!(options.iter().any(|(_, v)| *v == default));
        Self {
            label: label.into(),
            value: default,
            options,
            binding: Binding::default(),
            listeners: Listeners::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_value(&mut self, value: T) {
        if value != self.value {
            self.value = value;
            self.listeners.notify(value);
        }
    }

    #[inline]
    pub fn value(&self) -> T {
        self.value
    }

    /// Name of the current value, for persistence and display.
    pub fn value_label(&self) -> &'static str {
        self.options
            .iter()
            .find(|(_, v)| *v == self.value)
            .map(|(name, _)| *name)
            .unwrap_or("?")
    }

    /// Look up an option by name, for persistence.
    pub fn from_label(&self, name: &str) -> Option<T> {
        self.options
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    pub fn bang(&mut self) {
        self.listeners.notify(self.value);
    }

    pub fn bind(&mut self, path: impl Into<String>) -> Result<(), EngineError> {
        self.binding.bind(&self.label, path.into())
    }

    pub fn path(&self) -> Option<&str> {
        self.binding.path.as_deref()
    }

    pub fn add_listener(&mut self, listener: Box<dyn FnMut(T) + Send>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

impl<T: Copy + PartialEq + Send + fmt::Debug + 'static> fmt::Debug for EnumParameter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnumParameter({} = {:?})", self.label, self.value)
    }
}

// ───────────────────────────────────────────────────────────────────
// Object selection
// ───────────────────────────────────────────────────────────────────

/// A pointer to one of a fixed set of owned instances.
///
/// Used for blend-mode selection: the parameter owns the option set and
/// exposes the selected instance.
pub struct ObjectParameter<T: ?Sized + Send + Sync> {
    label: String,
    index: usize,
    objects: Vec<Arc<T>>,
    binding: Binding,
    listeners: Listeners<usize>,
}

impl<T: ?Sized + Send + Sync> ObjectParameter<T> {
    pub fn new(label: impl Into<String>, objects: Vec<Arc<T>>) -> Self {
        debug_assert!(!objects.is_empty(), "object parameter needs options");
        Self {
            label: label.into(),
            index: 0,
            objects,
            binding: Binding::default(),
            listeners: Listeners::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_index(&mut self, index: usize) {
        let clamped = index.min(self.objects.len() - 1);
        if clamped != self.index {
            self.index = clamped;
            self.listeners.notify(clamped);
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// The selected instance.
    #[inline]
    pub fn selected(&self) -> &Arc<T> {
        &self.objects[self.index]
    }

    pub fn objects(&self) -> &[Arc<T>] {
        &self.objects
    }

    pub fn bang(&mut self) {
        self.listeners.notify(self.index);
    }

    pub fn bind(&mut self, path: impl Into<String>) -> Result<(), EngineError> {
        self.binding.bind(&self.label, path.into())
    }

    pub fn path(&self) -> Option<&str> {
        self.binding.path.as_deref()
    }

    pub fn add_listener(&mut self, listener: Box<dyn FnMut(usize) + Send>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}
