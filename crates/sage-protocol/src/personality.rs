//! Personality trait vector.
//!
//! Trait values live in `[0, 1]`. Fields are private and every mutation goes
//! through [`PersonalityTraits::adjust`] or [`PersonalityTraits::set`], both of
//! which clamp, so an out-of-range value can never be stored. Deserialization
//! clamps as well.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraitName {
    Formality,
    Verbosity,
    Warmth,
    Humor,
    Confidence,
}

impl TraitName {
    pub const ALL: [TraitName; 5] = [
        TraitName::Formality,
        TraitName::Verbosity,
        TraitName::Warmth,
        TraitName::Humor,
        TraitName::Confidence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Formality => "formality",
            Self::Verbosity => "verbosity",
            Self::Warmth => "warmth",
            Self::Humor => "humor",
            Self::Confidence => "confidence",
        }
    }
}

impl fmt::Display for TraitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleFlags {
    pub use_markdown: bool,
    pub use_emoji: bool,
    pub ask_clarifying_questions: bool,
}

impl Default for StyleFlags {
    fn default() -> Self {
        Self {
            use_markdown: true,
            use_emoji: false,
            ask_clarifying_questions: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "TraitsRepr", into = "TraitsRepr")]
pub struct PersonalityTraits {
    formality: f32,
    verbosity: f32,
    warmth: f32,
    humor: f32,
    confidence: f32,
    flags: StyleFlags,
}

impl Default for PersonalityTraits {
    fn default() -> Self {
        Self {
            formality: 0.5,
            verbosity: 0.5,
            warmth: 0.7,
            humor: 0.3,
            confidence: 0.6,
            flags: StyleFlags::default(),
        }
    }
}

impl PersonalityTraits {
    pub fn get(&self, name: TraitName) -> f32 {
        match name {
            TraitName::Formality => self.formality,
            TraitName::Verbosity => self.verbosity,
            TraitName::Warmth => self.warmth,
            TraitName::Humor => self.humor,
            TraitName::Confidence => self.confidence,
        }
    }

    /// Add `delta` to a trait, clamping the result into `[0, 1]`.
    /// Returns the new value.
    pub fn adjust(&mut self, name: TraitName, delta: f32) -> f32 {
        let current = self.get(name);
        let delta = if delta.is_finite() { delta } else { 0.0 };
        self.set(name, current + delta)
    }

    /// Set a trait to `value`, clamped into `[0, 1]`. Returns the stored value.
    pub fn set(&mut self, name: TraitName, value: f32) -> f32 {
        let value = clamp_unit(value);
        let slot = match name {
            TraitName::Formality => &mut self.formality,
            TraitName::Verbosity => &mut self.verbosity,
            TraitName::Warmth => &mut self.warmth,
            TraitName::Humor => &mut self.humor,
            TraitName::Confidence => &mut self.confidence,
        };
        *slot = value;
        value
    }

    pub fn flags(&self) -> StyleFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: StyleFlags) {
        self.flags = flags;
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        return 0.5;
    }
    value.clamp(0.0, 1.0)
}

#[derive(Serialize, Deserialize)]
struct TraitsRepr {
    formality: f32,
    verbosity: f32,
    warmth: f32,
    humor: f32,
    confidence: f32,
    #[serde(default)]
    flags: StyleFlags,
}

impl From<TraitsRepr> for PersonalityTraits {
    fn from(repr: TraitsRepr) -> Self {
        Self {
            formality: clamp_unit(repr.formality),
            verbosity: clamp_unit(repr.verbosity),
            warmth: clamp_unit(repr.warmth),
            humor: clamp_unit(repr.humor),
            confidence: clamp_unit(repr.confidence),
            flags: repr.flags,
        }
    }
}

impl From<PersonalityTraits> for TraitsRepr {
    fn from(traits: PersonalityTraits) -> Self {
        Self {
            formality: traits.formality,
            verbosity: traits.verbosity,
            warmth: traits.warmth,
            humor: traits.humor,
            confidence: traits.confidence,
            flags: traits.flags,
        }
    }
}
