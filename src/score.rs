//! Score-context data model shared by all pipeline stages.
//!
//! The score context is created by the caller and mutated in place as the
//! pipeline advances: the duration stage rewrites phone start offsets, the
//! pitch stage attaches a [`ParamTag::Pitch`] parameter, and the variance
//! stage attaches one parameter per schema prediction.

use serde::Deserialize;

/// Closed set of parameter tags a score can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamTag {
    Pitch,
    F0,
    ToneShift,
    Expr,
    Gender,
    Velocity,
    Energy,
    Breathiness,
    Voicing,
    Tension,
    MouthOpening,
}

impl ParamTag {
    /// Tags a variance model may predict.
    pub const VARIANCE_TAGS: &'static [ParamTag] = &[
        ParamTag::Energy,
        ParamTag::Breathiness,
        ParamTag::Voicing,
        ParamTag::Tension,
        ParamTag::MouthOpening,
    ];

    /// Transition tags consumed directly by the acoustic model.
    pub const TRANSITION_TAGS: &'static [ParamTag] = &[ParamTag::Gender, ParamTag::Velocity];

    /// The tag's wire name, also used as the model input name.
    pub fn name(self) -> &'static str {
        match self {
            ParamTag::Pitch => "pitch",
            ParamTag::F0 => "f0",
            ParamTag::ToneShift => "tone_shift",
            ParamTag::Expr => "expr",
            ParamTag::Gender => "gender",
            ParamTag::Velocity => "velocity",
            ParamTag::Energy => "energy",
            ParamTag::Breathiness => "breathiness",
            ParamTag::Voicing => "voicing",
            ParamTag::Tension => "tension",
            ParamTag::MouthOpening => "mouth_opening",
        }
    }

    pub fn from_name(name: &str) -> Option<ParamTag> {
        Some(match name {
            "pitch" => ParamTag::Pitch,
            "f0" => ParamTag::F0,
            "tone_shift" => ParamTag::ToneShift,
            "expr" => ParamTag::Expr,
            "gender" => ParamTag::Gender,
            "velocity" => ParamTag::Velocity,
            "energy" => ParamTag::Energy,
            "breathiness" => ParamTag::Breathiness,
            "voicing" => ParamTag::Voicing,
            "tension" => ParamTag::Tension,
            "mouth_opening" => ParamTag::MouthOpening,
            _ => return None,
        })
    }
}

/// One speaker's share of a timbre mix.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeakerMix {
    pub name: String,
    pub proportion: f64,
}

/// A note inside a word.
#[derive(Debug, Clone, Deserialize)]
pub struct Note {
    /// Midi key number. Ignored for rests.
    pub key: i64,
    /// Cent offset from the midi key.
    #[serde(default)]
    pub cents: i64,
    /// Length in seconds.
    pub duration: f64,
    #[serde(default, rename = "rest")]
    pub is_rest: bool,
}

/// A phoneme instance inside a word, with timing.
#[derive(Debug, Clone, Deserialize)]
pub struct Phone {
    /// Phoneme name, looked up in the stage configuration's phoneme map.
    pub token: String,
    /// Onset in seconds from the word origin. Rewritten by the duration stage.
    #[serde(default)]
    pub start: f64,
    /// Per-phone timbre mix. May be empty when the stage mixes at score level.
    #[serde(default)]
    pub speakers: Vec<SpeakerMix>,
}

/// A word: ordered phones plus the notes they are sung on.
#[derive(Debug, Clone, Deserialize)]
pub struct Word {
    pub phones: Vec<Phone>,
    pub notes: Vec<Note>,
    /// Active language tag, required when the models use language ids.
    #[serde(default)]
    pub language: Option<String>,
}

impl Word {
    /// Total sung length of the word in seconds.
    pub fn duration(&self) -> f64 {
        self.notes.iter().map(|n| n.duration).sum()
    }
}

/// A user-requested regeneration window in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetakeWindow {
    pub start: f64,
    pub end: f64,
}

/// A dense control curve attached to the score.
#[derive(Debug, Clone, Deserialize)]
pub struct Parameter {
    pub tag: ParamTag,
    pub values: Vec<f64>,
    /// Seconds between consecutive samples of `values`.
    pub interval: f64,
    #[serde(default)]
    pub retake: Option<RetakeWindow>,
}

/// The mutable score context threaded through the pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct Score {
    /// Total score length in seconds.
    pub duration: f64,
    pub words: Vec<Word>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Score-level timbre mix used when a stage mixes per frame.
    #[serde(default)]
    pub speakers: Vec<SpeakerMix>,
    /// Requested inference acceleration count.
    #[serde(default = "default_steps")]
    pub steps: i64,
    /// Shallow-diffusion depth consumed by the acoustic stage.
    #[serde(default = "default_depth")]
    pub depth: f64,
}

fn default_steps() -> i64 {
    50
}

fn default_depth() -> f64 {
    1.0
}

/// Total phone count across all words.
pub fn phone_count(words: &[Word]) -> usize {
    words.iter().map(|w| w.phones.len()).sum()
}

/// Total note count across all words.
pub fn note_count(words: &[Word]) -> usize {
    words.iter().map(|w| w.notes.len()).sum()
}

/// Sum of all word durations in seconds.
pub fn total_duration(words: &[Word]) -> f64 {
    words.iter().map(Word::duration).sum()
}
