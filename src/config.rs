//! Stage configurations and the variance schema.
//!
//! Configurations are JSON objects validated field by field against the
//! structural contract of their stage. Validation collects every violation
//! before failing, so a broken singer package reports all of its problems in
//! one pass instead of one per run.
//!
//! Asset references (model binaries, phoneme/language id maps, speaker
//! embedding files) are relative paths resolved against the package root.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::score::ParamTag;
use crate::{Error, Result};

/// Logarithm base of the mel filterbank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MelBase {
    #[default]
    E,
    Ten,
}

/// Mel frequency-scale convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MelScale {
    #[default]
    Slaney,
    Htk,
}

/// Granularity of the linguistic encoder's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinguisticMode {
    #[default]
    Word,
    Phoneme,
}

/// Spectral parameters shared by the acoustic and vocoder models. The
/// pipeline refuses to couple an acoustic model with a vocoder unless every
/// field matches.
#[derive(Debug, Clone, PartialEq)]
pub struct MelSpec {
    pub sample_rate: u32,
    pub hop_size: u32,
    pub win_size: u32,
    pub fft_size: u32,
    pub mel_channels: u32,
    pub mel_min_freq: f64,
    pub mel_max_freq: f64,
    pub mel_base: MelBase,
    pub mel_scale: MelScale,
}

impl Default for MelSpec {
    fn default() -> Self {
        MelSpec {
            sample_rate: 44100,
            hop_size: 512,
            win_size: 2048,
            fft_size: 2048,
            mel_channels: 128,
            mel_min_freq: 40.0,
            mel_max_freq: 16000.0,
            mel_base: MelBase::E,
            mel_scale: MelScale::Slaney,
        }
    }
}

impl MelSpec {
    /// Seconds per frame.
    pub fn frame_width(&self) -> f64 {
        self.hop_size as f64 / self.sample_rate as f64
    }

    /// Names of the fields on which `self` and `other` disagree, in the
    /// order the configuration documents them.
    pub fn mismatched_fields(&self, other: &MelSpec) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.sample_rate != other.sample_rate {
            fields.push("sampleRate");
        }
        if self.hop_size != other.hop_size {
            fields.push("hopSize");
        }
        if self.win_size != other.win_size {
            fields.push("winSize");
        }
        if self.fft_size != other.fft_size {
            fields.push("fftSize");
        }
        if self.mel_channels != other.mel_channels {
            fields.push("melChannels");
        }
        if self.mel_min_freq != other.mel_min_freq {
            fields.push("melMinFreq");
        }
        if self.mel_max_freq != other.mel_max_freq {
            fields.push("melMaxFreq");
        }
        if self.mel_base != other.mel_base {
            fields.push("melBase");
        }
        if self.mel_scale != other.mel_scale {
            fields.push("melScale");
        }
        fields
    }
}

/// Field-by-field JSON walker that collects every violation.
struct ConfigParser<'a> {
    obj: &'a serde_json::Map<String, Value>,
    base: &'a Path,
    what: &'static str,
    errors: Vec<String>,
}

impl<'a> ConfigParser<'a> {
    fn new(value: &'a Value, base: &'a Path, what: &'static str) -> Result<ConfigParser<'a>> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidFormat(format!("{what}: not a JSON object")))?;
        Ok(ConfigParser {
            obj,
            base,
            what,
            errors: Vec::new(),
        })
    }

    fn collect(&mut self, message: String) {
        self.errors.push(message);
    }

    fn finish(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidFormat(format!(
                "{}: {}",
                self.what,
                self.errors.join("; ")
            )))
        }
    }

    fn bool_optional(&mut self, field: &str, out: &mut bool) {
        match self.obj.get(field) {
            Some(Value::Bool(b)) => *out = *b,
            Some(_) => self.collect(format!(r#"boolean field "{field}" type mismatch"#)),
            None => {}
        }
    }

    fn positive_u32_optional(&mut self, field: &str, out: &mut u32) {
        match self.obj.get(field) {
            Some(value) if value.is_number() => match value.as_i64() {
                Some(v) if v > 0 => *out = v as u32,
                _ => self.collect(format!(r#"integer field "{field}" must be positive"#)),
            },
            Some(_) => self.collect(format!(r#"integer field "{field}" type mismatch"#)),
            None => {}
        }
    }

    fn positive_i64_optional(&mut self, field: &str, out: &mut i64) {
        match self.obj.get(field) {
            Some(value) if value.is_number() => match value.as_i64() {
                Some(v) if v > 0 => *out = v,
                _ => self.collect(format!(r#"integer field "{field}" must be positive"#)),
            },
            Some(_) => self.collect(format!(r#"integer field "{field}" type mismatch"#)),
            None => {}
        }
    }

    fn f64_optional(&mut self, field: &str, out: &mut f64) {
        match self.obj.get(field) {
            Some(value) if value.is_number() => {
                if let Some(v) = value.as_f64() {
                    *out = v;
                }
            }
            Some(_) => self.collect(format!(r#"float field "{field}" type mismatch"#)),
            None => {}
        }
    }

    fn path_required(&mut self, field: &str) -> PathBuf {
        match self.obj.get(field) {
            Some(Value::String(s)) => self.base.join(s),
            Some(_) => {
                self.collect(format!(r#"string field "{field}" type mismatch"#));
                PathBuf::new()
            }
            None => {
                self.collect(format!(r#"string field "{field}" is missing"#));
                PathBuf::new()
            }
        }
    }

    /// Frame width in seconds: explicit `frameWidth`, else derived from
    /// `sampleRate` and `hopSize`.
    fn frame_width(&mut self) -> f64 {
        if let Some(value) = self.obj.get("frameWidth") {
            return match value.as_f64() {
                Some(v) if v > 0.0 && v.is_finite() => v,
                _ => {
                    self.collect(r#"float field "frameWidth" must be positive"#.to_string());
                    0.0
                }
            };
        }
        match (self.obj.get("sampleRate"), self.obj.get("hopSize")) {
            (Some(sr), Some(hop)) => match (sr.as_f64(), hop.as_f64()) {
                (Some(sr), Some(hop)) if sr > 0.0 && hop > 0.0 => hop / sr,
                _ => {
                    self.collect(
                        r#"integer fields "sampleRate" and "hopSize" must be positive"#.to_string(),
                    );
                    0.0
                }
            },
            _ => {
                self.collect(
                    r#"must specify either "frameWidth" or ("sampleRate" and "hopSize")"#
                        .to_string(),
                );
                0.0
            }
        }
    }

    fn mel_base_optional(&mut self, out: &mut MelBase) {
        match self.obj.get("melBase") {
            Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "e" => *out = MelBase::E,
                "10" => *out = MelBase::Ten,
                other => self.collect(format!(
                    r#"enum string field "melBase" invalid: expect "e", "10"; got "{other}""#
                )),
            },
            Some(_) => self.collect(r#"string field "melBase" type mismatch"#.to_string()),
            None => {}
        }
    }

    fn mel_scale_optional(&mut self, out: &mut MelScale) {
        match self.obj.get("melScale") {
            Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "slaney" => *out = MelScale::Slaney,
                "htk" => *out = MelScale::Htk,
                other => self.collect(format!(
                    r#"enum string field "melScale" invalid: expect "slaney", "htk"; got "{other}""#
                )),
            },
            Some(_) => self.collect(r#"string field "melScale" type mismatch"#.to_string()),
            None => {}
        }
    }

    fn linguistic_mode_optional(&mut self, out: &mut LinguisticMode) {
        match self.obj.get("linguisticMode") {
            Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "word" => *out = LinguisticMode::Word,
                "phoneme" => *out = LinguisticMode::Phoneme,
                other => self.collect(format!(
                    r#"enum string field "linguisticMode" invalid: expect "word", "phoneme"; got "{other}""#
                )),
            },
            Some(_) => self.collect(r#"string field "linguisticMode" type mismatch"#.to_string()),
            None => {}
        }
    }

    fn mel_spec(&mut self) -> MelSpec {
        let mut mel = MelSpec::default();
        self.positive_u32_optional("sampleRate", &mut mel.sample_rate);
        self.positive_u32_optional("hopSize", &mut mel.hop_size);
        self.positive_u32_optional("winSize", &mut mel.win_size);
        self.positive_u32_optional("fftSize", &mut mel.fft_size);
        self.positive_u32_optional("melChannels", &mut mel.mel_channels);
        self.f64_optional("melMinFreq", &mut mel.mel_min_freq);
        self.f64_optional("melMaxFreq", &mut mel.mel_max_freq);
        self.mel_base_optional(&mut mel.mel_base);
        self.mel_scale_optional(&mut mel.mel_scale);
        mel
    }

    fn hidden_size(&mut self, use_speaker_embedding: bool, out: &mut i64) {
        match self.obj.get("hiddenSize") {
            Some(value) if value.is_number() => match value.as_i64() {
                Some(v) if v > 0 => *out = v,
                _ => self.collect(
                    r#"integer field "hiddenSize" must be a positive integer"#.to_string(),
                ),
            },
            Some(_) => self.collect(r#"integer field "hiddenSize" type mismatch"#.to_string()),
            None if use_speaker_embedding => self.collect(
                r#"integer field "hiddenSize" is missing (required when "useSpeakerEmbedding" is set to true)"#
                    .to_string(),
            ),
            None => {}
        }
    }

    /// Load a name→id JSON map referenced by a path-valued field.
    fn id_map(&mut self, field: &str, required: bool) -> HashMap<String, i64> {
        let path = match self.obj.get(field) {
            Some(Value::String(s)) => self.base.join(s),
            Some(_) => {
                self.collect(format!(r#"string field "{field}" type mismatch"#));
                return HashMap::new();
            }
            None => {
                if required {
                    self.collect(format!(r#"string field "{field}" is missing"#));
                }
                return HashMap::new();
            }
        };
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => {
                self.collect(format!(
                    r#"error loading "{field}": {} file not found"#,
                    path.display()
                ));
                return HashMap::new();
            }
        };
        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                self.collect(format!(r#"error loading "{field}": {e}"#));
                return HashMap::new();
            }
        };
        let Some(obj) = value.as_object() else {
            self.collect(format!(
                r#"error loading "{field}": outer JSON is not an object"#
            ));
            return HashMap::new();
        };
        let mut map = HashMap::with_capacity(obj.len());
        for (key, value) in obj {
            match value.as_i64() {
                Some(id) if id >= 0 => {
                    map.insert(key.clone(), id);
                }
                _ => self.collect(format!(
                    r#"error loading "{field}": value of key "{key}" is not a non-negative integer"#
                )),
            }
        }
        map
    }

    /// Load the speaker-embedding table: an object mapping speaker name to a
    /// `.emb` file of exactly `4·hiddenSize` little-endian float bytes.
    fn speakers(&mut self, use_speaker_embedding: bool, hidden_size: i64) -> HashMap<String, Vec<f32>> {
        let obj = match self.obj.get("speakers") {
            Some(Value::Object(obj)) => obj.clone(),
            Some(_) => {
                self.collect(r#"object field "speakers" type mismatch"#.to_string());
                return HashMap::new();
            }
            None => {
                if use_speaker_embedding {
                    self.collect(
                        r#"object field "speakers" is missing (required when "useSpeakerEmbedding" is set to true)"#
                            .to_string(),
                    );
                }
                return HashMap::new();
            }
        };
        let mut out = HashMap::with_capacity(obj.len());
        for (name, value) in &obj {
            let Some(rel) = value.as_str() else {
                self.collect(
                    r#"object field "speakers" values type mismatch: string expected"#.to_string(),
                );
                continue;
            };
            let path = self.base.join(rel);
            match load_speaker_embedding(hidden_size, &path) {
                Ok(embedding) => {
                    out.insert(name.clone(), embedding);
                }
                Err(e) => self.collect(format!(
                    r#"could not load speaker ("{name}") embedding vector from {}: {e}"#,
                    path.display()
                )),
            }
        }
        out
    }

    /// Parse a tag-name array into an ordered/unordered parameter set.
    fn param_tags(&mut self, field: &str, allowed: &[ParamTag], out: &mut Vec<ParamTag>) {
        match self.obj.get(field) {
            Some(Value::Array(arr)) => {
                for (index, item) in arr.iter().enumerate() {
                    let Some(name) = item.as_str() else {
                        self.collect(format!(
                            r#"array field "{field}" element at index {index} type mismatch: expected string"#
                        ));
                        continue;
                    };
                    match ParamTag::from_name(name) {
                        Some(tag) if allowed.contains(&tag) => out.push(tag),
                        _ => {
                            let expected: Vec<&str> =
                                allowed.iter().map(|t| t.name()).collect();
                            self.collect(format!(
                                r#"array field "{field}" element at index {index} invalid: expected one of [{}]; got "{name}""#,
                                expected.join(", ")
                            ));
                        }
                    }
                }
            }
            Some(_) => self.collect(format!(r#"array field "{field}" type mismatch"#)),
            None => {}
        }
    }
}

/// Read a `.emb` file: little-endian `float32[hiddenSize]`.
pub fn load_speaker_embedding(hidden_size: i64, path: &Path) -> Result<Vec<f32>> {
    if !path.is_file() {
        return Err(Error::FileNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    let expected = hidden_size as usize * 4;
    if bytes.len() != expected {
        return Err(Error::InvalidFormat(format!(
            "speaker embedding size mismatch: expected {expected} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Configuration of the duration stage (linguistic encoder + predictor).
#[derive(Debug, Clone)]
pub struct DurationConfig {
    pub encoder: PathBuf,
    pub predictor: PathBuf,
    pub frame_width: f64,
    pub phonemes: HashMap<String, i64>,
    pub languages: HashMap<String, i64>,
    pub speakers: HashMap<String, Vec<f32>>,
    pub hidden_size: i64,
    pub linguistic_mode: LinguisticMode,
    pub use_language_id: bool,
    pub use_speaker_embedding: bool,
}

impl DurationConfig {
    pub fn from_json(value: &Value, base: &Path) -> Result<DurationConfig> {
        let mut p = ConfigParser::new(value, base, "duration configuration")?;
        let mut use_language_id = false;
        let mut use_speaker_embedding = false;
        p.bool_optional("useLanguageId", &mut use_language_id);
        p.bool_optional("useSpeakerEmbedding", &mut use_speaker_embedding);
        let encoder = p.path_required("encoder");
        let predictor = p.path_required("predictor");
        let frame_width = p.frame_width();
        let phonemes = p.id_map("phonemes", true);
        let languages = p.id_map("languages", use_language_id);
        let mut hidden_size = 0;
        p.hidden_size(use_speaker_embedding, &mut hidden_size);
        let speakers = p.speakers(use_speaker_embedding, hidden_size);
        let mut linguistic_mode = LinguisticMode::Word;
        p.linguistic_mode_optional(&mut linguistic_mode);
        p.finish()?;
        Ok(DurationConfig {
            encoder,
            predictor,
            frame_width,
            phonemes,
            languages,
            speakers,
            hidden_size,
            linguistic_mode,
            use_language_id,
            use_speaker_embedding,
        })
    }
}

/// Configuration of the pitch stage.
#[derive(Debug, Clone)]
pub struct PitchConfig {
    pub encoder: PathBuf,
    pub predictor: PathBuf,
    pub frame_width: f64,
    pub phonemes: HashMap<String, i64>,
    pub languages: HashMap<String, i64>,
    pub speakers: HashMap<String, Vec<f32>>,
    pub hidden_size: i64,
    pub linguistic_mode: LinguisticMode,
    pub use_language_id: bool,
    pub use_speaker_embedding: bool,
    pub use_rest_flags: bool,
    pub use_expressiveness: bool,
    pub use_continuous_acceleration: bool,
}

impl PitchConfig {
    pub fn from_json(value: &Value, base: &Path) -> Result<PitchConfig> {
        let mut p = ConfigParser::new(value, base, "pitch configuration")?;
        let mut use_language_id = false;
        let mut use_speaker_embedding = false;
        let mut use_rest_flags = false;
        let mut use_expressiveness = false;
        let mut use_continuous_acceleration = false;
        p.bool_optional("useLanguageId", &mut use_language_id);
        p.bool_optional("useSpeakerEmbedding", &mut use_speaker_embedding);
        p.bool_optional("useRestFlags", &mut use_rest_flags);
        p.bool_optional("useExpressiveness", &mut use_expressiveness);
        p.bool_optional("useContinuousAcceleration", &mut use_continuous_acceleration);
        let encoder = p.path_required("encoder");
        let predictor = p.path_required("predictor");
        let frame_width = p.frame_width();
        let phonemes = p.id_map("phonemes", true);
        let languages = p.id_map("languages", use_language_id);
        let mut hidden_size = 0;
        p.hidden_size(use_speaker_embedding, &mut hidden_size);
        let speakers = p.speakers(use_speaker_embedding, hidden_size);
        let mut linguistic_mode = LinguisticMode::Word;
        p.linguistic_mode_optional(&mut linguistic_mode);
        p.finish()?;
        Ok(PitchConfig {
            encoder,
            predictor,
            frame_width,
            phonemes,
            languages,
            speakers,
            hidden_size,
            linguistic_mode,
            use_language_id,
            use_speaker_embedding,
            use_rest_flags,
            use_expressiveness,
            use_continuous_acceleration,
        })
    }
}

/// Configuration of the variance stage.
#[derive(Debug, Clone)]
pub struct VarianceConfig {
    pub encoder: PathBuf,
    pub predictor: PathBuf,
    pub frame_width: f64,
    pub phonemes: HashMap<String, i64>,
    pub languages: HashMap<String, i64>,
    pub speakers: HashMap<String, Vec<f32>>,
    pub hidden_size: i64,
    pub linguistic_mode: LinguisticMode,
    pub use_language_id: bool,
    pub use_speaker_embedding: bool,
    pub use_continuous_acceleration: bool,
}

impl VarianceConfig {
    pub fn from_json(value: &Value, base: &Path) -> Result<VarianceConfig> {
        let mut p = ConfigParser::new(value, base, "variance configuration")?;
        let mut use_language_id = false;
        let mut use_speaker_embedding = false;
        let mut use_continuous_acceleration = false;
        p.bool_optional("useLanguageId", &mut use_language_id);
        p.bool_optional("useSpeakerEmbedding", &mut use_speaker_embedding);
        p.bool_optional("useContinuousAcceleration", &mut use_continuous_acceleration);
        let encoder = p.path_required("encoder");
        let predictor = p.path_required("predictor");
        let frame_width = p.frame_width();
        let phonemes = p.id_map("phonemes", true);
        let languages = p.id_map("languages", use_language_id);
        let mut hidden_size = 0;
        p.hidden_size(use_speaker_embedding, &mut hidden_size);
        let speakers = p.speakers(use_speaker_embedding, hidden_size);
        let mut linguistic_mode = LinguisticMode::Word;
        p.linguistic_mode_optional(&mut linguistic_mode);
        p.finish()?;
        Ok(VarianceConfig {
            encoder,
            predictor,
            frame_width,
            phonemes,
            languages,
            speakers,
            hidden_size,
            linguistic_mode,
            use_language_id,
            use_speaker_embedding,
            use_continuous_acceleration,
        })
    }
}

/// Configuration of the acoustic stage.
#[derive(Debug, Clone)]
pub struct AcousticConfig {
    pub model: PathBuf,
    pub mel: MelSpec,
    pub phonemes: HashMap<String, i64>,
    pub languages: HashMap<String, i64>,
    pub speakers: HashMap<String, Vec<f32>>,
    pub hidden_size: i64,
    /// Per-frame parameters the model declares as inputs.
    pub parameters: BTreeSet<ParamTag>,
    pub use_language_id: bool,
    pub use_speaker_embedding: bool,
    pub use_variable_depth: bool,
    pub use_continuous_acceleration: bool,
    pub max_depth: i64,
}

impl AcousticConfig {
    pub fn from_json(value: &Value, base: &Path) -> Result<AcousticConfig> {
        let mut p = ConfigParser::new(value, base, "acoustic configuration")?;
        let mut use_language_id = false;
        let mut use_speaker_embedding = false;
        let mut use_variable_depth = false;
        let mut use_continuous_acceleration = false;
        p.bool_optional("useLanguageId", &mut use_language_id);
        p.bool_optional("useSpeakerEmbedding", &mut use_speaker_embedding);
        p.bool_optional("useVariableDepth", &mut use_variable_depth);
        p.bool_optional("useContinuousAcceleration", &mut use_continuous_acceleration);
        let model = p.path_required("model");
        let mel = p.mel_spec();
        let phonemes = p.id_map("phonemes", true);
        let languages = p.id_map("languages", use_language_id);
        let mut hidden_size = 0;
        p.hidden_size(use_speaker_embedding, &mut hidden_size);
        let speakers = p.speakers(use_speaker_embedding, hidden_size);
        let mut max_depth = 1000;
        p.positive_i64_optional("maxDepth", &mut max_depth);
        let mut declared = Vec::new();
        let allowed: Vec<ParamTag> = ParamTag::VARIANCE_TAGS
            .iter()
            .chain(ParamTag::TRANSITION_TAGS)
            .copied()
            .collect();
        p.param_tags("parameters", &allowed, &mut declared);
        p.finish()?;
        Ok(AcousticConfig {
            model,
            mel,
            phonemes,
            languages,
            speakers,
            hidden_size,
            parameters: declared.into_iter().collect(),
            use_language_id,
            use_speaker_embedding,
            use_variable_depth,
            use_continuous_acceleration,
            max_depth,
        })
    }

    /// Seconds per frame, derived from the spectral parameters.
    pub fn frame_width(&self) -> f64 {
        self.mel.frame_width()
    }
}

/// Configuration of the vocoder stage.
#[derive(Debug, Clone)]
pub struct VocoderConfig {
    pub model: PathBuf,
    pub mel: MelSpec,
}

impl VocoderConfig {
    pub fn from_json(value: &Value, base: &Path) -> Result<VocoderConfig> {
        let mut p = ConfigParser::new(value, base, "vocoder configuration")?;
        let model = p.path_required("model");
        let mel = p.mel_spec();
        p.finish()?;
        Ok(VocoderConfig { model, mel })
    }
}

/// The variance model's prediction schema: which parameter curves it
/// regenerates, in model input order.
#[derive(Debug, Clone)]
pub struct VarianceSchema {
    pub predictions: Vec<ParamTag>,
    pub use_rest_flags: bool,
    pub use_expressiveness: bool,
}

impl VarianceSchema {
    pub fn from_json(value: &Value) -> Result<VarianceSchema> {
        let mut p = ConfigParser::new(value, Path::new(""), "variance schema")?;
        let mut predictions = Vec::new();
        p.param_tags("predictions", ParamTag::VARIANCE_TAGS, &mut predictions);
        let mut use_rest_flags = false;
        let mut use_expressiveness = false;
        p.bool_optional("useRestFlags", &mut use_rest_flags);
        p.bool_optional("useExpressiveness", &mut use_expressiveness);
        p.finish()?;
        Ok(VarianceSchema {
            predictions,
            use_rest_flags,
            use_expressiveness,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) {
        let mut f = std::fs::File::create(dir.path().join(name)).unwrap();
        f.write_all(contents).unwrap();
    }

    fn write_assets(dir: &TempDir) {
        write_file(dir, "phonemes.json", br#"{"AP":1,"SP":2,"a":3}"#);
        write_file(dir, "languages.json", br#"{"en":0,"ja":1}"#);
        // hiddenSize 2 → 8 bytes per speaker
        write_file(dir, "alto.emb", &1.0f32.to_le_bytes().iter().chain(2.0f32.to_le_bytes().iter()).copied().collect::<Vec<u8>>());
    }

    #[test]
    fn duration_config_parses() {
        let dir = TempDir::new().unwrap();
        write_assets(&dir);
        let value = json!({
            "encoder": "enc.onnx",
            "predictor": "pred.onnx",
            "sampleRate": 44100,
            "hopSize": 512,
            "phonemes": "phonemes.json",
            "languages": "languages.json",
            "speakers": {"alto": "alto.emb"},
            "hiddenSize": 2,
            "useLanguageId": true,
            "useSpeakerEmbedding": true
        });
        let config = DurationConfig::from_json(&value, dir.path()).unwrap();
        assert_eq!(config.encoder, dir.path().join("enc.onnx"));
        assert!((config.frame_width - 512.0 / 44100.0).abs() < 1e-12);
        assert_eq!(config.phonemes["a"], 3);
        assert_eq!(config.languages["ja"], 1);
        assert_eq!(config.speakers["alto"], vec![1.0, 2.0]);
        assert!(config.use_language_id);
    }

    #[test]
    fn explicit_frame_width_wins() {
        let dir = TempDir::new().unwrap();
        write_assets(&dir);
        let value = json!({
            "encoder": "enc.onnx",
            "predictor": "pred.onnx",
            "frameWidth": 0.01,
            "phonemes": "phonemes.json"
        });
        let config = DurationConfig::from_json(&value, dir.path()).unwrap();
        assert_eq!(config.frame_width, 0.01);
    }

    #[test]
    fn errors_are_collected_not_first_only() {
        let dir = TempDir::new().unwrap();
        let value = json!({
            "predictor": 5,
            "useLanguageId": "yes"
        });
        let err = DurationConfig::from_json(&value, dir.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(r#"string field "encoder" is missing"#), "{msg}");
        assert!(msg.contains(r#"string field "predictor" type mismatch"#), "{msg}");
        assert!(msg.contains(r#"boolean field "useLanguageId" type mismatch"#), "{msg}");
        assert!(msg.contains(r#"string field "phonemes" is missing"#), "{msg}");
    }

    #[test]
    fn missing_languages_only_when_flag_set() {
        let dir = TempDir::new().unwrap();
        write_assets(&dir);
        let base = json!({
            "encoder": "enc.onnx",
            "predictor": "pred.onnx",
            "frameWidth": 0.01,
            "phonemes": "phonemes.json"
        });
        assert!(DurationConfig::from_json(&base, dir.path()).is_ok());

        let mut with_flag = base.clone();
        with_flag["useLanguageId"] = json!(true);
        let err = DurationConfig::from_json(&with_flag, dir.path()).unwrap_err();
        assert!(err.to_string().contains(r#""languages" is missing"#));
    }

    #[test]
    fn embedding_length_is_validated() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "bad.emb", &[0u8; 7]);
        let err = load_speaker_embedding(2, &dir.path().join("bad.emb")).unwrap_err();
        assert!(err
            .to_string()
            .contains("speaker embedding size mismatch: expected 8 bytes, got 7"));
        assert!(matches!(
            load_speaker_embedding(2, &dir.path().join("none.emb")).unwrap_err(),
            Error::FileNotFound(_)
        ));
    }

    #[test]
    fn id_map_rejects_non_integer_values() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "phonemes.json", br#"{"a": 1, "b": "x", "c": -2}"#);
        let value = json!({
            "encoder": "enc.onnx",
            "predictor": "pred.onnx",
            "frameWidth": 0.01,
            "phonemes": "phonemes.json"
        });
        let err = DurationConfig::from_json(&value, dir.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(r#"value of key "b""#), "{msg}");
        assert!(msg.contains(r#"value of key "c""#), "{msg}");
    }

    #[test]
    fn mel_enums_parse_case_insensitively() {
        let dir = TempDir::new().unwrap();
        write_assets(&dir);
        let value = json!({
            "model": "acoustic.onnx",
            "sampleRate": 44100,
            "hopSize": 512,
            "melBase": "10",
            "melScale": "HTK",
            "phonemes": "phonemes.json"
        });
        let config = AcousticConfig::from_json(&value, dir.path()).unwrap();
        assert_eq!(config.mel.mel_base, MelBase::Ten);
        assert_eq!(config.mel.mel_scale, MelScale::Htk);
    }

    #[test]
    fn acoustic_parameters_restricted_to_known_tags() {
        let dir = TempDir::new().unwrap();
        write_assets(&dir);
        let value = json!({
            "model": "acoustic.onnx",
            "sampleRate": 44100,
            "hopSize": 512,
            "phonemes": "phonemes.json",
            "parameters": ["gender", "energy", "sparkle"]
        });
        let err = AcousticConfig::from_json(&value, dir.path()).unwrap_err();
        assert!(err.to_string().contains(r#"got "sparkle""#));

        let value = json!({
            "model": "acoustic.onnx",
            "sampleRate": 44100,
            "hopSize": 512,
            "phonemes": "phonemes.json",
            "parameters": ["gender", "energy"]
        });
        let config = AcousticConfig::from_json(&value, dir.path()).unwrap();
        assert!(config.parameters.contains(&ParamTag::Gender));
        assert!(config.parameters.contains(&ParamTag::Energy));
        assert!(!config.parameters.contains(&ParamTag::Velocity));
    }

    #[test]
    fn variance_schema_keeps_prediction_order() {
        let value = json!({
            "predictions": ["tension", "energy"],
            "useExpressiveness": true
        });
        let schema = VarianceSchema::from_json(&value).unwrap();
        assert_eq!(
            schema.predictions,
            vec![ParamTag::Tension, ParamTag::Energy]
        );
        assert!(schema.use_expressiveness);
        assert!(!schema.use_rest_flags);

        let bad = json!({"predictions": ["pitch"]});
        assert!(VarianceSchema::from_json(&bad).is_err());
    }

    #[test]
    fn mel_mismatch_lists_field_names() {
        let a = MelSpec::default();
        let mut b = a.clone();
        b.hop_size = 256;
        assert_eq!(a.mismatched_fields(&b), vec!["hopSize"]);
        b.mel_base = MelBase::Ten;
        assert_eq!(a.mismatched_fields(&b), vec!["hopSize", "melBase"]);
        assert!(a.mismatched_fields(&a.clone()).is_empty());
    }
}
