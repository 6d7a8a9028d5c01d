//! Singer-package loading.
//!
//! A singer package is a directory with a `singer.json` manifest enumerating
//! the five inferences by class name, each pointing at a configuration file
//! (and, for variance, a prediction schema). Asset paths inside the
//! configurations resolve against the package root.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::config::{
    AcousticConfig, DurationConfig, PitchConfig, VarianceConfig, VarianceSchema, VocoderConfig,
};
use crate::stages;
use crate::{Error, Result};

/// Manifest file name at the package root.
pub const MANIFEST_FILE: &str = "singer.json";

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    id: String,
    #[serde(default)]
    #[allow(dead_code)]
    name: String,
    inferences: Vec<InferenceDoc>,
}

#[derive(Debug, Deserialize)]
struct InferenceDoc {
    class: String,
    configuration: String,
    #[serde(default)]
    schema: Option<String>,
}

/// A loaded singer package: identity plus one configuration per stage.
#[derive(Debug)]
pub struct SingerPackage {
    pub id: String,
    pub root: PathBuf,
    pub duration: Arc<DurationConfig>,
    pub pitch: Arc<PitchConfig>,
    pub variance: Arc<VarianceConfig>,
    pub variance_schema: Arc<VarianceSchema>,
    pub acoustic: Arc<AcousticConfig>,
    pub vocoder: Arc<VocoderConfig>,
}

impl SingerPackage {
    /// Load a package directory, resolving and validating all five stage
    /// configurations.
    pub fn load(root: &Path) -> Result<SingerPackage> {
        let manifest_path = root.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(Error::FileNotFound(manifest_path));
        }
        let text = fs::read_to_string(&manifest_path)?;
        let manifest: ManifestDoc = serde_json::from_str(&text)
            .map_err(|e| Error::InvalidFormat(format!("singer manifest: {e}")))?;
        if manifest.id.is_empty() {
            return Err(Error::InvalidFormat(
                "singer manifest: empty id field".to_string(),
            ));
        }

        let duration_doc = find_inference(&manifest, stages::duration::API_CLASS, "duration")?;
        let pitch_doc = find_inference(&manifest, stages::pitch::API_CLASS, "pitch")?;
        let variance_doc = find_inference(&manifest, stages::variance::API_CLASS, "variance")?;
        let acoustic_doc = find_inference(&manifest, stages::acoustic::API_CLASS, "acoustic")?;
        let vocoder_doc = find_inference(&manifest, stages::vocoder::API_CLASS, "vocoder")?;

        let duration =
            DurationConfig::from_json(&read_json(root, &duration_doc.configuration)?, root)?;
        let pitch = PitchConfig::from_json(&read_json(root, &pitch_doc.configuration)?, root)?;
        let variance =
            VarianceConfig::from_json(&read_json(root, &variance_doc.configuration)?, root)?;
        let acoustic =
            AcousticConfig::from_json(&read_json(root, &acoustic_doc.configuration)?, root)?;
        let vocoder =
            VocoderConfig::from_json(&read_json(root, &vocoder_doc.configuration)?, root)?;

        let schema_rel = variance_doc.schema.as_deref().ok_or_else(|| {
            Error::InvalidFormat(format!(
                r#"variance schema is missing for singer "{}""#,
                manifest.id
            ))
        })?;
        let variance_schema = VarianceSchema::from_json(&read_json(root, schema_rel)?)?;

        Ok(SingerPackage {
            id: manifest.id,
            root: root.to_path_buf(),
            duration: Arc::new(duration),
            pitch: Arc::new(pitch),
            variance: Arc::new(variance),
            variance_schema: Arc::new(variance_schema),
            acoustic: Arc::new(acoustic),
            vocoder: Arc::new(vocoder),
        })
    }
}

fn find_inference<'a>(
    manifest: &'a ManifestDoc,
    class: &str,
    stage: &str,
) -> Result<&'a InferenceDoc> {
    manifest
        .inferences
        .iter()
        .find(|inf| inf.class == class)
        .ok_or_else(|| {
            Error::InvalidFormat(format!(
                r#"{stage} inference not found for singer "{}""#,
                manifest.id
            ))
        })
}

fn read_json(root: &Path, relative: &str) -> Result<Value> {
    let path = root.join(relative);
    if !path.is_file() {
        return Err(Error::FileNotFound(path));
    }
    let text = fs::read_to_string(&path)?;
    serde_json::from_str(&text)
        .map_err(|e| Error::InvalidFormat(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn write_package(dir: &Path) {
        write(
            dir,
            "singer.json",
            r#"{
                "id": "demo-singer",
                "name": "Demo",
                "inferences": [
                    {"class": "svs.inference.duration", "configuration": "duration.json"},
                    {"class": "svs.inference.pitch", "configuration": "pitch.json"},
                    {"class": "svs.inference.variance", "configuration": "variance.json",
                     "schema": "variance_schema.json"},
                    {"class": "svs.inference.acoustic", "configuration": "acoustic.json"},
                    {"class": "svs.inference.vocoder", "configuration": "vocoder.json"}
                ]
            }"#,
        );
        write(dir, "phonemes.json", r#"{"AP": 0, "a": 1}"#);
        let two_session = |enc: &str, pred: &str| {
            format!(
                r#"{{"encoder": "{enc}", "predictor": "{pred}",
                     "frameWidth": 0.01, "phonemes": "phonemes.json"}}"#
            )
        };
        write(dir, "duration.json", &two_session("d-enc.onnx", "d-pred.onnx"));
        write(dir, "pitch.json", &two_session("p-enc.onnx", "p-pred.onnx"));
        write(dir, "variance.json", &two_session("v-enc.onnx", "v-pred.onnx"));
        write(
            dir,
            "variance_schema.json",
            r#"{"predictions": ["energy", "breathiness"]}"#,
        );
        write(
            dir,
            "acoustic.json",
            r#"{"model": "acoustic.onnx", "sampleRate": 44100, "hopSize": 512,
                "phonemes": "phonemes.json", "parameters": ["gender", "energy"]}"#,
        );
        write(
            dir,
            "vocoder.json",
            r#"{"model": "vocoder.onnx", "sampleRate": 44100, "hopSize": 512}"#,
        );
    }

    #[test]
    fn loads_a_complete_package() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path());
        let package = SingerPackage::load(dir.path()).unwrap();
        assert_eq!(package.id, "demo-singer");
        assert_eq!(package.duration.phonemes["a"], 1);
        assert_eq!(package.variance_schema.predictions.len(), 2);
        assert_eq!(package.acoustic.model, dir.path().join("acoustic.onnx"));
        assert_eq!(package.vocoder.mel.hop_size, 512);
    }

    #[test]
    fn missing_manifest_is_file_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SingerPackage::load(dir.path()).unwrap_err(),
            Error::FileNotFound(_)
        ));
    }

    #[test]
    fn missing_stage_entry_is_reported_by_name() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path());
        write(
            dir.path(),
            "singer.json",
            r#"{
                "id": "demo-singer",
                "inferences": [
                    {"class": "svs.inference.duration", "configuration": "duration.json"}
                ]
            }"#,
        );
        let err = SingerPackage::load(dir.path()).unwrap_err();
        assert!(err
            .to_string()
            .contains(r#"pitch inference not found for singer "demo-singer""#));
    }

    #[test]
    fn missing_variance_schema_is_an_error() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path());
        write(
            dir.path(),
            "singer.json",
            r#"{
                "id": "demo-singer",
                "inferences": [
                    {"class": "svs.inference.duration", "configuration": "duration.json"},
                    {"class": "svs.inference.pitch", "configuration": "pitch.json"},
                    {"class": "svs.inference.variance", "configuration": "variance.json"},
                    {"class": "svs.inference.acoustic", "configuration": "acoustic.json"},
                    {"class": "svs.inference.vocoder", "configuration": "vocoder.json"}
                ]
            }"#,
        );
        let err = SingerPackage::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("variance schema is missing"));
    }
}
