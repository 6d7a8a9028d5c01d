//! The user-supplied input document.
//!
//! A JSON object naming the singer plus the score payload: duration, words,
//! parameters, speakers, steps, and depth. The payload deserializes straight
//! into the [`Score`] context the pipeline mutates.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::score::Score;
use crate::{Error, Result};

/// Parsed input document.
#[derive(Debug, Clone, Deserialize)]
pub struct InputDocument {
    pub singer: String,
    #[serde(flatten)]
    pub score: Score,
}

impl InputDocument {
    /// Read and validate an input document from disk.
    pub fn load(path: &Path) -> Result<InputDocument> {
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        InputDocument::from_json(&text)
    }

    /// Parse and validate an input document from a JSON string.
    pub fn from_json(text: &str) -> Result<InputDocument> {
        let doc: InputDocument = serde_json::from_str(text)
            .map_err(|e| Error::InvalidFormat(format!("input document: {e}")))?;
        if doc.singer.is_empty() {
            return Err(Error::InvalidFormat(
                "input document: empty singer field".to_string(),
            ));
        }
        if !doc.score.duration.is_finite() || doc.score.duration <= 0.0 {
            return Err(Error::InvalidFormat(
                "input document: duration must be positive".to_string(),
            ));
        }
        if doc.score.words.is_empty() {
            return Err(Error::InvalidFormat(
                "input document: no words".to_string(),
            ));
        }
        Ok(doc)
    }
}
