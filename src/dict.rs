//! Phoneme lookup table loaded from a lexicon file.
//!
//! The file format is one entry per line, `WORD\tTOK1 TOK2 … TOKn`, with a
//! trailing CR tolerated. The whole file is kept in a single owned buffer;
//! tabs, spaces, and line breaks are rewritten in place to NUL so every
//! phoneme sequence stays a contiguous run of NUL-terminated tokens. Lookups
//! resolve to `(offset, count)` pairs into that buffer and allocate nothing.
//!
//! Loading is a one-shot constructor; the loaded table is immutable and safe
//! to share across threads.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct Entry {
    /// Byte offset of the first token in the buffer.
    offset: u32,
    /// Number of tokens in the sequence.
    count: u32,
}

/// Constant map from word name to its phoneme sequence.
#[derive(Debug, Default)]
pub struct PhonemeDict {
    buf: Box<str>,
    map: HashMap<Box<str>, Entry>,
}

impl PhonemeDict {
    /// Load a lexicon file. Lines without a tab are silently skipped.
    pub fn load(path: &Path) -> Result<PhonemeDict> {
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        let mut bytes = fs::read(path)?;
        Self::parse(&mut bytes, path)
    }

    fn parse(bytes: &mut Vec<u8>, path: &Path) -> Result<PhonemeDict> {
        // Terminating line break so the last entry parses like any other.
        bytes.push(b'\n');

        let mut entries = Vec::new();
        let mut line_start = 0usize;
        for i in 0..bytes.len() {
            if bytes[i] != b'\n' {
                continue;
            }
            let mut line_end = i;
            if line_end > line_start && bytes[line_end - 1] == b'\r' {
                line_end -= 1;
            }
            let line = &bytes[line_start..line_end];
            if let Some(tab) = line.iter().position(|&b| b == b'\t') {
                if tab > 0 && tab + 1 < line.len() {
                    entries.push((line_start, line_start + tab, line_end));
                }
            }
            line_start = i + 1;
        }

        // Rewrite separators to NUL so tokens become contiguous
        // NUL-terminated runs, then freeze the buffer as UTF-8.
        let mut keyed = Vec::with_capacity(entries.len());
        for &(key_start, tab, line_end) in &entries {
            bytes[tab] = 0;
            let mut count = 1u32;
            for b in &mut bytes[tab + 1..line_end] {
                if *b == b' ' {
                    *b = 0;
                    count += 1;
                }
            }
            bytes[line_end] = 0;
            keyed.push((key_start, tab, count));
        }

        let buf: Box<str> = String::from_utf8(std::mem::take(bytes))
            .map_err(|_| {
                Error::InvalidFormat(format!(
                    "phoneme dictionary {} is not valid UTF-8",
                    path.display()
                ))
            })?
            .into_boxed_str();

        let mut map = HashMap::with_capacity(keyed.len());
        for (key_start, tab, count) in keyed {
            let key: Box<str> = buf[key_start..tab].into();
            map.insert(
                key,
                Entry {
                    offset: (tab + 1) as u32,
                    count,
                },
            );
        }

        Ok(PhonemeDict { buf, map })
    }

    /// Look up the phoneme sequence for `name`.
    pub fn find(&self, name: &str) -> Option<PhonemeList<'_>> {
        self.map.get(name).map(|entry| PhonemeList {
            buf: &self.buf,
            offset: entry.offset as usize,
            remaining: entry.count,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over `(name, phoneme-sequence)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, PhonemeList<'_>)> {
        self.map.iter().map(|(key, entry)| {
            (
                key.as_ref(),
                PhonemeList {
                    buf: &self.buf,
                    offset: entry.offset as usize,
                    remaining: entry.count,
                },
            )
        })
    }
}

/// Borrowed view over one entry's NUL-terminated token run.
#[derive(Debug, Clone, Copy)]
pub struct PhonemeList<'a> {
    buf: &'a str,
    offset: usize,
    remaining: u32,
}

impl<'a> PhonemeList<'a> {
    pub fn len(&self) -> usize {
        self.remaining as usize
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }
}

impl<'a> Iterator for PhonemeList<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.remaining == 0 {
            return None;
        }
        let rest = self.buf.get(self.offset..)?;
        let end = rest.find('\0').unwrap_or(rest.len());
        let token = &rest[..end];
        self.offset += end + 1;
        self.remaining -= 1;
        Some(token)
    }
}
