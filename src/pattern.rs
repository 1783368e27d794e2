//! Compiled URL patterns.
//!
//! Patterns keep their source text next to the compiled regex so they can be
//! reported back over the control API exactly as they were submitted.

use regex::Regex;
use serde::{Serialize, Serializer};

use crate::error::{FleetError, FleetResult};

/// A regular expression plus the text it was compiled from.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile a pattern that must match the *whole* input.
    ///
    /// `^http://a\.com/x` does not match `http://a.com/xy`: the pattern is
    /// anchored at both ends regardless of how it was written.
    pub fn full_match(field: &str, source: &str) -> FleetResult<Self> {
        let regex = Regex::new(&format!("^(?:{})$", source))
            .map_err(|e| FleetError::validation(field, compile_reason(&e)))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    /// Compile a pattern used for search-and-replace (unanchored).
    pub fn search(field: &str, source: &str) -> FleetResult<Self> {
        let regex = Regex::new(source).map_err(|e| FleetError::validation(field, compile_reason(&e)))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    /// The pattern as submitted.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, input: &str) -> bool {
        self.regex.is_match(input)
    }

    /// Replace every match in `input`. `$1`/`${name}` refer to capture groups.
    pub fn replace_all(&self, input: &str, replacement: &str) -> String {
        self.regex.replace_all(input, replacement).into_owned()
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

fn compile_reason(err: &regex::Error) -> String {
    // regex errors span several lines; keep the API response on one.
    err.to_string().lines().last().unwrap_or("invalid regular expression").trim().to_string()
}
