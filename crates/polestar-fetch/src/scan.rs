//! Source scanning
//!
//! Extracts the information the loader needs from fetched JavaScript:
//! `require(...)` requests, UMD preambles, and an optional trailing
//! dependency annotation carrying version ranges. Regex-based; a proper
//! parser would see through comments and string literals.

use polestar_loader::VersionRanges;
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{FetchError, Result};

fn require_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\brequire\s*\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap())
}

fn umd_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"typeof\s+define\s*===?\s*['"]function['"]"#).unwrap())
}

fn annotation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"/\*#\s*dependencies:\s*(\{[\s\S]*?\})\s*#\*/"#).unwrap())
}

/// The distinct `require(...)` requests in `code`, in order of first
/// appearance.
pub fn find_requires(code: &str) -> Vec<String> {
    let mut requests = Vec::new();
    for cap in require_re().captures_iter(code) {
        let request = cap[1].to_string();
        if !requests.contains(&request) {
            requests.push(request);
        }
    }
    requests
}

/// Whether `code` looks like a UMD bundle: a preamble that feature-tests
/// `define` and checks `define.amd`.
pub fn is_umd(code: &str) -> bool {
    umd_re().is_match(code) && code.contains("define.amd")
}

/// Version ranges from a `/*# dependencies: {...} #*/` annotation block,
/// if the module carries one.
pub fn dependency_ranges(url: &str, code: &str) -> Result<VersionRanges> {
    let Some(cap) = annotation_re().captures(code) else {
        return Ok(VersionRanges::new());
    };
    serde_json::from_str(&cap[1]).map_err(|err| FetchError::Annotation {
        url: url.to_string(),
        reason: err.to_string(),
    })
}
