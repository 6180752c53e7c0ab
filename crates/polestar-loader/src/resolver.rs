// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Request resolution
//!
//! Maps request strings to module identities. A request either names a
//! module the loader already knows ([`Resolution::Available`]) or something
//! that must be fetched first ([`Resolution::NeedFetch`]).

use crate::error::{LoaderError, Result};
use rustc_hash::FxHashMap;
use semver::{Version, VersionReq};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashSet;
use tracing::warn;

/// Version-range map attached to a module: package name to semver range.
/// Opaque to the engine; interpreted only by resolvers.
pub type VersionRanges = BTreeMap<String, String>;

/// Result of resolving a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The module is already known under this id; no fetch required.
    Available {
        /// Canonical module id
        id: String,
    },
    /// A fetch must be performed; the id is learned from the fetch result.
    NeedFetch {
        /// URL to fetch
        url: String,
    },
}

/// Maps requests to module identities.
///
/// Implementations are stateful only to the extent that they remember
/// URL-to-id bindings learned from completed fetches; the loader prunes
/// those bindings on unload and on error recovery.
pub trait Resolver {
    /// Resolve a request, optionally in the context of a parent module.
    fn resolve(
        &self,
        request: &str,
        parent_id: Option<&str>,
        version_ranges: &VersionRanges,
    ) -> Result<Resolution>;

    /// Record that `url` produced the module `id`.
    fn register_resolved_url(&self, url: &str, id: &str);

    /// Record a module id with no URL of its own (entry points, preloads).
    fn register_id(&self, id: &str);

    /// The id a URL is known to produce, if the fetch has completed.
    fn url_id(&self, url: &str) -> Option<String>;

    /// All URLs known to produce `id`.
    fn urls_for_id(&self, id: &str) -> Vec<String>;

    /// Drop a URL binding.
    fn unregister_url(&self, url: &str);

    /// Drop a module id and every URL bound to it.
    fn unregister_id(&self, id: &str);
}

/// Default CDN base used for bare package specifiers.
pub const DEFAULT_CDN: &str = "https://unpkg.com";

/// The built-in resolver.
///
/// - URL-shaped requests resolve to themselves (or to their known id once
///   fetched).
/// - Relative requests are joined against a URL-shaped parent id.
/// - Bare package specifiers become CDN URLs, versioned by the parent's
///   range map.
pub struct DefaultResolver {
    cdn_base: String,
    known_urls: RefCell<FxHashMap<String, String>>,
    known_ids: RefCell<HashSet<String>>,
}

impl DefaultResolver {
    /// Create a resolver against the default CDN.
    pub fn new() -> Self {
        Self::with_cdn(DEFAULT_CDN)
    }

    /// Create a resolver against a specific CDN base URL.
    pub fn with_cdn(cdn_base: &str) -> Self {
        Self {
            cdn_base: cdn_base.trim_end_matches('/').to_string(),
            known_urls: RefCell::new(FxHashMap::default()),
            known_ids: RefCell::new(HashSet::new()),
        }
    }

    /// Resolve a URL to `Available` if its id is known, else `NeedFetch`.
    fn url_resolution(&self, url: String) -> Resolution {
        match self.known_urls.borrow().get(&url) {
            Some(id) => Resolution::Available { id: id.clone() },
            None => Resolution::NeedFetch { url },
        }
    }

    /// Build the CDN URL for a bare package specifier.
    fn package_url(&self, request: &str, version_ranges: &VersionRanges) -> String {
        let (name, subpath) = parse_package_specifier(request);
        let range = version_ranges
            .get(name)
            .map(String::as_str)
            .unwrap_or("latest");
        let range = validate_version_range(range);

        match subpath {
            Some(sub) => format!("{}/{}@{}/{}", self.cdn_base, name, range, sub),
            None => format!("{}/{}@{}", self.cdn_base, name, range),
        }
    }
}

impl Default for DefaultResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for DefaultResolver {
    fn resolve(
        &self,
        request: &str,
        parent_id: Option<&str>,
        version_ranges: &VersionRanges,
    ) -> Result<Resolution> {
        // Already-known ids short-circuit everything else
        if self.known_ids.borrow().contains(request) {
            return Ok(Resolution::Available {
                id: request.to_string(),
            });
        }

        if request.contains("://") {
            return Ok(self.url_resolution(request.to_string()));
        }

        if request.starts_with("./") || request.starts_with("../") {
            let parent = parent_id.ok_or_else(|| LoaderError::Resolution {
                request: request.to_string(),
                reason: "relative request with no parent module".to_string(),
            })?;
            let url = join_relative(parent, request).ok_or_else(|| LoaderError::Resolution {
                request: request.to_string(),
                reason: format!("parent id '{}' is not URL-shaped", parent),
            })?;
            if self.known_ids.borrow().contains(&url) {
                return Ok(Resolution::Available { id: url });
            }
            return Ok(self.url_resolution(url));
        }

        Ok(self.url_resolution(self.package_url(request, version_ranges)))
    }

    fn register_resolved_url(&self, url: &str, id: &str) {
        self.known_urls
            .borrow_mut()
            .insert(url.to_string(), id.to_string());
        self.register_id(id);
    }

    fn register_id(&self, id: &str) {
        self.known_ids.borrow_mut().insert(id.to_string());
    }

    fn url_id(&self, url: &str) -> Option<String> {
        self.known_urls.borrow().get(url).cloned()
    }

    fn urls_for_id(&self, id: &str) -> Vec<String> {
        self.known_urls
            .borrow()
            .iter()
            .filter(|(_, bound)| bound.as_str() == id)
            .map(|(url, _)| url.clone())
            .collect()
    }

    fn unregister_url(&self, url: &str) {
        self.known_urls.borrow_mut().remove(url);
    }

    fn unregister_id(&self, id: &str) {
        self.known_ids.borrow_mut().remove(id);
        self.known_urls.borrow_mut().retain(|_, bound| bound != id);
    }
}

/// Split a package specifier into name and optional subpath.
fn parse_package_specifier(specifier: &str) -> (&str, Option<&str>) {
    if let Some(rest) = specifier.strip_prefix('@') {
        // Scoped package: @scope/name or @scope/name/subpath
        if let Some(slash_pos) = rest.find('/') {
            let after_scope = &rest[slash_pos + 1..];
            if let Some(subpath_pos) = after_scope.find('/') {
                let name_end = 1 + slash_pos + 1 + subpath_pos;
                return (&specifier[..name_end], Some(&specifier[name_end + 1..]));
            }
        }
        (specifier, None)
    } else if let Some(slash_pos) = specifier.find('/') {
        (&specifier[..slash_pos], Some(&specifier[slash_pos + 1..]))
    } else {
        (specifier, None)
    }
}

/// Validate a version range, warning about ranges semver cannot parse.
///
/// Unparseable ranges are passed through untouched: ranges are opaque to
/// the engine, and the CDN may understand forms semver does not.
fn validate_version_range(range: &str) -> String {
    let range = range.trim();
    if range == "latest" || range == "*" {
        return range.to_string();
    }

    // Exact versions stay exact
    if range.chars().next().is_some_and(|c| c.is_ascii_digit()) && Version::parse(range).is_ok() {
        return range.to_string();
    }

    let candidate = range.replace(".x", ".*").replace(".X", ".*");
    if VersionReq::parse(&candidate).is_err() {
        warn!(range, "version range did not parse as semver; passing through");
        return range.to_string();
    }
    range.to_string()
}

/// Join a relative request against a URL-shaped parent id.
fn join_relative(parent: &str, request: &str) -> Option<String> {
    let scheme_end = parent.find("://")? + 3;
    let path_start = parent[scheme_end..]
        .find('/')
        .map(|i| scheme_end + i)
        .unwrap_or(parent.len());
    let origin = &parent[..path_start];

    let mut segments: Vec<&str> = parent[path_start..]
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    segments.pop();

    for seg in request.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    Some(format!("{}/{}", origin, segments.join("/")))
}
