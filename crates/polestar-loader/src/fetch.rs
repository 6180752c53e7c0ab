// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Fetcher interface
//!
//! The loader delegates all retrieval to a [`Fetcher`]. A fetch maps a URL
//! to a [`FetchResult`]: the module's canonical id, its source, its
//! declared dependencies, and optional CSS.

use crate::error::Result;
use crate::resolver::VersionRanges;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Future returned by [`Fetcher::fetch`]. Not `Send`: the loader is
/// single-threaded cooperative.
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<FetchResult>>>>;

/// Context passed through to the fetcher alongside the URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOptions {
    /// Id of the module that required this URL, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_by_id: Option<String>,
    /// The request string as written in the requiring module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_request: Option<String>,
}

/// How a fetched module declares its dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyList {
    /// An explicit list of request strings.
    Requests(Vec<String>),
    /// The module is a UMD bundle; dependencies are discovered by invoking
    /// its `define` call during preparation.
    Umd,
}

impl DependencyList {
    /// The explicit requests, if any. UMD lists have none until prepared.
    pub fn requests(&self) -> &[String] {
        match self {
            DependencyList::Requests(reqs) => reqs,
            DependencyList::Umd => &[],
        }
    }

    /// Whether this is the UMD marker.
    pub fn is_umd(&self) -> bool {
        matches!(self, DependencyList::Umd)
    }
}

impl Default for DependencyList {
    fn default() -> Self {
        DependencyList::Requests(Vec::new())
    }
}

impl From<Vec<String>> for DependencyList {
    fn from(requests: Vec<String>) -> Self {
        DependencyList::Requests(requests)
    }
}

impl From<&[&str]> for DependencyList {
    fn from(requests: &[&str]) -> Self {
        DependencyList::Requests(requests.iter().map(|r| r.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for DependencyList {
    fn from(requests: [&str; N]) -> Self {
        requests.as_slice().into()
    }
}

// On the wire a dependency list is either an array of strings or the
// literal string "umd".
impl Serialize for DependencyList {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            DependencyList::Requests(reqs) => reqs.serialize(serializer),
            DependencyList::Umd => serializer.serialize_str("umd"),
        }
    }
}

impl<'de> Deserialize<'de> for DependencyList {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct ListVisitor;

        impl<'de> Visitor<'de> for ListVisitor {
            type Value = DependencyList;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an array of request strings or the string \"umd\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                if v == "umd" {
                    Ok(DependencyList::Umd)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut reqs = Vec::new();
                while let Some(item) = seq.next_element::<String>()? {
                    reqs.push(item);
                }
                Ok(DependencyList::Requests(reqs))
            }
        }

        deserializer.deserialize_any(ListVisitor)
    }
}

/// The product of a completed fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResult {
    /// The URL that was fetched.
    pub url: String,
    /// The module's canonical id (may differ from the URL, e.g. after
    /// redirects pin a version range to an exact version).
    pub id: String,
    /// Module source text.
    pub code: String,
    /// Declared dependencies.
    #[serde(default)]
    pub dependencies: DependencyList,
    /// Version ranges for bare package requests made by this module.
    #[serde(default)]
    pub dependency_version_ranges: VersionRanges,
    /// CSS to inject alongside the module, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub css: Option<String>,
}

/// Retrieves module source by URL.
pub trait Fetcher {
    /// Fetch `url`. The returned future must be awaited on the loader's
    /// executor.
    fn fetch(&self, url: &str, options: FetchOptions) -> FetchFuture;
}
