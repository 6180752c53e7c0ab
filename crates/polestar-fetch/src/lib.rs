//! # polestar-fetch
//!
//! HTTP [`Fetcher`](polestar_loader::Fetcher) implementation for the
//! polestar module loader.
//!
//! Retrieves module source over HTTP(S) with a pooled client, derives the
//! module id from the final post-redirect URL (pinning version-range
//! requests to exact versions), and fills in the metadata the loader
//! needs: `require(...)` requests scanned from the source, UMD preamble
//! detection, CSS module payloads, and version ranges from a trailing
//! dependency annotation.
//!
//! ```rust,ignore
//! use polestar_fetch::HttpFetcher;
//! use polestar_loader::{Loader, LoaderOptions};
//! use std::rc::Rc;
//!
//! let fetcher = Rc::new(HttpFetcher::new()?);
//! let loader = Loader::new(fetcher, compiler, LoaderOptions::default());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod http;
pub mod scan;

pub use error::{FetchError, Result};
pub use http::HttpFetcher;
