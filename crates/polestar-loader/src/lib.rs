// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # polestar-loader
//!
//! A dynamic JavaScript module loader: given entry source plus a list of
//! dependency requests, the loader resolves each request to a module
//! identity, fetches missing source, links the dependency graph, and
//! executes entry modules with commonjs/AMD-style UMD semantics,
//! tolerating dependency cycles.
//!
//! The crate is the linking and execution engine only. Retrieval,
//! compilation of source text, and style injection are collaborator
//! traits supplied by the host:
//!
//! - [`Fetcher`]: async URL to [`FetchResult`]
//! - [`SourceCompiler`]: source text plus free-variable names to an
//!   invocable function
//! - [`Resolver`]: request strings to module identities (a default CDN
//!   resolver is built in)
//! - [`StyleSink`]: CSS associated with a module id (defaults to a
//!   no-op for headless hosts)
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use polestar_loader::{Loader, LoaderOptions};
//! use std::rc::Rc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let local = tokio::task::LocalSet::new();
//!     local
//!         .run_until(async {
//!             let loader = Loader::new(fetcher, compiler, LoaderOptions::default());
//!             let module = loader
//!                 .evaluate(["react"], source, ranges, None)
//!                 .await?;
//!             println!("{:?}", module.exports());
//!             Ok(())
//!         })
//!         .await
//! }
//! ```
//!
//! The loader is single-threaded cooperative and spawns its internal
//! continuations with `tokio::task::spawn_local`; it must be driven from
//! inside a [`tokio::task::LocalSet`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compile;
pub mod error;
pub mod fetch;
pub mod loader;
pub mod promise;
pub mod resolver;
pub mod styles;
pub mod value;
pub mod wrapper;

// Re-exports
pub use compile::{BoundFunction, CompiledFunction, SourceCompiler};
pub use error::{LoaderError, Result};
pub use fetch::{DependencyList, FetchFuture, FetchOptions, FetchResult, Fetcher};
pub use loader::{Loader, LoaderOptions};
pub use resolver::{DefaultResolver, Resolution, Resolver, VersionRanges};
pub use styles::{DiscardStyles, MemoryStyles, StyleSink, STYLE_NODE_ATTR};
pub use value::{ArrayRef, FunctionRef, ObjectRef, PromiseRef, Value};
pub use wrapper::{Module, ModuleWrapper};

/// Version of the loader engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
