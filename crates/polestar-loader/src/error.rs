// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error types for the module loader

use thiserror::Error;

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Errors surfaced by the loader and by module code at execution time.
///
/// Errors are `Clone` because a latched error is redelivered to every
/// pending preparation; payloads are plain strings rather than source
/// chains.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoaderError {
    /// A module required itself
    #[error("Cyclic dependency: '{0}' requires itself")]
    CyclicDependency(String),

    /// A request could not be mapped to a module
    #[error("Cannot resolve '{request}' (required by '{parent}')", parent = .parent_id.as_deref().unwrap_or("<entry>"))]
    Unresolvable {
        /// The request string as written in module code
        request: String,
        /// Id of the requiring module, if any
        parent_id: Option<String>,
    },

    /// A fetch failed or its result could not be processed
    #[error("Failed to fetch '{url}': {reason}")]
    Fetch {
        /// URL the fetch was issued against
        url: String,
        /// Reason for failure
        reason: String,
    },

    /// The resolver rejected a request
    #[error("Error resolving '{request}': {reason}")]
    Resolution {
        /// The request string
        request: String,
        /// Reason for failure
        reason: String,
    },

    /// Source compilation failed
    #[error("Failed to compile module '{id}': {reason}")]
    Compile {
        /// Id of the module being compiled
        id: String,
        /// Reason for failure
        reason: String,
    },

    /// A module body was invoked a second time
    #[error("Module '{0}' has already been executed")]
    AlreadyExecuted(String),

    /// A value was used where a different type was expected
    #[error("TypeError: {0}")]
    Type(String),

    /// Error thrown by module code or a host collaborator
    #[error("{0}")]
    Generic(String),
}

impl LoaderError {
    /// Create a cyclic dependency error for a module id.
    pub fn cyclic(id: impl Into<String>) -> Self {
        Self::CyclicDependency(id.into())
    }

    /// Create an unresolvable-request error.
    pub fn unresolvable(request: impl Into<String>, parent_id: Option<&str>) -> Self {
        Self::Unresolvable {
            request: request.into(),
            parent_id: parent_id.map(str::to_string),
        }
    }

    /// Create a fetch error.
    pub fn fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a compile error.
    pub fn compile(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Compile {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a type error.
    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::Type(msg.into())
    }

    /// Create a generic error with a message.
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }
}
