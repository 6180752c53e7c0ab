// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Style injection
//!
//! Some modules carry CSS alongside their code. The loader hands that CSS
//! to a [`StyleSink`]; a DOM host maintains one `<style>` element per
//! module id, tagged with [`STYLE_NODE_ATTR`], and replaces its text when
//! the same id is prepared again. Non-DOM hosts can record or discard.

use std::cell::RefCell;
use std::collections::BTreeMap;
use tracing::debug;

/// Attribute a DOM host sets on the `<style>` elements it owns.
pub const STYLE_NODE_ATTR: &str = "data-polestar-style-node";

/// Receives CSS associated with module ids.
pub trait StyleSink {
    /// Install the style text for `id`, replacing any previous text for
    /// the same id in place.
    fn apply(&self, id: &str, css: &str);
}

/// Discards all styles. The default for headless hosts.
#[derive(Debug, Default)]
pub struct DiscardStyles;

impl StyleSink for DiscardStyles {
    fn apply(&self, id: &str, _css: &str) {
        debug!(id, "discarding style for headless host");
    }
}

/// Keeps the latest style text per module id in memory.
#[derive(Debug, Default)]
pub struct MemoryStyles {
    styles: RefCell<BTreeMap<String, String>>,
}

impl MemoryStyles {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current style text for `id`.
    pub fn get(&self, id: &str) -> Option<String> {
        self.styles.borrow().get(id).cloned()
    }

    /// Number of ids with styles.
    pub fn len(&self) -> usize {
        self.styles.borrow().len()
    }

    /// Whether no styles have been applied.
    pub fn is_empty(&self) -> bool {
        self.styles.borrow().is_empty()
    }
}

impl StyleSink for MemoryStyles {
    fn apply(&self, id: &str, css: &str) {
        let mut styles = self.styles.borrow_mut();
        if styles.insert(id.to_string(), css.to_string()).is_some() {
            debug!(id, "replaced style text");
        }
    }
}
