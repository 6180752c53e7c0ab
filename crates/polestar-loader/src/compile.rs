// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Source compilation interface
//!
//! The loader does not evaluate source text itself; the host supplies a
//! [`SourceCompiler`] that turns a source string and a list of free
//! variable names into an invocable function. The loader binds the
//! receiver and any leading arguments (injected globals) ahead of time and
//! invokes the rest positionally.

use crate::error::Result;
use crate::value::Value;
use std::rc::Rc;

/// Compiles module source into invocable functions.
pub trait SourceCompiler {
    /// Compile `code` with the given free variable names in scope. The
    /// returned function receives one positional argument per name.
    fn compile(&self, code: &str, free_variables: &[String]) -> Result<CompiledFunction>;
}

/// A compiled module body, invocable with a receiver and positional
/// arguments bound to the declared free variables.
#[derive(Clone)]
pub struct CompiledFunction {
    f: Rc<dyn Fn(&Value, &[Value]) -> Result<Value>>,
}

impl CompiledFunction {
    /// Wrap a native implementation.
    pub fn new(f: impl Fn(&Value, &[Value]) -> Result<Value> + 'static) -> Self {
        Self { f: Rc::new(f) }
    }

    /// Invoke with an explicit receiver and full argument list.
    pub fn call(&self, this: &Value, args: &[Value]) -> Result<Value> {
        (self.f)(this, args)
    }

    /// Fix the receiver and leading arguments, leaving the rest to be
    /// supplied at call time.
    pub fn bind(&self, this: Value, leading: Vec<Value>) -> BoundFunction {
        BoundFunction {
            inner: self.clone(),
            this,
            leading,
        }
    }
}

/// A [`CompiledFunction`] with its receiver and leading arguments fixed.
#[derive(Clone)]
pub struct BoundFunction {
    inner: CompiledFunction,
    this: Value,
    leading: Vec<Value>,
}

impl BoundFunction {
    /// Invoke with the trailing positional arguments.
    pub fn call(&self, trailing: &[Value]) -> Result<Value> {
        let mut args = self.leading.clone();
        args.extend_from_slice(trailing);
        self.inner.call(&self.this, &args)
    }
}
