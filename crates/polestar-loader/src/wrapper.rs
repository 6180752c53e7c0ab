// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Per-module linking state machine
//!
//! A [`ModuleWrapper`] tracks one module from construction through
//! preparation to execution. Preparation is a barrier: the wrapper waits
//! for each dependency to be present as a wrapper, except dependencies
//! that transitively require *this* module (cycle peers), which are
//! skipped so that cyclic graphs still terminate. Execution is strictly
//! synchronous; a `require` of a not-yet-executed dependency executes it
//! on the spot, giving commonjs cycle semantics.

use crate::compile::BoundFunction;
use crate::error::{LoaderError, Result};
use crate::loader::{Loader, WeakLoader};
use crate::promise::Deferred;
use crate::resolver::{Resolution, VersionRanges};
use crate::value::{FunctionRef, ObjectRef, PromiseRef, Value};
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use tracing::debug;

/// The module object observable to executed code: `{id, exports, loaded,
/// require}`. `require` carries an attached `resolve` function.
#[derive(Clone)]
pub struct Module {
    object: ObjectRef,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module").field("id", &self.id()).finish()
    }
}

impl Module {
    pub(crate) fn from_object(object: ObjectRef) -> Self {
        Self { object }
    }

    /// The module's canonical id.
    pub fn id(&self) -> String {
        self.object
            .get("id")
            .as_str()
            .unwrap_or_default()
            .to_string()
    }

    /// The current exports value.
    pub fn exports(&self) -> Value {
        self.object.get("exports")
    }

    /// Whether the module body has run.
    pub fn is_loaded(&self) -> bool {
        self.object.get("loaded").truthy()
    }

    /// Invoke the module's `require` function.
    pub fn require(&self, request: &str) -> Result<Value> {
        self.object
            .get("require")
            .expect_function("module.require")?
            .call(&[Value::from(request)])
    }

    /// The module object as a [`Value`].
    pub fn as_value(&self) -> Value {
        Value::Object(self.object.clone())
    }
}

/// The executable body of a module.
#[derive(Clone)]
pub(crate) enum Body {
    /// No body; used for preloaded modules.
    Noop,
    /// Compiled commonjs body, invoked as `fn(require, module, exports)`.
    Function(BoundFunction),
    /// Captured UMD factory and the dependency list its `define` declared.
    Umd {
        factory: FunctionRef,
        dependencies: Vec<String>,
    },
}

struct WrapperInner {
    id: String,
    loader: WeakLoader,
    module: ObjectRef,
    body: RefCell<Body>,
    version_ranges: VersionRanges,
    /// Ids of modules that directly or transitively depend on this one.
    /// Closed transitively on each insertion.
    required_by: RefCell<HashSet<String>>,
    /// URLs or ids still awaited before this wrapper is Prepared. Only
    /// set membership and removal matter.
    waiting_for: RefCell<Vec<String>>,
    /// Fetches started from inside `require.resolve`, keyed by the
    /// original request, so a subsequent `require` can resume them.
    dynamic_imports: RefCell<FxHashMap<String, Rc<Deferred<ModuleWrapper>>>>,
    is_prepared: Cell<bool>,
    prepared: Deferred<()>,
}

/// Cheap-clone handle to a module's linking state. One wrapper exists per
/// distinct module id.
#[derive(Clone)]
pub struct ModuleWrapper {
    inner: Rc<WrapperInner>,
}

impl ModuleWrapper {
    pub(crate) fn new(loader: &Loader, id: String, version_ranges: VersionRanges) -> Self {
        let module = ObjectRef::new();
        module.set("id", Value::from(id.clone()));
        module.set("exports", Value::object());
        module.set("loaded", Value::Boolean(false));

        let wrapper = Self {
            inner: Rc::new(WrapperInner {
                id,
                loader: loader.downgrade(),
                module: module.clone(),
                body: RefCell::new(Body::Noop),
                version_ranges,
                required_by: RefCell::new(HashSet::new()),
                waiting_for: RefCell::new(Vec::new()),
                dynamic_imports: RefCell::new(FxHashMap::default()),
                is_prepared: Cell::new(false),
                prepared: Deferred::new(),
            }),
        };
        module.set("require", wrapper.build_require());
        wrapper
    }

    /// The module's canonical id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The observable module object.
    pub fn module(&self) -> Module {
        Module::from_object(self.inner.module.clone())
    }

    /// The current exports value.
    pub fn exports(&self) -> Value {
        self.inner.module.get("exports")
    }

    /// Whether the module body has run.
    pub fn is_loaded(&self) -> bool {
        self.inner.module.get("loaded").truthy()
    }

    /// Whether every awaited dependency is present (or tolerated as a
    /// cycle peer).
    pub fn is_prepared(&self) -> bool {
        self.inner.is_prepared.get()
    }

    pub(crate) async fn wait_prepared(&self) -> Result<()> {
        self.inner.prepared.wait().await
    }

    pub(crate) fn prepare_failed(&self) -> bool {
        self.inner.prepared.is_rejected()
    }

    pub(crate) fn required_by_ids(&self) -> Vec<String> {
        self.inner.required_by.borrow().iter().cloned().collect()
    }

    pub(crate) fn set_body(&self, body: Body) {
        *self.inner.body.borrow_mut() = body;
    }

    /// Install an already-constructed exports value and mark the module
    /// loaded without a body.
    pub(crate) fn install_preloaded(&self, exports: Value) {
        self.inner.module.set("exports", exports);
        self.inner.module.set("loaded", Value::Boolean(true));
        *self.inner.body.borrow_mut() = Body::Noop;
    }

    fn loader(&self) -> Result<Loader> {
        self.inner
            .loader
            .upgrade()
            .ok_or_else(|| LoaderError::generic("loader has been dropped"))
    }

    /// Build the `require` function exposed on the module object, with its
    /// attached `resolve`.
    fn build_require(&self) -> Value {
        let weak = Rc::downgrade(&self.inner);
        let require = FunctionRef::new(move |args| {
            let inner = weak
                .upgrade()
                .ok_or_else(|| LoaderError::generic("loader has been dropped"))?;
            let request = request_arg(args, "require")?;
            ModuleWrapper { inner }.require(&request)
        });

        let weak = Rc::downgrade(&self.inner);
        let resolve = FunctionRef::new(move |args| {
            let inner = weak
                .upgrade()
                .ok_or_else(|| LoaderError::generic("loader has been dropped"))?;
            let request = request_arg(args, "require.resolve")?;
            ModuleWrapper { inner }
                .require_resolve(&request)
                .map(Value::from)
        });
        require.set("resolve", Value::Function(resolve));
        Value::Function(require)
    }

    /// Resolve a request in this module's context.
    ///
    /// For a request that needs a fetch, the fetch is started
    /// *synchronously* and recorded under the request, so that a
    /// subsequent `require` of the same request can pick it up as a
    /// dynamic import. Returns the resolved id, or the URL for a fetch in
    /// progress.
    pub fn require_resolve(&self, request: &str) -> Result<String> {
        let loader = self.loader()?;
        match loader.resolve(request, Some(self.id()), &self.inner.version_ranges)? {
            Resolution::Available { id } => Ok(id),
            Resolution::NeedFetch { url } => {
                let load = loader.load_wrapper(&url, Some(self.clone()), Some(request));
                self.inner
                    .dynamic_imports
                    .borrow_mut()
                    .insert(request.to_string(), load);
                Ok(url)
            }
        }
    }

    /// The `require` exposed to executing module code.
    ///
    /// Returns exports synchronously when the dependency was prepared
    /// ahead of time. A request first discovered during execution returns
    /// a [`Value::Promise`] of the exports instead.
    pub fn require(&self, request: &str) -> Result<Value> {
        let requested = self.require_resolve(request)?;
        if requested == self.inner.id {
            return Err(LoaderError::cyclic(self.id()));
        }

        let loader = self.loader()?;
        if let Some(dep) = loader.wrapper(&requested) {
            if !dep.is_loaded() {
                dep.execute()?;
            }
            return Ok(dep.exports());
        }

        let pending = self.inner.dynamic_imports.borrow().get(request).cloned();
        match pending {
            Some(load) => {
                let promise = PromiseRef::pending();
                let settle = promise.clone();
                let request = request.to_string();
                let parent = self.inner.id.clone();
                tokio::task::spawn_local(async move {
                    match load.wait().await {
                        Ok(dep) => {
                            if !dep.is_loaded() {
                                if let Err(err) = dep.execute() {
                                    settle.reject(err);
                                    return;
                                }
                            }
                            settle.resolve(dep.exports());
                        }
                        Err(_) => {
                            settle.reject(LoaderError::unresolvable(request, Some(&parent)))
                        }
                    }
                });
                Ok(Value::Promise(promise))
            }
            None => Err(LoaderError::unresolvable(request, Some(self.id()))),
        }
    }

    /// Record that `w` (and everything that requires `w`) requires this
    /// module.
    fn add_required_by(&self, w: &ModuleWrapper) {
        if Rc::ptr_eq(&self.inner, &w.inner) {
            return;
        }
        let mut required_by = self.inner.required_by.borrow_mut();
        required_by.insert(w.id().to_string());
        for id in w.inner.required_by.borrow().iter() {
            if id != &self.inner.id {
                required_by.insert(id.clone());
            }
        }
    }

    /// Build the waiting set for this wrapper's dependencies and arrange
    /// for [`Self::stop_waiting_for`] as each one becomes ready.
    ///
    /// Dependencies that already require this module would deadlock the
    /// barrier and are skipped outright; they are guaranteed to be
    /// registered (construction registers a wrapper before preparing it),
    /// which is all execution needs.
    pub(crate) fn prepare(
        &self,
        dependency_requests: &[String],
        required_by: &[ModuleWrapper],
    ) -> Result<()> {
        for w in required_by {
            self.add_required_by(w);
        }

        let loader = self.loader()?;
        for request in dependency_requests {
            let resolution =
                match loader.resolve(request, Some(self.id()), &self.inner.version_ranges) {
                    Ok(resolution) => resolution,
                    Err(err) => {
                        self.reject_prepared(err.clone());
                        return Err(err);
                    }
                };

            match resolution {
                Resolution::Available { id } => {
                    let Some(dep) = loader.wrapper(&id) else {
                        let err = LoaderError::unresolvable(request.clone(), Some(self.id()));
                        self.reject_prepared(err.clone());
                        return Err(err);
                    };
                    if Rc::ptr_eq(&dep.inner, &self.inner) {
                        continue;
                    }
                    if self.inner.required_by.borrow().contains(&id) {
                        debug!(module = %self.inner.id, dep = %id, "cycle peer; not waiting");
                        continue;
                    }
                    if dep.is_prepared() {
                        continue;
                    }
                    self.inner.waiting_for.borrow_mut().push(id.clone());
                    let this = self.clone();
                    tokio::task::spawn_local(async move {
                        match dep.wait_prepared().await {
                            Ok(()) => this.stop_waiting_for(&id),
                            Err(err) => this.reject_prepared(err),
                        }
                    });
                }
                Resolution::NeedFetch { url } => {
                    self.inner.waiting_for.borrow_mut().push(url.clone());
                    let load = loader.load_wrapper(&url, Some(self.clone()), Some(request.as_str()));
                    let this = self.clone();
                    tokio::task::spawn_local(async move {
                        match load.wait().await {
                            Ok(_) => this.stop_waiting_for(&url),
                            Err(err) => this.reject_prepared(err),
                        }
                    });
                }
            }
        }

        if self.inner.waiting_for.borrow().is_empty() {
            self.mark_prepared();
        }
        Ok(())
    }

    /// A shared dependency was late-claimed by additional consumers.
    /// Extend `required_by` and release any waits that just became cycles.
    pub(crate) fn add_to_required_by(&self, new_required_by: &[ModuleWrapper]) {
        if new_required_by.is_empty() {
            return;
        }
        for w in new_required_by {
            self.add_required_by(w);
        }

        let Ok(loader) = self.loader() else { return };
        let keys: Vec<String> = self.inner.waiting_for.borrow().clone();
        for key in keys {
            let id = if loader.wrapper(&key).is_some() {
                Some(key.clone())
            } else {
                loader.url_binding(&key)
            };
            let Some(id) = id else { continue };
            if self.inner.required_by.borrow().contains(&id) {
                debug!(module = %self.inner.id, dep = %id, "dependency became a cycle peer");
                self.stop_waiting_for(&key);
            }
        }
    }

    /// Remove `key` from the waiting set; the wrapper becomes Prepared
    /// when the set empties. A no-op for keys not present.
    pub(crate) fn stop_waiting_for(&self, key: &str) {
        let mut waiting = self.inner.waiting_for.borrow_mut();
        let Some(pos) = waiting.iter().position(|k| k == key) else {
            return;
        };
        waiting.remove(pos);
        let now_empty = waiting.is_empty();
        drop(waiting);
        if now_empty {
            self.mark_prepared();
        }
    }

    fn mark_prepared(&self) {
        if self.inner.prepared.is_rejected() || self.inner.is_prepared.replace(true) {
            return;
        }
        debug!(module = %self.inner.id, "prepared");
        self.inner.prepared.resolve(());
    }

    fn reject_prepared(&self, err: LoaderError) {
        debug!(module = %self.inner.id, error = %err, "preparation failed");
        self.inner.prepared.reject(err);
    }

    /// Run the module body. The body runs at most once; requiring a module
    /// that is mid-execution observes its partial exports.
    pub fn execute(&self) -> Result<()> {
        if self.is_loaded() {
            return Err(LoaderError::AlreadyExecuted(self.id().to_string()));
        }
        self.inner.module.set("loaded", Value::Boolean(true));

        let body: Body = self.inner.body.borrow().clone();
        match body {
            Body::Noop => Ok(()),
            Body::Function(f) => {
                let require = self.inner.module.get("require");
                let exports = self.inner.module.get("exports");
                f.call(&[require, Value::Object(self.inner.module.clone()), exports])?;
                Ok(())
            }
            Body::Umd {
                factory,
                dependencies,
            } => {
                let mut args = Vec::with_capacity(dependencies.len());
                for dep in &dependencies {
                    if dep == "exports" {
                        args.push(self.inner.module.get("exports"));
                    } else {
                        args.push(self.require(dep)?);
                    }
                }
                let returned = factory.call(&args)?;
                if !returned.is_undefined() {
                    self.inner.module.set("exports", returned);
                }
                Ok(())
            }
        }
    }
}

fn request_arg(args: &[Value], what: &str) -> Result<String> {
    args.first()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| LoaderError::type_error(format!("{} expects a request string", what)))
}
