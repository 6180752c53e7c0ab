// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The linking and execution engine
//!
//! The [`Loader`] owns the graph of in-flight fetches (keyed by URL) and
//! materialized module wrappers (keyed by id), drives preparation and
//! entry-point execution, and latches fatal errors. The same module may be
//! requested through several URLs; fetches are deduplicated per URL and
//! wrappers per id, with late arrivals merged into the existing wrapper.
//!
//! The loader is single-threaded cooperative: it spawns its continuations
//! with `tokio::task::spawn_local` and therefore must be used inside a
//! [`tokio::task::LocalSet`].

use crate::compile::SourceCompiler;
use crate::error::{LoaderError, Result};
use crate::fetch::{DependencyList, FetchOptions, Fetcher};
use crate::fetch::FetchResult;
use crate::promise::Deferred;
use crate::resolver::{DefaultResolver, Resolution, Resolver, VersionRanges};
use crate::styles::{DiscardStyles, StyleSink};
use crate::value::{FunctionRef, Value};
use crate::wrapper::{Body, Module, ModuleWrapper};
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::{Rc, Weak};
use tracing::{debug, error, instrument};

/// Hook invoked once, immediately before the first entry-point executes.
pub type EntryHook = Box<dyn Fn()>;

/// Hook invoked with the first latched error.
pub type ErrorHook = Box<dyn Fn(&LoaderError)>;

/// Caller-facing configuration.
pub struct LoaderOptions {
    /// Resolver implementation; defaults to [`DefaultResolver`].
    pub resolver: Option<Rc<dyn Resolver>>,
    /// Style sink; defaults to [`DiscardStyles`].
    pub styles: Option<Rc<dyn StyleSink>>,
    /// Names and values injected as free variables into every compiled
    /// module body.
    pub globals: Vec<(String, Value)>,
    /// Receiver bound as `this` of every module body.
    pub module_this: Value,
    /// Called once, immediately before the first entry-point executes.
    pub on_entry: Option<EntryHook>,
    /// Called with the first latched error; when absent, latched errors
    /// are logged instead.
    pub on_error: Option<ErrorHook>,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            resolver: None,
            styles: None,
            globals: Vec::new(),
            module_this: Value::Undefined,
            on_entry: None,
            on_error: None,
        }
    }
}

/// An in-flight or completed fetch for one URL.
struct Load {
    /// Wrappers that claimed this URL while the fetch was outstanding.
    required_by: RefCell<Vec<ModuleWrapper>>,
    /// Settles with the prepared wrapper the fetch produced.
    deferred: Rc<Deferred<ModuleWrapper>>,
}

pub(crate) struct LoaderInner {
    fetcher: Rc<dyn Fetcher>,
    compiler: Rc<dyn SourceCompiler>,
    resolver: Rc<dyn Resolver>,
    styles: Rc<dyn StyleSink>,
    globals: Vec<(String, Value)>,
    module_this: Value,
    on_entry: Option<EntryHook>,
    on_error: Option<ErrorHook>,
    loads: RefCell<FxHashMap<String, Load>>,
    wrappers: RefCell<FxHashMap<String, ModuleWrapper>>,
    error: RefCell<Option<LoaderError>>,
    error_module_id: RefCell<Option<String>>,
    has_called_on_entry: Cell<bool>,
    next_entry_id: Cell<u64>,
}

/// Cheap-clone handle to the module loading engine.
#[derive(Clone)]
pub struct Loader {
    inner: Rc<LoaderInner>,
}

/// Non-owning handle held by wrappers to break the reference cycle with
/// the loader that owns them.
#[derive(Clone)]
pub(crate) struct WeakLoader {
    inner: Weak<LoaderInner>,
}

impl WeakLoader {
    pub(crate) fn upgrade(&self) -> Option<Loader> {
        self.inner.upgrade().map(|inner| Loader { inner })
    }
}

impl Loader {
    /// Create a loader. The fetcher retrieves module source for URLs the
    /// resolver cannot satisfy locally; the compiler turns source text
    /// into invocable bodies.
    pub fn new(
        fetcher: Rc<dyn Fetcher>,
        compiler: Rc<dyn SourceCompiler>,
        options: LoaderOptions,
    ) -> Self {
        Self {
            inner: Rc::new(LoaderInner {
                fetcher,
                compiler,
                resolver: options
                    .resolver
                    .unwrap_or_else(|| Rc::new(DefaultResolver::new())),
                styles: options.styles.unwrap_or_else(|| Rc::new(DiscardStyles)),
                globals: options.globals,
                module_this: options.module_this,
                on_entry: options.on_entry,
                on_error: options.on_error,
                loads: RefCell::new(FxHashMap::default()),
                wrappers: RefCell::new(FxHashMap::default()),
                error: RefCell::new(None),
                error_module_id: RefCell::new(None),
                has_called_on_entry: Cell::new(false),
                next_entry_id: Cell::new(1),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakLoader {
        WeakLoader {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// The wrapper registered under `id`, if any.
    pub fn wrapper(&self, id: &str) -> Option<ModuleWrapper> {
        self.inner.wrappers.borrow().get(id).cloned()
    }

    /// The module registered under `id`, if any.
    pub fn module(&self, id: &str) -> Option<Module> {
        self.wrapper(id).map(|w| w.module())
    }

    /// The latched error, if the loader has failed.
    pub fn error(&self) -> Option<LoaderError> {
        self.inner.error.borrow().clone()
    }

    /// Id of the module the latched error is attributed to.
    pub fn error_module_id(&self) -> Option<String> {
        self.inner.error_module_id.borrow().clone()
    }

    pub(crate) fn url_binding(&self, url: &str) -> Option<String> {
        self.inner.resolver.url_id(url)
    }

    /// Resolve a request on behalf of a module (or of the caller, with no
    /// parent).
    pub fn resolve(
        &self,
        request: &str,
        parent_id: Option<&str>,
        version_ranges: &VersionRanges,
    ) -> Result<Resolution> {
        self.inner.resolver.resolve(request, parent_id, version_ranges)
    }

    /// Evaluate entry source against a dependency list (or the UMD
    /// marker).
    ///
    /// Creates an entry wrapper (with a synthetic `anonymous://<n>` id if
    /// none is supplied), prepares it, executes it, and returns its
    /// module. Errors latch the loader.
    #[instrument(skip_all, fields(id))]
    pub async fn evaluate(
        &self,
        dependencies: impl Into<DependencyList>,
        code: &str,
        version_ranges: VersionRanges,
        id: Option<&str>,
    ) -> Result<Module> {
        let id = match id {
            Some(id) => id.to_string(),
            None => {
                let n = self.inner.next_entry_id.get();
                self.inner.next_entry_id.set(n + 1);
                format!("anonymous://{}", n)
            }
        };
        tracing::Span::current().record("id", id.as_str());

        let wrapper = match self.prepare_module_wrapper(
            &id,
            code,
            dependencies.into(),
            version_ranges,
            Vec::new(),
            None,
            None,
        ) {
            Ok(wrapper) => wrapper,
            Err(err) => {
                self.set_error(err.clone(), Some(&id));
                return Err(err);
            }
        };

        match wrapper.wait_prepared().await {
            Ok(()) => {
                self.run_entry(&wrapper)?;
                Ok(wrapper.module())
            }
            Err(err) => {
                self.set_error(err.clone(), Some(&id));
                Err(err)
            }
        }
    }

    /// Load a module by request with no parent context.
    ///
    /// Modules that arrive this way are entry points: they execute as soon
    /// as they are prepared. Errors latch the loader.
    #[instrument(skip(self))]
    pub async fn require(&self, request: &str) -> Result<Module> {
        let resolution = match self.resolve(request, None, &VersionRanges::new()) {
            Ok(resolution) => resolution,
            Err(err) => {
                self.set_error(err.clone(), None);
                return Err(err);
            }
        };

        match resolution {
            Resolution::Available { id } => match self.wrapper(&id) {
                Some(wrapper) => Ok(wrapper.module()),
                None => {
                    let err = LoaderError::unresolvable(request, None);
                    self.set_error(err.clone(), None);
                    Err(err)
                }
            },
            Resolution::NeedFetch { url } => {
                let load = self.load_wrapper(&url, None, Some(request));
                match load.wait().await {
                    Ok(wrapper) => Ok(wrapper.module()),
                    Err(err) => {
                        self.set_error(err.clone(), None);
                        Err(err)
                    }
                }
            }
        }
    }

    /// Install an already-constructed module value under `id`.
    pub fn preload_module(&self, id: &str, exports: Value, css: Option<&str>) -> Result<Module> {
        debug!(id, "preloading module");
        let wrapper = self.prepare_module_wrapper(
            id,
            "",
            DependencyList::default(),
            VersionRanges::new(),
            Vec::new(),
            css.map(str::to_string),
            Some(exports),
        )?;
        Ok(wrapper.module())
    }

    /// Fetch (or join the in-flight fetch of) the wrapper behind a URL.
    ///
    /// Three cases: a wrapper already registered under the URL's known id
    /// is returned as settled; an outstanding load for the URL absorbs the
    /// new claimant and is shared; otherwise a fetch is started and its
    /// continuation prepares the wrapper, runs it if it is an entry point,
    /// and settles the returned cell.
    pub(crate) fn load_wrapper(
        &self,
        url: &str,
        required_by: Option<ModuleWrapper>,
        original_request: Option<&str>,
    ) -> Rc<Deferred<ModuleWrapper>> {
        if let Some(id) = self.inner.resolver.url_id(url) {
            if let Some(wrapper) = self.wrapper(&id) {
                let done = Rc::new(Deferred::new());
                done.resolve(wrapper);
                return done;
            }
        }

        if let Some(load) = self.inner.loads.borrow().get(url) {
            debug!(url, "joining in-flight fetch");
            if let Some(claimant) = required_by {
                load.required_by.borrow_mut().push(claimant);
            }
            return Rc::clone(&load.deferred);
        }

        let deferred = Rc::new(Deferred::new());
        let options = FetchOptions {
            required_by_id: required_by.as_ref().map(|w| w.id().to_string()),
            original_request: original_request.map(str::to_string),
        };
        self.inner.loads.borrow_mut().insert(
            url.to_string(),
            Load {
                required_by: RefCell::new(required_by.into_iter().collect()),
                deferred: Rc::clone(&deferred),
            },
        );

        debug!(url, "starting fetch");
        let future = self.inner.fetcher.fetch(url, options);
        let loader = self.clone();
        let settle = Rc::clone(&deferred);
        tokio::task::spawn_local(async move {
            match future.await {
                Err(err) => settle.reject(err),
                Ok(result) => match loader.handle_fetch_result(result) {
                    Err(err) => settle.reject(err),
                    Ok((wrapper, is_entry)) => match wrapper.wait_prepared().await {
                        Err(err) => settle.reject(err),
                        Ok(()) => {
                            if is_entry {
                                if let Err(err) = loader.run_entry(&wrapper) {
                                    settle.reject(err);
                                    return;
                                }
                            }
                            settle.resolve(wrapper);
                        }
                    },
                },
            }
        });
        deferred
    }

    /// Process a completed fetch: bind the URL to the id it produced and
    /// either merge into the wrapper that id already has (it was fetched
    /// through another URL) or construct a new one.
    fn handle_fetch_result(&self, result: FetchResult) -> Result<(ModuleWrapper, bool)> {
        if let Some(err) = self.error() {
            debug!(url = %result.url, "discarding fetch result; loader has failed");
            return Err(err);
        }
        debug!(url = %result.url, id = %result.id, "fetch completed");
        self.inner
            .resolver
            .register_resolved_url(&result.url, &result.id);

        let required_by: Vec<ModuleWrapper> = self
            .inner
            .loads
            .borrow()
            .get(&result.url)
            .map(|load| load.required_by.borrow().clone())
            .unwrap_or_default();

        if let Some(existing) = self.wrapper(&result.id) {
            existing.add_to_required_by(&required_by);
            return Ok((existing, false));
        }

        let is_entry = required_by.is_empty();
        let wrapper = self.prepare_module_wrapper(
            &result.id,
            &result.code,
            result.dependencies,
            result.dependency_version_ranges,
            required_by,
            result.css,
            None,
        )?;
        Ok((wrapper, is_entry))
    }

    /// Construct, register, and start preparing a wrapper.
    ///
    /// Registration happens before preparation so that cyclic peers can
    /// observe each other mid-prepare.
    #[allow(clippy::too_many_arguments)]
    fn prepare_module_wrapper(
        &self,
        id: &str,
        code: &str,
        dependencies: DependencyList,
        version_ranges: VersionRanges,
        required_by: Vec<ModuleWrapper>,
        css: Option<String>,
        preloaded: Option<Value>,
    ) -> Result<ModuleWrapper> {
        if let Some(err) = self.error() {
            return Err(err);
        }

        if let Some(css) = &css {
            self.inner.styles.apply(id, css);
        }

        let wrapper = ModuleWrapper::new(self, id.to_string(), version_ranges);
        let prepare_requests: Vec<String> = if let Some(exports) = preloaded {
            wrapper.install_preloaded(exports);
            Vec::new()
        } else if dependencies.is_umd() {
            let (body, requests) = match self.build_umd_body(id, code) {
                Ok(built) => built,
                Err(err) => {
                    self.set_error(err.clone(), Some(id));
                    return Err(err);
                }
            };
            wrapper.set_body(body);
            requests
        } else {
            match self.build_function_body(id, code) {
                Ok(body) => wrapper.set_body(body),
                Err(err) => {
                    self.set_error(err.clone(), Some(id));
                    return Err(err);
                }
            }
            dependencies.requests().to_vec()
        };

        self.inner
            .wrappers
            .borrow_mut()
            .insert(id.to_string(), wrapper.clone());
        self.inner.resolver.register_id(id);

        wrapper.prepare(&prepare_requests, &required_by)?;
        Ok(wrapper)
    }

    /// Compile a commonjs body: `fn(...globals, require, module, exports)`
    /// bound to the configured receiver with the globals filled in.
    fn build_function_body(&self, id: &str, code: &str) -> Result<Body> {
        let mut free: Vec<String> = self
            .inner
            .globals
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        free.extend(
            ["require", "module", "exports"]
                .into_iter()
                .map(str::to_string),
        );
        let compiled = self
            .inner
            .compiler
            .compile(code, &free)
            .map_err(|err| LoaderError::compile(id, err.to_string()))?;
        let leading: Vec<Value> = self
            .inner
            .globals
            .iter()
            .map(|(_, value)| value.clone())
            .collect();
        Ok(Body::Function(
            compiled.bind(self.inner.module_this.clone(), leading),
        ))
    }

    /// Compile a UMD bundle as `fn(define, ...globals)` and invoke it now
    /// with a synthesized `define` to capture the factory and its
    /// dependency list. The factory itself runs at execution time.
    ///
    /// `define` tolerates the AMD argument-omission rules: an optional
    /// module name string (ignored; ids come from the fetch), an optional
    /// dependency array, and the factory in whichever slot remains. The
    /// literal `"exports"` dependency is satisfied by the live exports
    /// object at invocation and is not waited on.
    fn build_umd_body(&self, id: &str, code: &str) -> Result<(Body, Vec<String>)> {
        let mut free = vec!["define".to_string()];
        free.extend(self.inner.globals.iter().map(|(name, _)| name.clone()));
        let compiled = self
            .inner
            .compiler
            .compile(code, &free)
            .map_err(|err| LoaderError::compile(id, err.to_string()))?;

        let captured: Rc<RefCell<Option<(Vec<String>, FunctionRef)>>> =
            Rc::new(RefCell::new(None));
        let sink = Rc::clone(&captured);
        let define = FunctionRef::new(move |args| {
            let mut deps: Option<Vec<String>> = None;
            let mut factory: Option<FunctionRef> = None;
            for arg in args {
                match arg {
                    // A leading module name; ids come from the fetch
                    Value::String(_) => {}
                    Value::Array(list) if deps.is_none() && factory.is_none() => {
                        deps = Some(
                            list.to_vec()
                                .iter()
                                .filter_map(|v| v.as_str().map(str::to_string))
                                .collect(),
                        );
                    }
                    Value::Function(f) if factory.is_none() => factory = Some(f.clone()),
                    _ => {}
                }
            }
            let factory = factory
                .ok_or_else(|| LoaderError::type_error("define expects a factory function"))?;
            *sink.borrow_mut() = Some((deps.unwrap_or_default(), factory));
            Ok(Value::Undefined)
        });
        define.set("amd", Value::object());

        let mut args = vec![Value::Function(define)];
        args.extend(self.inner.globals.iter().map(|(_, value)| value.clone()));
        compiled
            .call(&self.inner.module_this, &args)
            .map_err(|err| LoaderError::compile(id, err.to_string()))?;

        let Some((dependencies, factory)) = captured.borrow_mut().take() else {
            return Err(LoaderError::compile(id, "UMD module never called define"));
        };
        let prepare_requests = dependencies
            .iter()
            .filter(|dep| dep.as_str() != "exports")
            .cloned()
            .collect();
        Ok((
            Body::Umd {
                factory,
                dependencies,
            },
            prepare_requests,
        ))
    }

    /// Run a prepared entry-point wrapper: `on_entry` first (once per
    /// loader), then the body. Failures latch.
    fn run_entry(&self, wrapper: &ModuleWrapper) -> Result<()> {
        if wrapper.is_loaded() {
            return Ok(());
        }
        self.fire_on_entry();
        if let Err(err) = wrapper.execute() {
            self.set_error(err.clone(), Some(wrapper.id()));
            return Err(err);
        }
        Ok(())
    }

    fn fire_on_entry(&self) {
        if self.inner.has_called_on_entry.replace(true) {
            return;
        }
        if let Some(hook) = &self.inner.on_entry {
            hook();
        }
    }

    /// Latch a fatal error. Relatching the same error is a no-op; a
    /// different error after latching is logged but does not replace the
    /// first. The error hook fires only for the first write.
    pub fn set_error(&self, err: LoaderError, module_id: Option<&str>) {
        {
            let mut latched = self.inner.error.borrow_mut();
            match &*latched {
                Some(existing) if *existing == err => return,
                Some(existing) => {
                    error!(error = %err, latched = %existing, "error while loader already latched");
                    return;
                }
                None => *latched = Some(err.clone()),
            }
        }
        *self.inner.error_module_id.borrow_mut() = module_id.map(str::to_string);
        match &self.inner.on_error {
            Some(hook) => hook(&err),
            None => {
                error!(error = %err, module = module_id.unwrap_or("<unknown>"), "module loading failed")
            }
        }
    }

    /// Drop failed loads and failed wrappers and unlatch the error.
    /// Successfully prepared modules survive; fetches still in flight are
    /// left to complete and will be processed normally.
    pub fn clear_error(&self) {
        if self.inner.error.borrow().is_none() {
            return;
        }

        let failed_urls: Vec<String> = self
            .inner
            .loads
            .borrow()
            .iter()
            .filter(|(_, load)| load.deferred.is_rejected())
            .map(|(url, _)| url.clone())
            .collect();
        for url in &failed_urls {
            self.inner.loads.borrow_mut().remove(url);
            self.inner.resolver.unregister_url(url);
        }

        let failed_ids: Vec<String> = self
            .inner
            .wrappers
            .borrow()
            .iter()
            .filter(|(_, wrapper)| wrapper.prepare_failed())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &failed_ids {
            self.inner.wrappers.borrow_mut().remove(id);
            self.inner.resolver.unregister_id(id);
        }

        debug!(
            loads = failed_urls.len(),
            wrappers = failed_ids.len(),
            "cleared error state"
        );
        *self.inner.error.borrow_mut() = None;
        *self.inner.error_module_id.borrow_mut() = None;
    }

    /// Remove `id` and everything that transitively depends on it from
    /// the wrapper and load tables and from the resolver's URL bindings.
    /// Side effects of already-executed bodies are not reversed.
    pub fn unload(&self, id: &str) {
        if self.wrapper(id).is_none() {
            return;
        }

        let mut doomed: HashSet<String> = HashSet::new();
        let mut queue = vec![id.to_string()];
        while let Some(current) = queue.pop() {
            if !doomed.insert(current.clone()) {
                continue;
            }
            if let Some(wrapper) = self.wrapper(&current) {
                for dependent in wrapper.required_by_ids() {
                    if !doomed.contains(&dependent) {
                        queue.push(dependent);
                    }
                }
            }
        }

        debug!(id, count = doomed.len(), "unloading module and its dependents");
        for doomed_id in &doomed {
            self.inner.wrappers.borrow_mut().remove(doomed_id);
            for url in self.inner.resolver.urls_for_id(doomed_id) {
                self.inner.loads.borrow_mut().remove(&url);
                self.inner.resolver.unregister_url(&url);
            }
            self.inner.resolver.unregister_id(doomed_id);
        }
    }
}
