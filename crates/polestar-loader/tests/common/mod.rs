//! Shared fixtures for loader integration tests: a canned fetch table and
//! a table-driven compiler that maps known source strings to native
//! bodies.

#![allow(dead_code)]

use polestar_loader::promise::Deferred;
use polestar_loader::{
    CompiledFunction, DependencyList, FetchFuture, FetchOptions, FetchResult, Fetcher,
    FunctionRef, LoaderError, ObjectRef, Result, SourceCompiler, Value,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Serves canned fetch results, recording every call. URLs can be gated
/// so a test controls when the fetch completes.
#[derive(Default)]
pub struct ScriptedFetcher {
    routes: RefCell<HashMap<String, Result<FetchResult>>>,
    gates: RefCell<HashMap<String, Rc<Deferred<()>>>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Serve `result` for its own URL.
    pub fn route(&self, result: FetchResult) {
        self.routes
            .borrow_mut()
            .insert(result.url.clone(), Ok(result));
    }

    /// Fail fetches of `url` with `err`.
    pub fn fail(&self, url: &str, err: LoaderError) {
        self.routes.borrow_mut().insert(url.to_string(), Err(err));
    }

    /// Hold fetches of `url` until the returned cell is resolved.
    pub fn gate(&self, url: &str) -> Rc<Deferred<()>> {
        let gate = Rc::new(Deferred::new());
        self.gates
            .borrow_mut()
            .insert(url.to_string(), Rc::clone(&gate));
        gate
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.borrow().iter().filter(|u| *u == url).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self, url: &str, _options: FetchOptions) -> FetchFuture {
        self.calls.borrow_mut().push(url.to_string());
        let gate = self.gates.borrow().get(url).cloned();
        let outcome = self
            .routes
            .borrow()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(LoaderError::fetch(url, "no scripted response")));
        Box::pin(async move {
            match gate {
                Some(gate) => gate.wait().await?,
                None => tokio::task::yield_now().await,
            }
            outcome
        })
    }
}

/// Access to a mock body's positional arguments by free-variable name.
pub struct Scope {
    names: Vec<String>,
    args: Vec<Value>,
}

impl Scope {
    /// The argument bound to free variable `name`.
    pub fn get(&self, name: &str) -> Value {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.args.get(i).cloned())
            .unwrap_or(Value::Undefined)
    }

    pub fn require(&self, request: &str) -> Result<Value> {
        self.get("require")
            .expect_function("require")?
            .call(&[Value::from(request)])
    }

    pub fn require_resolve(&self, request: &str) -> Result<Value> {
        self.get("require")
            .expect_function("require")?
            .get("resolve")
            .expect_function("require.resolve")?
            .call(&[Value::from(request)])
    }

    pub fn module(&self) -> ObjectRef {
        self.get("module").as_object().cloned().expect("module object")
    }

    pub fn exports(&self) -> ObjectRef {
        self.get("exports").as_object().cloned().expect("exports object")
    }

    pub fn set_exports(&self, value: Value) {
        self.module().set("exports", value);
    }

    pub fn define(&self) -> FunctionRef {
        self.get("define").as_function().cloned().expect("define function")
    }
}

type MockBody = Rc<dyn Fn(&Scope) -> Result<()>>;

/// Compiles by table lookup: every known source string maps to a native
/// body; unknown source is a compile error.
#[derive(Default)]
pub struct TableCompiler {
    bodies: RefCell<HashMap<String, MockBody>>,
}

impl TableCompiler {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn body(&self, code: &str, body: impl Fn(&Scope) -> Result<()> + 'static) {
        self.bodies.borrow_mut().insert(code.to_string(), Rc::new(body));
    }
}

impl SourceCompiler for TableCompiler {
    fn compile(&self, code: &str, free_variables: &[String]) -> Result<CompiledFunction> {
        let Some(body) = self.bodies.borrow().get(code).cloned() else {
            return Err(LoaderError::generic("unknown source text"));
        };
        let names = free_variables.to_vec();
        Ok(CompiledFunction::new(move |_this, args| {
            let scope = Scope {
                names: names.clone(),
                args: args.to_vec(),
            };
            body(&scope)?;
            Ok(Value::Undefined)
        }))
    }
}

/// Fetch result for a plain commonjs module.
pub fn js_module(url: &str, id: &str, code: &str, deps: &[&str]) -> FetchResult {
    FetchResult {
        url: url.to_string(),
        id: id.to_string(),
        code: code.to_string(),
        dependencies: DependencyList::Requests(deps.iter().map(|d| d.to_string()).collect()),
        ..Default::default()
    }
}

/// Fetch result for a UMD bundle.
pub fn umd_module(url: &str, id: &str, code: &str) -> FetchResult {
    FetchResult {
        url: url.to_string(),
        id: id.to_string(),
        code: code.to_string(),
        dependencies: DependencyList::Umd,
        ..Default::default()
    }
}
