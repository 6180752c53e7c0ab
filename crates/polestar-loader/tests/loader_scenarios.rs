//! End-to-end linking and execution scenarios.

mod common;

use common::{js_module, umd_module, ScriptedFetcher, TableCompiler};
use polestar_loader::{
    DependencyList, Fetcher, Loader, LoaderOptions, SourceCompiler, Value, VersionRanges,
};
use std::cell::Cell;
use std::rc::Rc;
use tokio::task::LocalSet;

fn build_loader(fetcher: &Rc<ScriptedFetcher>, compiler: &Rc<TableCompiler>) -> Loader {
    Loader::new(
        Rc::clone(fetcher) as Rc<dyn Fetcher>,
        Rc::clone(compiler) as Rc<dyn SourceCompiler>,
        LoaderOptions::default(),
    )
}

#[tokio::test]
async fn test_single_entry_with_one_dependency() {
    LocalSet::new()
        .run_until(async {
            let fetcher = ScriptedFetcher::new();
            let compiler = TableCompiler::new();

            fetcher.route(js_module(
                "https://unpkg.com/m@latest",
                "https://unpkg.com/m@1.0.0/index.js",
                "module.exports = 41",
                &[],
            ));
            compiler.body("module.exports = 41", |s| {
                s.set_exports(Value::from(41.0));
                Ok(())
            });
            compiler.body("module.exports = require('m') + 1", |s| {
                let m = s.require("m")?;
                s.set_exports(Value::Number(m.as_number().unwrap() + 1.0));
                Ok(())
            });

            let loader = build_loader(&fetcher, &compiler);
            let module = loader
                .evaluate(
                    ["m"],
                    "module.exports = require('m') + 1",
                    VersionRanges::new(),
                    None,
                )
                .await
                .unwrap();

            assert!(module.is_loaded());
            assert_eq!(module.exports(), Value::from(42.0));
            assert_eq!(module.id(), "anonymous://1");
            assert_eq!(fetcher.calls_for("https://unpkg.com/m@latest"), 1);
        })
        .await;
}

#[tokio::test]
async fn test_diamond_executes_shared_dependency_once() {
    LocalSet::new()
        .run_until(async {
            let fetcher = ScriptedFetcher::new();
            let compiler = TableCompiler::new();

            let a = "https://cdn.test/a.js";
            let b = "https://cdn.test/b.js";
            let c = "https://cdn.test/c.js";

            fetcher.route(js_module(a, a, "a-src", &[c]));
            fetcher.route(js_module(b, b, "b-src", &[c]));
            fetcher.route(js_module(c, c, "c-src", &[]));

            let c_runs = Rc::new(Cell::new(0u32));
            let runs = Rc::clone(&c_runs);
            compiler.body("c-src", move |s| {
                runs.set(runs.get() + 1);
                let exports = s.exports();
                exports.set("n", Value::from(1.0));
                Ok(())
            });
            compiler.body("a-src", |s| {
                let c = s.require("https://cdn.test/c.js")?;
                s.set_exports(c.as_object().unwrap().get("n"));
                Ok(())
            });
            compiler.body("b-src", |s| {
                let c = s.require("https://cdn.test/c.js")?;
                let n = c.as_object().unwrap().get("n").as_number().unwrap();
                s.set_exports(Value::Number(n + 1.0));
                Ok(())
            });
            compiler.body("entry-src", |s| {
                let a = s.require("https://cdn.test/a.js")?.as_number().unwrap();
                let b = s.require("https://cdn.test/b.js")?.as_number().unwrap();
                s.set_exports(Value::Number(a + b));
                Ok(())
            });

            let loader = build_loader(&fetcher, &compiler);
            let module = loader
                .evaluate([a, b], "entry-src", VersionRanges::new(), None)
                .await
                .unwrap();

            assert_eq!(module.exports(), Value::from(3.0));
            assert_eq!(c_runs.get(), 1);
            // One fetch per URL, even though C is claimed from two sides
            assert_eq!(fetcher.calls_for(a), 1);
            assert_eq!(fetcher.calls_for(b), 1);
            assert_eq!(fetcher.calls_for(c), 1);
        })
        .await;
}

#[tokio::test]
async fn test_two_module_cycle_prepares_and_executes() {
    LocalSet::new()
        .run_until(async {
            let fetcher = ScriptedFetcher::new();
            let compiler = TableCompiler::new();

            let a = "https://cdn.test/cycle-a.js";
            let b = "https://cdn.test/cycle-b.js";
            fetcher.route(js_module(a, a, "cycle-a-src", &[b]));
            fetcher.route(js_module(b, b, "cycle-b-src", &[a]));

            // a: exports.a = 1; exports.b = require(b).b
            compiler.body("cycle-a-src", |s| {
                let exports = s.exports();
                exports.set("a", Value::from(1.0));
                let other = s.require("https://cdn.test/cycle-b.js")?;
                exports.set("b", other.as_object().unwrap().get("b"));
                Ok(())
            });
            // b: exports.b = 2; exports.a = require(a).a, observing a's
            // partial exports mid-cycle
            compiler.body("cycle-b-src", |s| {
                let exports = s.exports();
                exports.set("b", Value::from(2.0));
                let other = s.require("https://cdn.test/cycle-a.js")?;
                exports.set("a", other.as_object().unwrap().get("a"));
                Ok(())
            });
            compiler.body("cycle-entry-src", |s| {
                let a = s.require("https://cdn.test/cycle-a.js")?;
                let b = s.require("https://cdn.test/cycle-b.js")?;
                let exports = s.exports();
                exports.set("a", a);
                exports.set("b", b);
                Ok(())
            });

            let loader = build_loader(&fetcher, &compiler);
            let module = loader
                .evaluate([a, b], "cycle-entry-src", VersionRanges::new(), None)
                .await
                .unwrap();

            let exports = module.exports();
            let a_exports = exports.as_object().unwrap().get("a");
            let a_exports = a_exports.as_object().unwrap();
            assert_eq!(a_exports.get("a"), Value::from(1.0));
            assert_eq!(a_exports.get("b"), Value::from(2.0));

            let b_exports = exports.as_object().unwrap().get("b");
            let b_exports = b_exports.as_object().unwrap();
            assert_eq!(b_exports.get("b"), Value::from(2.0));
            assert_eq!(b_exports.get("a"), Value::from(1.0));
        })
        .await;
}

#[tokio::test]
async fn test_umd_entry_with_fetched_dependency() {
    LocalSet::new()
        .run_until(async {
            let fetcher = ScriptedFetcher::new();
            let compiler = TableCompiler::new();

            let dep = "https://cdn.test/dep.js";
            fetcher.route(js_module(dep, dep, "dep-src", &[]));
            compiler.body("dep-src", |s| {
                s.exports().set("value", Value::from(21.0));
                Ok(())
            });

            // (function(f){ if (typeof define==='function' && define.amd)
            //   define(["dep"], f); })(function(dep){ return dep.value*2; })
            compiler.body("umd-entry-src", move |s| {
                let define = s.define();
                assert!(define.get("amd").truthy());
                let factory = polestar_loader::FunctionRef::new(|args| {
                    let dep = args[0].as_object().unwrap();
                    Ok(Value::Number(dep.get("value").as_number().unwrap() * 2.0))
                });
                define.call(&[
                    Value::Array(polestar_loader::ArrayRef::from_vec(vec![Value::from(dep)])),
                    Value::Function(factory),
                ])?;
                Ok(())
            });

            let loader = build_loader(&fetcher, &compiler);
            let module = loader
                .evaluate(
                    DependencyList::Umd,
                    "umd-entry-src",
                    VersionRanges::new(),
                    None,
                )
                .await
                .unwrap();

            assert_eq!(module.exports(), Value::from(42.0));
        })
        .await;
}

#[tokio::test]
async fn test_umd_exports_slot_uses_live_exports_object() {
    LocalSet::new()
        .run_until(async {
            let fetcher = ScriptedFetcher::new();
            let compiler = TableCompiler::new();

            // define(["exports"], function(exports){ exports.answer = 42 })
            // The "exports" slot is satisfied by the live exports object;
            // nothing is fetched for it.
            compiler.body("umd-exports-src", |s| {
                let factory = polestar_loader::FunctionRef::new(|args| {
                    args[0].as_object().unwrap().set("answer", Value::from(42.0));
                    Ok(Value::Undefined)
                });
                s.define().call(&[
                    Value::Array(polestar_loader::ArrayRef::from_vec(vec![Value::from(
                        "exports",
                    )])),
                    Value::Function(factory),
                ])?;
                Ok(())
            });

            let loader = build_loader(&fetcher, &compiler);
            let module = loader
                .evaluate(
                    DependencyList::Umd,
                    "umd-exports-src",
                    VersionRanges::new(),
                    None,
                )
                .await
                .unwrap();

            assert_eq!(
                module.exports().as_object().unwrap().get("answer"),
                Value::from(42.0)
            );
            assert_eq!(fetcher.total_calls(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_same_id_from_two_urls_shares_one_wrapper() {
    LocalSet::new()
        .run_until(async {
            let fetcher = ScriptedFetcher::new();
            let compiler = TableCompiler::new();

            let p = "https://cdn.test/p.js";
            let q = "https://cdn.test/q.js";
            let u1 = "https://cdn.test/shared@%5E1";
            let u2 = "https://cdn.test/shared@1.2.3";
            let shared_id = "https://cdn.test/shared@1.2.3/index.js";

            fetcher.route(js_module(p, p, "p-src", &[u1]));
            fetcher.route(js_module(q, q, "q-src", &[u2]));
            fetcher.route(js_module(u1, shared_id, "shared-src", &[]));
            fetcher.route(js_module(u2, shared_id, "shared-src", &[]));

            let shared_runs = Rc::new(Cell::new(0u32));
            let runs = Rc::clone(&shared_runs);
            compiler.body("shared-src", move |s| {
                runs.set(runs.get() + 1);
                s.exports().set("tag", Value::from("shared"));
                Ok(())
            });
            compiler.body("p-src", |s| {
                s.set_exports(s.require("https://cdn.test/shared@%5E1")?);
                Ok(())
            });
            compiler.body("q-src", |s| {
                s.set_exports(s.require("https://cdn.test/shared@1.2.3")?);
                Ok(())
            });
            compiler.body("share-entry-src", |s| {
                let p = s.require("https://cdn.test/p.js")?;
                let q = s.require("https://cdn.test/q.js")?;
                let exports = s.exports();
                exports.set("p", p);
                exports.set("q", q);
                Ok(())
            });

            let loader = build_loader(&fetcher, &compiler);
            let module = loader
                .evaluate([p, q], "share-entry-src", VersionRanges::new(), None)
                .await
                .unwrap();

            // Each URL fetched once, one wrapper and one execution for the id
            assert_eq!(fetcher.calls_for(u1), 1);
            assert_eq!(fetcher.calls_for(u2), 1);
            assert_eq!(shared_runs.get(), 1);

            // Both consumers hold the same exports object
            let exports = module.exports();
            let through_p = exports.as_object().unwrap().get("p");
            let through_q = exports.as_object().unwrap().get("q");
            assert_eq!(through_p, through_q);

            // The shared wrapper's required-by is the union of claimants:
            // unloading it cascades through both consumers and the entry
            loader.unload(shared_id);
            assert!(loader.module(shared_id).is_none());
            assert!(loader.module(p).is_none());
            assert!(loader.module(q).is_none());
            assert!(loader.module("anonymous://1").is_none());
        })
        .await;
}

#[tokio::test]
async fn test_unload_cascades_and_refetches() {
    LocalSet::new()
        .run_until(async {
            let fetcher = ScriptedFetcher::new();
            let compiler = TableCompiler::new();

            let a = "https://cdn.test/chain-a.js";
            let b = "https://cdn.test/chain-b.js";
            fetcher.route(js_module(a, a, "chain-a-src", &[b]));
            fetcher.route(js_module(b, b, "chain-b-src", &[]));

            compiler.body("chain-b-src", |s| {
                s.set_exports(Value::from("b"));
                Ok(())
            });
            compiler.body("chain-a-src", |s| {
                s.set_exports(s.require("https://cdn.test/chain-b.js")?);
                Ok(())
            });
            compiler.body("chain-entry-src", |s| {
                s.set_exports(s.require("https://cdn.test/chain-a.js")?);
                Ok(())
            });

            let loader = build_loader(&fetcher, &compiler);
            loader
                .evaluate(
                    [a],
                    "chain-entry-src",
                    VersionRanges::new(),
                    Some("https://app.test/entry.js"),
                )
                .await
                .unwrap();

            loader.unload(b);
            assert!(loader.module(b).is_none());
            assert!(loader.module(a).is_none());
            assert!(loader.module("https://app.test/entry.js").is_none());

            // B's URL binding was pruned, so requiring it again refetches
            let module = loader.require(b).await.unwrap();
            assert!(module.is_loaded());
            assert_eq!(fetcher.calls_for(b), 2);
        })
        .await;
}

#[tokio::test]
async fn test_dynamic_import_returns_promise_of_exports() {
    LocalSet::new()
        .run_until(async {
            let fetcher = ScriptedFetcher::new();
            let compiler = TableCompiler::new();

            let dynamic = "https://cdn.test/dynamic.js";
            fetcher.route(js_module(dynamic, dynamic, "dynamic-src", &[]));
            compiler.body("dynamic-src", |s| {
                s.set_exports(Value::from(7.0));
                Ok(())
            });
            // The request is not in the dependency list; require discovers
            // it at execution time and returns a promise
            compiler.body("dynamic-entry-src", |s| {
                let pending = s.require("https://cdn.test/dynamic.js")?;
                assert_eq!(pending.type_of(), "object");
                s.exports().set("pending", pending);
                Ok(())
            });

            let loader = build_loader(&fetcher, &compiler);
            let module = loader
                .evaluate(
                    DependencyList::default(),
                    "dynamic-entry-src",
                    VersionRanges::new(),
                    None,
                )
                .await
                .unwrap();

            let pending = module.exports().as_object().unwrap().get("pending");
            let promise = pending.as_promise().expect("a promise of exports");
            assert_eq!(promise.value().await.unwrap(), Value::from(7.0));
            assert_eq!(fetcher.calls_for(dynamic), 1);
        })
        .await;
}

#[tokio::test]
async fn test_on_entry_fires_once_before_first_execution() {
    LocalSet::new()
        .run_until(async {
            let fetcher = ScriptedFetcher::new();
            let compiler = TableCompiler::new();

            let log: Rc<std::cell::RefCell<Vec<&'static str>>> =
                Rc::new(std::cell::RefCell::new(Vec::new()));

            let body_log = Rc::clone(&log);
            compiler.body("logging-entry-src", move |_| {
                body_log.borrow_mut().push("execute");
                Ok(())
            });

            let hook_log = Rc::clone(&log);
            let loader = Loader::new(
                Rc::clone(&fetcher) as Rc<dyn Fetcher>,
                Rc::clone(&compiler) as Rc<dyn SourceCompiler>,
                LoaderOptions {
                    on_entry: Some(Box::new(move || hook_log.borrow_mut().push("on_entry"))),
                    ..Default::default()
                },
            );

            loader
                .evaluate(
                    DependencyList::default(),
                    "logging-entry-src",
                    VersionRanges::new(),
                    None,
                )
                .await
                .unwrap();
            loader
                .evaluate(
                    DependencyList::default(),
                    "logging-entry-src",
                    VersionRanges::new(),
                    None,
                )
                .await
                .unwrap();

            assert_eq!(*log.borrow(), vec!["on_entry", "execute", "execute"]);
        })
        .await;
}

#[tokio::test]
async fn test_fetched_css_reaches_the_style_sink() {
    LocalSet::new()
        .run_until(async {
            let fetcher = ScriptedFetcher::new();
            let compiler = TableCompiler::new();
            let styles = Rc::new(polestar_loader::MemoryStyles::new());

            let styled = "https://cdn.test/styled.js";
            let mut result = js_module(styled, styled, "styled-src", &[]);
            result.css = Some(".card { margin: 0 }".to_string());
            fetcher.route(result);
            compiler.body("styled-src", |_| Ok(()));
            compiler.body("styled-entry-src", |s| {
                s.require("https://cdn.test/styled.js")?;
                Ok(())
            });

            let loader = Loader::new(
                Rc::clone(&fetcher) as Rc<dyn Fetcher>,
                Rc::clone(&compiler) as Rc<dyn SourceCompiler>,
                LoaderOptions {
                    styles: Some(Rc::clone(&styles) as Rc<dyn polestar_loader::StyleSink>),
                    ..Default::default()
                },
            );

            loader
                .evaluate([styled], "styled-entry-src", VersionRanges::new(), None)
                .await
                .unwrap();

            assert_eq!(styles.get(styled).as_deref(), Some(".card { margin: 0 }"));
        })
        .await;
}

#[tokio::test]
async fn test_umd_dependency_fetched_by_entry() {
    LocalSet::new()
        .run_until(async {
            let fetcher = ScriptedFetcher::new();
            let compiler = TableCompiler::new();

            // A UMD bundle arriving through a fetch, required by a plain
            // commonjs entry
            let lib = "https://cdn.test/lib.umd.js";
            fetcher.route(umd_module(lib, lib, "lib-umd-src"));
            compiler.body("lib-umd-src", |s| {
                let factory = polestar_loader::FunctionRef::new(|_| Ok(Value::from(11.0)));
                s.define().call(&[Value::Function(factory)])?;
                Ok(())
            });
            compiler.body("umd-consumer-src", |s| {
                s.set_exports(s.require("https://cdn.test/lib.umd.js")?);
                Ok(())
            });

            let loader = build_loader(&fetcher, &compiler);
            let module = loader
                .evaluate([lib], "umd-consumer-src", VersionRanges::new(), None)
                .await
                .unwrap();

            assert_eq!(module.exports(), Value::from(11.0));
        })
        .await;
}
