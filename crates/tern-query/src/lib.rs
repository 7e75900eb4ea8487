//! TernQL Query Engine
//!
//! Compiles the JSON-shaped query language into join plans over a triple
//! store and evaluates them into nested values.
//!
//! # Overview
//!
//! The pipeline:
//! - lexing and parsing of the query surface syntax
//! - an arena-based AST of query operators
//! - the rewrite phase turning filters and construct patterns into a tree
//!   of joins, unions and set differences
//! - the evaluation phase walking that tree against a store, shaping rows
//!   into nested output values
//!
//! Compiled queries are immutable and may be shared across concurrent
//! evaluations; all evaluation state lives in a per-call context.

pub mod ast;
pub mod eval;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod rewrite;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub use ast::{Ast, OpId, OpKind, SemType, Shape};
pub use eval::{QueryContext, ValueIter};
pub use functions::{FuncMeta, FunctionRegistry};
pub use lexer::{tokenize, Tok};

use tern_core::{Error, JsonSerializer, NameMap, Result, Serializer, Store, Value};
use tracing::debug;

static JSON_SERIALIZER: JsonSerializer = JsonSerializer;

/// A compiled, rewritten query. Immutable after compilation; evaluating it
/// never mutates the tree.
pub struct CompiledQuery {
    ast: Ast,
    root: OpId,
    functions: FunctionRegistry,
}

impl CompiledQuery {
    pub fn ast(&self) -> &Ast {
        &self.ast
    }

    pub fn root(&self) -> OpId {
        self.root
    }

    /// Human-readable dump of the rewritten plan
    pub fn explain(&self) -> String {
        self.ast.explain(self.root)
    }
}

/// Compile a query against a function registry and optional namemap.
/// Returns the compiled query (absent on failure) and diagnostics.
pub fn compile(
    query: &str,
    functions: &FunctionRegistry,
    namemap: Option<&NameMap>,
) -> (Option<CompiledQuery>, Vec<String>) {
    let (parsed, diagnostics) = parser::parse(query, functions, namemap);
    let compiled = parsed.map(|(ast, root)| CompiledQuery {
        ast,
        root,
        functions: functions.clone(),
    });
    (compiled, diagnostics)
}

/// Execution options
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    /// Attach a dump of the rewritten plan
    pub explain: bool,
    /// Record a per-row trace while results are consumed
    pub debug: bool,
    /// Collect evaluation errors instead of failing the whole call
    pub capture_errors: bool,
    /// Keep ids visible so results can drive a later update
    pub for_update: bool,
}

/// A running evaluation: a lazy result sequence plus its side channels.
/// Dropping `results` mid-way abandons the evaluation without further
/// store access.
pub struct Execution<'a> {
    pub results: ValueIter<'a>,
    pub explain: Option<String>,
    debug: Option<Rc<RefCell<String>>>,
}

impl Execution<'_> {
    /// The per-row trace collected so far, when requested
    pub fn debug_text(&self) -> Option<String> {
        self.debug.as_ref().map(|b| b.borrow().clone())
    }
}

/// Evaluate a compiled query against a store
pub fn execute<'a>(
    query: &'a CompiledQuery,
    store: &'a dyn Store,
    bindvars: Option<HashMap<String, Value>>,
    options: &ExecOptions,
) -> Result<Execution<'a>> {
    execute_with_serializer(query, store, &JSON_SERIALIZER, bindvars, options)
}

/// Evaluate with an explicit literal serializer
pub fn execute_with_serializer<'a>(
    query: &'a CompiledQuery,
    store: &'a dyn Store,
    serializer: &'a dyn Serializer,
    bindvars: Option<HashMap<String, Value>>,
    options: &ExecOptions,
) -> Result<Execution<'a>> {
    let mut ctx = QueryContext::new(
        store,
        serializer,
        &query.functions,
        bindvars.unwrap_or_default(),
    );
    ctx.for_update = options.for_update;
    let debug_buffer = options
        .debug
        .then(|| Rc::new(RefCell::new(String::new())));
    ctx.debug = debug_buffer.clone();

    let results = eval::evaluate(&query.ast, query.root, ctx)?;
    let explain = options.explain.then(|| query.ast.explain(query.root));
    debug!(explain = options.explain, "execution started");
    Ok(Execution {
        results,
        explain,
        debug: debug_buffer,
    })
}

/// The result envelope of a driven query
#[derive(Debug, Default)]
pub struct QueryResult {
    pub results: Vec<Value>,
    pub errors: Vec<String>,
    pub explain: Option<String>,
    pub debug: Option<String>,
}

/// Compile and evaluate in one call, driving the lazy sequence to the end.
/// With `capture_errors`, evaluation failures become entries in `errors`
/// and the results produced so far are kept.
pub fn get_results(
    query: &str,
    store: &dyn Store,
    bindvars: Option<HashMap<String, Value>>,
    options: &ExecOptions,
) -> Result<QueryResult> {
    let functions = FunctionRegistry::new();
    let (compiled, diagnostics) = compile(query, &functions, None);
    let mut out = QueryResult {
        errors: diagnostics,
        ..QueryResult::default()
    };
    let Some(compiled) = compiled else {
        return Ok(out);
    };

    let execution = match execute(&compiled, store, bindvars, options) {
        Ok(execution) => execution,
        Err(e) if options.capture_errors => {
            out.errors.push(format!("error: {e}"));
            return Ok(out);
        }
        Err(e) => return Err(e),
    };
    let Execution {
        results,
        explain,
        debug,
    } = execution;
    out.explain = explain;
    for value in results {
        match value {
            Ok(v) => out.results.push(v),
            Err(e) if options.capture_errors => {
                out.errors.push(format!("error: {e}"));
                break;
            }
            Err(e) => return Err(e),
        }
    }
    out.debug = debug.map(|buffer| buffer.borrow().clone());
    Ok(out)
}

/// Compile and evaluate a query, failing on the first problem
pub fn run_query(query: &str, store: &dyn Store) -> Result<Vec<Value>> {
    let functions = FunctionRegistry::new();
    let (compiled, diagnostics) = compile(query, &functions, None);
    let Some(compiled) = compiled else {
        return Err(Error::Syntax(diagnostics.join("; ")));
    };
    let execution = execute(&compiled, store, None, &ExecOptions::default())?;
    execution.results.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tern_core::{MatchHints, StatementIter, TriplePattern};
    use tern_store::MemoryStore;

    fn store(data: serde_json::Value) -> MemoryStore {
        MemoryStore::from_json(&data).expect("load")
    }

    fn run(query: &str, store: &MemoryStore) -> Vec<serde_json::Value> {
        run_query(query, store)
            .expect("query")
            .iter()
            .map(Value::to_json)
            .collect()
    }

    fn run_with(
        query: &str,
        store: &MemoryStore,
        bindvars: HashMap<String, Value>,
    ) -> Vec<serde_json::Value> {
        let functions = FunctionRegistry::new();
        let (compiled, diagnostics) = compile(query, &functions, None);
        let compiled = compiled.unwrap_or_else(|| panic!("compile failed: {diagnostics:?}"));
        let execution =
            execute(&compiled, store, Some(bindvars), &ExecOptions::default()).expect("execute");
        execution
            .results
            .collect::<Result<Vec<Value>>>()
            .expect("results")
            .iter()
            .map(Value::to_json)
            .collect()
    }

    // P1: {*} yields one object per distinct subject with all properties
    #[test]
    fn test_star_covers_every_subject() {
        let store = store(json!([
            {"id": "s1", "a": 1, "b": 2},
            {"id": "s2", "c": "x"},
        ]));
        assert_eq!(
            run("{*}", &store),
            vec![
                json!({"id": "s1", "a": 1, "b": 2}),
                json!({"id": "s2", "c": "x"}),
            ]
        );
    }

    // P2: property paths compile to joins across statements
    #[test]
    fn test_property_path_join() {
        let store = store(json!([
            {"id": "s1", "parent": "s2"},
            {"id": "s2", "label": "Bob"},
        ]));
        assert_eq!(
            run(r#"{ "child_label": parent.label }"#, &store),
            vec![json!({"child_label": "Bob"})]
        );
    }

    // P3: maybe yields null, omitnull omits the key entirely
    #[test]
    fn test_empty_shape_rules() {
        let store = store(json!([{"id": "s1", "name": "Alice"}]));
        assert_eq!(
            run("{ name, maybe age }", &store),
            vec![json!({"name": "Alice", "age": null})]
        );
        assert_eq!(
            run("{ name, omitnull age }", &store),
            vec![json!({"name": "Alice"})]
        );
    }

    // P4: group-by merges rows; single-member groups stay scalar
    #[test]
    fn test_group_by_merge() {
        let store = store(json!([
            {"id": "s1", "subject": "commons", "content": "A"},
            {"id": "s2", "subject": "commons", "content": "B"},
            {"id": "s3", "subject": "rhizome", "content": "C"},
        ]));
        assert_eq!(
            run("{ subject, content GROUPBY(subject) }", &store),
            vec![
                json!({"subject": "commons", "content": ["A", "B"]}),
                json!({"subject": "rhizome", "content": "C"}),
            ]
        );
    }

    // P5: both uses of a label denote the same join
    #[test]
    fn test_label_reference_evaluation() {
        let store = store(json!([
            {"id": "p", "child": "c1"},
            {"id": "p2", "child": "c2"},
            {"id": "c1", "foo": "bar"},
            {"id": "c2", "foo": "baz"},
        ]));
        assert_eq!(
            run("{ ?kid, * where ({ child = ?kid }) }", &store),
            vec![
                json!({"id": "c1", "foo": "bar"}),
                json!({"id": "c2", "foo": "baz"}),
            ]
        );
    }

    // P6: evaluating an unchanged compiled query twice is deterministic
    #[test]
    fn test_idempotent_evaluation() {
        let store = store(json!([
            {"id": "s1", "a": 1, "b": "x"},
            {"id": "s2", "a": 2},
            {"id": "s3", "a": 1},
        ]));
        let functions = FunctionRegistry::new();
        let (compiled, _) = compile("{ a, maybe b order by a desc }", &functions, None);
        let compiled = compiled.expect("compiled");
        let first: Vec<Value> = execute(&compiled, &store, None, &ExecOptions::default())
            .expect("execute")
            .results
            .collect::<Result<_>>()
            .expect("results");
        let second: Vec<Value> = execute(&compiled, &store, None, &ExecOptions::default())
            .expect("execute")
            .results
            .collect::<Result<_>>()
            .expect("results");
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn test_where_equality_and_bindvars() {
        let store = store(json!([
            {"id": "s1", "foo": "bar"},
            {"id": "s2", "foo": "baz"},
        ]));
        assert_eq!(
            run("{ id where (foo = 'bar') }", &store),
            vec![json!({"id": "s1"})]
        );
        let mut bindvars = HashMap::new();
        bindvars.insert("v".to_string(), Value::String("baz".to_string()));
        assert_eq!(
            run_with("{ id where (foo = :v) }", &store, bindvars),
            vec![json!({"id": "s2"})]
        );
    }

    #[test]
    fn test_id_equality() {
        let store = store(json!([
            {"id": "s1", "foo": "bar"},
            {"id": "s2", "foo": "baz"},
        ]));
        let mut bindvars = HashMap::new();
        bindvars.insert("id".to_string(), Value::String("s2".to_string()));
        assert_eq!(
            run_with("{ * where (id = :id) }", &store, bindvars),
            vec![json!({"id": "s2", "foo": "baz"})]
        );
    }

    #[test]
    fn test_union_where() {
        let store = store(json!([
            {"id": "a", "foo": 1},
            {"id": "b", "bar": 2},
            {"id": "c", "foo": 1, "bar": 9},
            {"id": "d", "other": 0},
        ]));
        let mut ids: Vec<serde_json::Value> = run("{ id where (foo = 1 or bar = 2) }", &store);
        ids.sort_by_key(|v| v["id"].as_str().map(str::to_string));
        assert_eq!(
            ids,
            vec![json!({"id": "a"}), json!({"id": "b"}), json!({"id": "c"})]
        );
    }

    #[test]
    fn test_not_excludes_matches() {
        let store = store(json!([
            {"id": "a", "kind": "x", "flag": 1},
            {"id": "b", "kind": "y", "flag": 1},
        ]));
        assert_eq!(
            run("{ id where (flag = 1 and not (kind = 'x')) }", &store),
            vec![json!({"id": "b"})]
        );
    }

    #[test]
    fn test_not_property_existence() {
        let store = store(json!([
            {"id": "a", "kind": "x", "extra": 1},
            {"id": "b", "kind": "y"},
        ]));
        assert_eq!(
            run("{ id where (kind and not extra) }", &store),
            vec![json!({"id": "b"})]
        );
    }

    #[test]
    fn test_comparisons_and_in() {
        let store = store(json!([
            {"id": "a", "n": 1},
            {"id": "b", "n": 5},
            {"id": "c", "n": 9},
        ]));
        assert_eq!(
            run("{ id where (n > 4) }", &store),
            vec![json!({"id": "b"}), json!({"id": "c"})]
        );
        assert_eq!(
            run("{ id where (n in (1, 9)) }", &store),
            vec![json!({"id": "a"}), json!({"id": "c"})]
        );
        assert_eq!(
            run("{ id where (n not in (1, 9)) }", &store),
            vec![json!({"id": "b"})]
        );
    }

    #[test]
    fn test_arithmetic_in_construct() {
        let store = store(json!([{"id": "1", "foo": "x"}]));
        assert_eq!(
            run("{ 'derived': id * 2, foo }", &store),
            vec![json!({"derived": 2, "foo": "x"})]
        );
    }

    #[test]
    fn test_scalar_and_list_shapes() {
        let store = store(json!([
            {"id": "s1", "foo": "bar"},
            {"id": "s2", "foo": "baz"},
        ]));
        assert_eq!(run("(foo)", &store), vec![json!("bar"), json!("baz")]);
        assert_eq!(run("('constant')", &store), vec![json!("constant")]);
        assert_eq!(
            run("[foo]", &store),
            vec![json!(["bar"]), json!(["baz"])]
        );
        assert_eq!(
            run("[*]", &store),
            vec![json!(["bar"]), json!(["baz"])]
        );
    }

    #[test]
    fn test_constant_constructs() {
        let store = store(json!([{"id": "s1", "foo": "bar"}]));
        assert_eq!(run("{}", &store), vec![json!({})]);
        assert_eq!(
            run(r#"{ "staticprop" : "foo" }"#, &store),
            vec![json!({"staticprop": "foo"})]
        );
        assert_eq!(
            run(r#"{ "staticprop" : ["foo"] }"#, &store),
            vec![json!({"staticprop": ["foo"]})]
        );
    }

    #[test]
    fn test_forced_list_property() {
        let store = store(json!([{"id": "s1", "tag": "a"}]));
        assert_eq!(run("{ [tag] }", &store), vec![json!({"tag": ["a"]})]);
    }

    #[test]
    fn test_computed_property_names() {
        let store = store(json!([
            {"id": "s1", "key": "k1", "v": 1},
            {"id": "s2", "key": "k2", "v": 2},
        ]));
        assert_eq!(
            run("{ key : v, id }", &store),
            vec![
                json!({"k1": 1, "id": "s1"}),
                json!({"k2": 2, "id": "s2"}),
            ]
        );
    }

    #[test]
    fn test_mergeall() {
        let store = store(json!([
            {"id": "s1", "foo": "bar"},
            {"id": "s2", "foo": "baz"},
        ]));
        assert_eq!(
            run("{ id : foo MERGEALL }", &store),
            vec![json!({"s1": "bar", "s2": "baz"})]
        );
    }

    #[test]
    fn test_order_by_nulls_first_and_desc() {
        let store = store(json!([
            {"id": "s1", "n": 2, "m": 1},
            {"id": "s2", "n": 1, "m": 1},
            {"id": "s3", "m": 1},
        ]));
        assert_eq!(
            run("{ id, maybe n order by n }", &store),
            vec![
                json!({"id": "s3", "n": null}),
                json!({"id": "s2", "n": 1}),
                json!({"id": "s1", "n": 2}),
            ]
        );
        assert_eq!(
            run("{ id, maybe n order by n desc }", &store),
            vec![
                json!({"id": "s1", "n": 2}),
                json!({"id": "s2", "n": 1}),
                json!({"id": "s3", "n": null}),
            ]
        );
    }

    #[test]
    fn test_limit_and_offset_apply_to_output() {
        let store = store(json!([
            {"id": "s1", "n": 1},
            {"id": "s2", "n": 2},
            {"id": "s3", "n": 3},
            {"id": "s4", "n": 4},
        ]));
        assert_eq!(
            run("{ n order by n limit 2 offset 1 }", &store),
            vec![json!({"n": 2}), json!({"n": 3})]
        );
    }

    #[test]
    fn test_nested_construct_correlation() {
        let store = store(json!([
            {"id": "l1", "item": "c1", "owner": "p1"},
            {"id": "l2", "item": "c2", "owner": "p2"},
            {"id": "c1", "name": "one"},
            {"id": "c2", "name": "two"},
        ]));
        // each owner's nested construct sees only its own item rows
        let results = run(
            "{ ?owner, id, 'child' : { ?kid, name where ({ item = ?kid and owner = ?owner }) } }",
            &store,
        );
        assert_eq!(
            results,
            vec![
                json!({"id": "p1", "child": {"name": "one"}}),
                json!({"id": "p2", "child": {"name": "two"}}),
            ]
        );
    }

    #[test]
    fn test_embedded_objects_expand_inline() {
        let store = store(json!([
            {"id": "s1", "address": {"city": "Utrecht"}},
        ]));
        assert_eq!(
            run("{ address }", &store),
            vec![json!({"address": {"city": "Utrecht"}})]
        );
        // and the embedded resource is not a top-level result
        assert_eq!(
            run("{*}", &store),
            vec![json!({"id": "s1", "address": {"city": "Utrecht"}})]
        );
    }

    #[test]
    fn test_depth_expands_references() {
        let store = store(json!([
            {"id": "s1", "next": "@s2"},
            {"id": "s2", "name": "two"},
        ]));
        assert_eq!(
            run("{ id, next where (id = 's1') }", &store),
            vec![json!({"id": "s1", "next": "s2"})]
        );
        let with_depth = run("{ id, next where (id = 's1') depth 1 }", &store);
        assert_eq!(
            with_depth,
            vec![json!({"id": "s1", "next": {"id": "s2", "name": "two"}})]
        );
    }

    #[test]
    fn test_cyclic_references_stay_flat() {
        let store = store(json!([
            {"id": "s1", "peer": "@s2"},
            {"id": "s2", "peer": "@s1"},
        ]));
        // expansion stops when it would revisit a subject being built
        let results = run("{ id, peer where (id = 's1') depth 10 }", &store);
        assert_eq!(
            results,
            vec![json!({"id": "s1", "peer": {"id": "s2", "peer": "s1"}})]
        );
    }

    #[test]
    fn test_aggregates_over_groups() {
        let store = store(json!([
            {"id": "s1", "g": "a", "n": 1},
            {"id": "s2", "g": "a", "n": 2},
            {"id": "s3", "g": "b", "n": 5},
        ]));
        assert_eq!(
            run("{ g, 'total': sum(n), 'rows': count(n) group by g }", &store),
            vec![
                json!({"g": "a", "total": 3, "rows": 2}),
                json!({"g": "b", "total": 5, "rows": 1}),
            ]
        );
    }

    #[test]
    fn test_if_function_is_lazy() {
        // the false branch would divide by zero if evaluated
        let store = store(json!([{"id": "s1", "n": 4}]));
        assert_eq!(
            run("{ 'v': if(true(), n, n / 0) }", &store),
            vec![json!({"v": 4})]
        );
    }

    #[test]
    fn test_capture_errors_keeps_partial_results() {
        let store = store(json!([
            {"id": "s1", "n": 1},
            {"id": "s2", "n": 0},
        ]));
        let options = ExecOptions {
            capture_errors: true,
            ..ExecOptions::default()
        };
        let result = get_results("{ 'v': 10 / n order by n desc }", &store, None, &options)
            .expect("capture mode never raises");
        assert_eq!(result.results, vec![Value::Object(
            [("v".to_string(), Value::Number(10.0))].into_iter().collect()
        )]);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("division by zero"));
    }

    #[test]
    fn test_explain_and_debug_output() {
        let store = store(json!([{"id": "s1", "foo": "bar"}]));
        let options = ExecOptions {
            explain: true,
            debug: true,
            ..ExecOptions::default()
        };
        let result = get_results("{ foo }", &store, None, &options).expect("run");
        let explain = result.explain.expect("explain requested");
        assert!(explain.contains("Select"));
        assert!(explain.contains("Filter"));
        let debug = result.debug.expect("debug requested");
        assert!(debug.contains("row 1"));
    }

    #[test]
    fn test_failed_compile_yields_errors_only() {
        let store = store(json!([{"id": "s1", "foo": "bar"}]));
        let result = get_results("{ foo = }", &store, None, &ExecOptions::default())
            .expect("diagnostics, not a panic");
        assert!(result.results.is_empty());
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn test_namemap_applies_to_lookup() {
        let store = store(json!([
            {"id": "s1", "http://example.com/version": 2},
        ]));
        assert_eq!(
            run(
                r#"{ "v" : <ex:version> where (<ex:version> = 2) namemap = { "ex": "http://example.com/" } }"#,
                &store
            ),
            vec![json!({"v": 2})]
        );
    }

    /// A store wrapper counting lookups, for the abandon-safety check
    struct CountingStore {
        inner: MemoryStore,
        calls: std::cell::Cell<usize>,
    }

    impl Store for CountingStore {
        fn matching(
            &self,
            pattern: &TriplePattern,
            hints: &MatchHints,
        ) -> Result<StatementIter<'_>> {
            self.calls.set(self.calls.get() + 1);
            self.inner.matching(pattern, hints)
        }
    }

    #[test]
    fn test_abandoning_results_stops_store_access() {
        let counting = CountingStore {
            inner: store(json!([
                {"id": "s1", "foo": "bar"},
                {"id": "s2", "foo": "baz"},
                {"id": "s3", "foo": "qux"},
            ])),
            calls: std::cell::Cell::new(0),
        };
        let functions = FunctionRegistry::new();
        let (compiled, _) = compile("{ foo }", &functions, None);
        let compiled = compiled.expect("compiled");
        let mut execution =
            execute(&compiled, &counting, None, &ExecOptions::default()).expect("execute");
        let first = execution.results.next().expect("one result").expect("ok");
        assert!(matches!(first, Value::Object(_)));
        let calls_before_drop = counting.calls.get();
        drop(execution);
        assert_eq!(counting.calls.get(), calls_before_drop);
    }

    #[test]
    fn test_interleaved_compiles_do_not_interfere() {
        let functions = FunctionRegistry::new();
        let (a, _) = compile("{ 'x': a.b }", &functions, None);
        let (b, _) = compile("{ 'y': c.d }", &functions, None);
        let a = a.expect("a");
        let b = b.expect("b");
        // anonymous join labels are per-compile, not shared
        assert!(a.explain().contains("@1"));
        assert!(b.explain().contains("@1"));
    }

    #[test]
    fn test_shared_compiled_query_across_evaluations() {
        let store_a = store(json!([{"id": "s1", "foo": "bar"}]));
        let store_b = store(json!([{"id": "x", "foo": "qux"}]));
        let functions = FunctionRegistry::new();
        let (compiled, _) = compile("{ foo }", &functions, None);
        let compiled = compiled.expect("compiled");
        assert_eq!(
            execute(&compiled, &store_a, None, &ExecOptions::default())
                .expect("a")
                .results
                .collect::<Result<Vec<_>>>()
                .expect("ok")
                .len(),
            1
        );
        assert_eq!(
            execute(&compiled, &store_b, None, &ExecOptions::default())
                .expect("b")
                .results
                .collect::<Result<Vec<_>>>()
                .expect("ok")
                .len(),
            1
        );
    }
}
