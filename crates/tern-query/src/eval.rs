//! Query evaluation
//!
//! Walks a rewritten plan against a store. Relational evaluation is a
//! pull-based lazy stream of rows: a join asks each of its conditions for
//! grouped rows and combines them by key, a filter asks the store for
//! matching statements and yields them as labeled rows. Construction shapes
//! admitted rows into nested values, applying the multiplicity rules,
//! group-by merging, order-by, limit and offset.
//!
//! Rows may contain nested tables (the grouped side of a join); columns
//! mirror that nesting, and labels resolve to a path into the row.

use crate::ast::{
    Ast, EmptyShape, JoinKind, OpId, OpKind, PathStep, PropInfo, Projection, SelectInfo, Shape,
    SingleShape,
};
use crate::functions::{ArgEval, FuncImpl, FunctionRegistry};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::rc::Rc;
use tern_core::{
    is_anonymous_id, Error, MatchHints, Result, Serializer, Statement, Store, TriplePattern,
    TriplePos, Value, ValueMap,
};
use tracing::{debug, trace};

/// A labeled output column; the grouped side of a join carries its nested
/// column layout
#[derive(Debug, Clone)]
pub struct Column {
    pub label: String,
    pub nested: Option<Vec<Column>>,
}

/// One cell of a row: a value, or a nested table of rows
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Val(Value),
    Table(Vec<Row>),
}

pub type Row = Vec<Cell>;

/// Lazy stream of rows with its column layout
pub struct Rel<'a> {
    pub columns: Vec<Column>,
    pub rows: RowIter<'a>,
}

pub type RowIter<'a> = Box<dyn Iterator<Item = Result<Row>> + 'a>;
pub type ValueIter<'a> = Box<dyn Iterator<Item = Result<Value>> + 'a>;

/// Per-evaluation state. One context exists per evaluation call; a compiled
/// query never holds evaluation state, so concurrent evaluations of the
/// same plan cannot observe each other.
#[derive(Clone)]
pub struct QueryContext<'a> {
    pub store: &'a dyn Store,
    pub serializer: &'a dyn Serializer,
    pub functions: &'a FunctionRegistry,
    pub bindvars: Rc<HashMap<String, Value>>,
    pub depth: u32,
    pub for_update: bool,
    /// Per-row trace buffer, filled when requested
    pub debug: Option<Rc<RefCell<String>>>,
    /// Memo of row-independent expression results, keyed by node
    memo: Rc<RefCell<HashMap<OpId, Value>>>,
    /// Subjects currently being constructed, for cycle-safe expansion
    construct_stack: Rc<RefCell<Vec<String>>>,
}

impl<'a> QueryContext<'a> {
    pub fn new(
        store: &'a dyn Store,
        serializer: &'a dyn Serializer,
        functions: &'a FunctionRegistry,
        bindvars: HashMap<String, Value>,
    ) -> Self {
        Self {
            store,
            serializer,
            functions,
            bindvars: Rc::new(bindvars),
            depth: 0,
            for_update: false,
            debug: None,
            memo: Rc::new(RefCell::new(HashMap::new())),
            construct_stack: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

/// Expression evaluation scope: the current row and its columns
pub struct Scope<'r> {
    pub columns: &'r [Column],
    pub row: &'r Row,
}

/// Evaluate a compiled select against a store, yielding shaped values
pub fn evaluate<'a>(ast: &'a Ast, select: OpId, ctx: QueryContext<'a>) -> Result<ValueIter<'a>> {
    Evaluator { ast, ctx }.eval_select(select, None)
}

#[derive(Clone)]
struct Evaluator<'a> {
    ast: &'a Ast,
    ctx: QueryContext<'a>,
}

impl<'a> Evaluator<'a> {
    fn eval_select(&self, select: OpId, input: Option<Rel<'a>>) -> Result<ValueIter<'a>> {
        let OpKind::Select(info) = self.ast.kind(select) else {
            return Err(Error::Compile("bad ast: expected a select".to_string()));
        };
        let info = info.clone();
        let mut ev = self.clone();
        if let Some(depth) = info.depth {
            ev.ctx.depth = depth;
        }
        let construct = self
            .ast
            .select_construct(select)
            .ok_or_else(|| Error::Compile("bad ast: select has no construct".to_string()))?;

        let mut rel = if self.ast.is_independent(select) {
            // constant query: construct exactly once
            Rel {
                columns: vec![Column {
                    label: String::new(),
                    nested: None,
                }],
                rows: Box::new(std::iter::once(Ok(vec![Cell::Val(Value::Number(1.0))]))),
            }
        } else if let Some(where_) = self.ast.select_where(select) {
            ev.eval_rel(where_)?
        } else if let Some(input) = input {
            input
        } else {
            // correlated select evaluated standalone: scan everything
            ev.group_base_scan()?
        };

        if let Some(group_by) = self.ast.select_group_by(select) {
            rel = ev.eval_group_by(group_by, rel)?;
        }
        if let Some(order_by) = self.ast.select_order_by(select) {
            rel = ev.eval_order_by(order_by, rel)?;
        }

        let shaped = ev.eval_construct(select, construct, rel, &info)?;
        if info.mergeall {
            Ok(merge_all(shaped, construct_shape(self.ast, construct)))
        } else {
            Ok(shaped)
        }
    }

    // ---- relational operators ----

    fn eval_rel(&self, id: OpId) -> Result<Rel<'a>> {
        match self.ast.kind(id) {
            OpKind::Filter => self.eval_filter(id),
            OpKind::Join | OpKind::Except => self.eval_join(id),
            OpKind::Union => self.eval_union(id),
            other => Err(Error::Compile(format!(
                "malformed plan: cannot evaluate {other:?} as a row source"
            ))),
        }
    }

    /// Full scan yielding one `#0` column with each statement's subject
    fn base_scan(&self) -> Result<Rel<'a>> {
        let iter = self
            .ctx
            .store
            .matching(&TriplePattern::any(), &MatchHints::default())?;
        let rows = iter.map(|st| st.map(|s| vec![Cell::Val(Value::String(s.subject))]));
        Ok(Rel {
            columns: vec![Column {
                label: "#0".to_string(),
                nested: None,
            }],
            rows: Box::new(rows),
        })
    }

    /// Base scan grouped by subject: one row per distinct subject
    fn group_base_scan(&self) -> Result<Rel<'a>> {
        let scan = self.base_scan()?;
        Ok(group_rel(scan, vec![0], String::new(), "#0".to_string()))
    }

    fn eval_filter(&self, filter: OpId) -> Result<Rel<'a>> {
        let labels = self.ast.node(filter).labels.clone();
        let mut pattern = TriplePattern::any();
        let mut complex: Vec<OpId> = Vec::new();

        for pred in self.ast.children(filter) {
            let Some((pos, value)) = self.simple_eq(pred)? else {
                complex.push(pred);
                continue;
            };
            // pushdown: at most one predicate per triple position
            let slot_taken = match pos {
                TriplePos::Subject => pattern.subject.is_some(),
                TriplePos::Predicate => pattern.predicate.is_some(),
                TriplePos::Object => pattern.object.is_some(),
            };
            if slot_taken {
                complex.push(pred);
                continue;
            }
            match pos {
                TriplePos::Subject | TriplePos::Predicate => match value.as_str() {
                    Some(text) => {
                        if pos == TriplePos::Subject {
                            pattern.subject = Some(text.to_string());
                        } else {
                            pattern.predicate = Some(text.to_string());
                        }
                    }
                    None => complex.push(pred),
                },
                TriplePos::Object => {
                    // encode the native value back into the store's literal
                    // form; the type tag is left open so references and
                    // strings can match either spelling
                    let (literal, _) = self.ctx.serializer.encode(&value)?;
                    pattern.object = Some(literal);
                }
            }
        }

        trace!(?pattern, complex = complex.len(), "filter");
        let iter = self.ctx.store.matching(&pattern, &MatchHints::default())?;
        let columns: Vec<Column> = labels
            .iter()
            .map(|(label, _)| Column {
                label: label.clone(),
                nested: None,
            })
            .collect();

        let ev = self.clone();
        let rows = iter.filter_map(move |st| -> Option<Result<Row>> {
            let st = match st {
                Ok(st) => st,
                Err(e) => return Some(Err(e)),
            };
            let object = match ev.ctx.serializer.decode(&st.object, st.object_type) {
                Ok(v) => v,
                Err(e) => return Some(Err(e)),
            };
            let full: Row = vec![
                Cell::Val(Value::String(st.subject)),
                Cell::Val(Value::String(st.predicate)),
                Cell::Val(object),
            ];
            let scope = Scope {
                columns: &[],
                row: &full,
            };
            for pred in &complex {
                match ev.eval_expr(*pred, &scope) {
                    Ok(v) if v.is_truthy() => {}
                    Ok(_) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }
            Some(Ok(labels
                .iter()
                .map(|(_, pos)| full[pos.index()].clone())
                .collect()))
        });
        Ok(Rel {
            columns,
            rows: Box::new(rows),
        })
    }

    /// An `Eq` of one positional column reference against a row-independent
    /// expression, usable as a store lookup condition
    fn simple_eq(&self, pred: OpId) -> Result<Option<(TriplePos, Value)>> {
        if !matches!(self.ast.kind(pred), OpKind::Eq) {
            return Ok(None);
        }
        let children = self.ast.children(pred);
        let &[a, b] = &children[..] else {
            return Ok(None);
        };
        let position = |id: OpId| match self.ast.kind(id) {
            OpKind::Project(p) => match &p.path[..] {
                [PathStep::Pos(pos)] => Some(*pos),
                _ => None,
            },
            _ => None,
        };
        let (pos, other) = if let Some(pos) = position(a) {
            (pos, b)
        } else if let Some(pos) = position(b) {
            (pos, a)
        } else {
            return Ok(None);
        };
        if !self.ast.is_independent(other) {
            return Ok(None);
        }
        let empty_row: Row = Vec::new();
        let scope = Scope {
            columns: &[],
            row: &empty_row,
        };
        // constants also match the property-name column when written as
        // plain names
        let value = match self.ast.kind(other) {
            OpKind::PropName(name) => Value::String(name.clone()),
            _ => self.eval_expr(other, &scope)?,
        };
        Ok(Some((pos, value)))
    }

    /// Inner/left-outer/anti/semi hash join of the node's conditions.
    /// Single-statement filters evaluate before the joins that consume
    /// them; conditions are ordered inner-first, then by cost.
    fn eval_join(&self, join: OpId) -> Result<Rel<'a>> {
        let join_name = self.ast.join_label(join).unwrap_or("").to_string();
        let mut args = self.ast.children(join);
        args.sort_by(|a, b| {
            let rank = |id: &OpId| match self.ast.kind(*id) {
                OpKind::JoinCond(info) => (info.kind != JoinKind::Inner, self.cost(*id)),
                _ => (true, f64::MAX),
            };
            let (ka, ca) = rank(a);
            let (kb, cb) = rank(b);
            ka.cmp(&kb).then(ca.total_cmp(&cb))
        });

        let needs_base = match args.first() {
            None => true,
            Some(first) => match self.ast.kind(*first) {
                OpKind::JoinCond(info) => info.kind != JoinKind::Inner,
                _ => true,
            },
        };

        let mut previous: Option<Rel<'a>> = None;
        if needs_base {
            previous = Some(group_rel(
                self.base_scan()?,
                vec![0],
                join_name.clone(),
                "#0".to_string(),
            ));
        }

        for jc in args {
            let OpKind::JoinCond(info) = self.ast.kind(jc).clone() else {
                return Err(Error::Compile(
                    "malformed plan: join child is not a join condition".to_string(),
                ));
            };
            let child = self.ast.children(jc)[0];
            let child_rel = self.eval_rel(child)?;
            let key_path = self.join_key_path(child, &child_rel, &info.key)?;
            let current = group_rel(child_rel, key_path, join_name.clone(), info.key.clone());

            previous = Some(match previous {
                None => current,
                Some(previous) => hash_join(previous, current, info.kind),
            });
        }

        previous.ok_or_else(|| Error::Compile("malformed plan: empty join".to_string()))
    }

    /// Union of the conditions' grouped rows, de-duplicated by key.
    /// Branch columns are padded into one unified layout so label lookup
    /// works on every row.
    fn eval_union(&self, union: OpId) -> Result<Rel<'a>> {
        let union_name = self.ast.join_label(union).unwrap_or("").to_string();
        let mut slot_signatures: Vec<String> = Vec::new();
        let mut slot_columns: Vec<Column> = Vec::new();
        let mut branches: Vec<(RowIter<'a>, usize)> = Vec::new();

        for jc in self.ast.children(union) {
            let OpKind::JoinCond(info) = self.ast.kind(jc).clone() else {
                return Err(Error::Compile(
                    "malformed plan: union child is not a join condition".to_string(),
                ));
            };
            let child = self.ast.children(jc)[0];
            let child_rel = self.eval_rel(child)?;
            let key_path = self.join_key_path(child, &child_rel, &info.key)?;
            let grouped = group_rel(child_rel, key_path, union_name.clone(), info.key.clone());

            let signature = format!("{}|{}", info.key, column_signature(&grouped.columns[1]));
            let slot = match slot_signatures.iter().position(|s| *s == signature) {
                Some(slot) => slot,
                None => {
                    slot_signatures.push(signature);
                    slot_columns.push(grouped.columns[1].clone());
                    slot_signatures.len() - 1
                }
            };
            branches.push((grouped.rows, slot));
        }

        let mut columns = vec![Column {
            label: union_name,
            nested: None,
        }];
        columns.extend(slot_columns.iter().cloned());
        let slots = slot_columns.len();

        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(RowIter<'a>, usize)> = branches.into();
        let mut current: Option<(RowIter<'a>, usize)> = None;
        let rows = std::iter::from_fn(move || loop {
            if current.is_none() {
                current = Some(queue.pop_front()?);
            }
            let (iter, slot) = current.as_mut().expect("set above");
            let slot = *slot;
            match iter.next() {
                None => {
                    current = None;
                }
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(mut row)) => {
                    let key = match cell_key(&row[0]) {
                        Ok(k) => k,
                        Err(e) => return Some(Err(e)),
                    };
                    if !seen.insert(key) {
                        continue;
                    }
                    let table = row.pop().expect("grouped rows have two cells");
                    let mut out: Row = Vec::with_capacity(slots + 1);
                    out.push(row.pop().expect("grouped rows have two cells"));
                    for i in 0..slots {
                        if i == slot {
                            out.push(table.clone());
                        } else {
                            out.push(Cell::Table(Vec::new()));
                        }
                    }
                    return Some(Ok(out));
                }
            }
        });

        Ok(Rel {
            columns,
            rows: Box::new(rows),
        })
    }

    fn eval_group_by(&self, group_by: OpId, rel: Rel<'a>) -> Result<Rel<'a>> {
        let label = self
            .ast
            .group_by_name(group_by)
            .ok_or_else(|| Error::Compile("bad group by expression".to_string()))?;
        let path = find_column_pos(&rel.columns, &label)
            .ok_or_else(|| Error::Evaluation(format!("could not find group by key '{label}'")))?;
        debug!(%label, "group by");
        Ok(group_rel(rel, path, label, "#groupby".to_string()))
    }

    fn eval_order_by(&self, order_by: OpId, rel: Rel<'a>) -> Result<Rel<'a>> {
        let mut sorts: Vec<(Option<Vec<usize>>, bool)> = Vec::new();
        for sort in self.ast.children(order_by) {
            let OpKind::SortExp { descending } = *self.ast.kind(sort) else {
                continue;
            };
            let expr = self.ast.children(sort)[0];
            let OpKind::Project(p) = self.ast.kind(expr) else {
                return Err(Error::Compile(
                    "only property references can be ordered by".to_string(),
                ));
            };
            let path = match &p.path[..] {
                [PathStep::Pos(pos)] => Some(vec![pos.index()]),
                _ => p
                    .simple_name()
                    .and_then(|name| find_column_pos(&rel.columns, name)),
            };
            sorts.push((path, !descending));
        }

        let columns = rel.columns.clone();
        let rows_iter = rel.rows;
        let rows = lazy_rows(move || {
            let mut rows: Vec<Row> = rows_iter.collect::<Result<_>>()?;
            rows.sort_by(|a, b| {
                for (path, ascending) in &sorts {
                    let key = |row: &Row| match path {
                        Some(path) => Value::List(flatten_cells(path, row)),
                        None => Value::Null,
                    };
                    let ord = key(a).compare(&key(b));
                    if ord != std::cmp::Ordering::Equal {
                        return if *ascending { ord } else { ord.reverse() };
                    }
                }
                std::cmp::Ordering::Equal
            });
            Ok(rows)
        });
        Ok(Rel {
            columns,
            rows: Box::new(rows),
        })
    }

    /// Resolve a join key to a path into the child's rows. A positional
    /// subject key on a set operator is the group key its rows already
    /// carry at position zero.
    fn join_key_path(&self, child: OpId, child_rel: &Rel<'a>, key: &str) -> Result<Vec<usize>> {
        if key.starts_with('#') && self.ast.kind(child).is_resource_set() {
            return Ok(vec![0]);
        }
        find_column_pos(&child_rel.columns, key)
            .ok_or_else(|| Error::Evaluation(format!("could not find join key label '{key}'")))
    }

    /// Rough per-node cost: filters are cheaper than joins, so they are
    /// evaluated first among equal join kinds
    fn cost(&self, jc: OpId) -> f64 {
        let child = self.ast.children(jc)[0];
        match self.ast.kind(child) {
            OpKind::Filter => 1.0,
            _ => 2.0,
        }
    }

    // ---- construction ----

    fn eval_construct(
        &self,
        select: OpId,
        construct: OpId,
        rel: Rel<'a>,
        info: &SelectInfo,
    ) -> Result<ValueIter<'a>> {
        let group_label = self
            .ast
            .select_group_by(select)
            .and_then(|g| self.ast.group_by_name(g));
        let id_label = self.ast.subject_label(construct);

        let (subject_path, row_columns) = match group_label.clone().or(id_label) {
            None => (vec![0], rel.columns.clone()),
            Some(label) => {
                let (path, level) =
                    find_column_rowinfo(&rel.columns, &label).ok_or_else(|| {
                        Error::Evaluation(format!(
                            "construct: could not find subject label '{label}'"
                        ))
                    })?;
                let key_col = level[*path.last().expect("non-empty path")].clone();
                let mut columns = vec![Column {
                    label,
                    nested: key_col.nested,
                }];
                columns.extend(columns_without_key(&path, &rel.columns));
                (path, columns)
            }
        };

        Ok(Box::new(ConstructIter {
            ev: self.clone(),
            rows: rel.rows,
            pending: VecDeque::new(),
            subject_path,
            row_columns: Rc::new(row_columns),
            select_info: info.clone(),
            construct,
            shape: construct_shape(self.ast, construct),
            grouped: group_label.is_some(),
            skipped: 0,
            yielded: 0,
            index: 0,
            done: false,
        }))
    }

    /// Build one output value for a subject row
    fn build_one(
        &self,
        id: &Value,
        cols: &[Cell],
        row_columns: &[Column],
        construct: OpId,
        shape: Shape,
        info: &SelectInfo,
        grouped: bool,
    ) -> Result<Option<Value>> {
        let id_str = id.as_str().map(str::to_string);
        if let Some(id_str) = &id_str {
            if info.skip_anonymous && !grouped && is_anonymous_id(id_str) {
                return Ok(None);
            }
            self.ctx.construct_stack.borrow_mut().push(id_str.clone());
        }
        let result = self.build_pattern(id, cols, row_columns, construct, shape, info, grouped);
        if id_str.is_some() {
            self.ctx.construct_stack.borrow_mut().pop();
        }
        result.map(Some)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_pattern(
        &self,
        id: &Value,
        cols: &[Cell],
        row_columns: &[Column],
        construct: OpId,
        shape: Shape,
        info: &SelectInfo,
        grouped: bool,
    ) -> Result<Value> {
        let mut row: Row = Vec::with_capacity(cols.len() + 1);
        row.push(Cell::Val(id.clone()));
        row.extend(cols.iter().cloned());
        let scope = Scope {
            columns: row_columns,
            row: &row,
        };

        let mut object = ValueMap::new();
        let mut array: Vec<Value> = Vec::new();
        let mut scalar = Value::Null;
        let mut all_props: Option<PropInfo> = None;
        let mut props_output: HashSet<String> = HashSet::new();

        for prop in self.ast.children(construct) {
            match self.ast.kind(prop).clone() {
                OpKind::ConstructSubject(name) => {
                    if shape == Shape::Array
                        || grouped
                        || name.is_empty()
                        || (all_props.is_none() && !self.ctx.for_update)
                    {
                        continue;
                    }
                    let visible = self.ctx.for_update
                        || id_str_visible(id);
                    if !visible {
                        continue;
                    }
                    match shape {
                        Shape::Object => object.insert(name, id.clone()),
                        Shape::Array => {}
                        Shape::Scalar => scalar = id.clone(),
                    }
                }
                OpKind::ConstructProp(pinfo) => {
                    let value = self.ast.children(prop)[0];
                    let value_is_star = matches!(
                        self.ast.kind(value),
                        OpKind::Project(p) if p.is_star()
                    );
                    if value_is_star && !pinfo.has_name_expr {
                        if shape == Shape::Scalar {
                            return Err(Error::Evaluation(
                                "value construct can not specify '*'".to_string(),
                            ));
                        }
                        all_props = Some(pinfo);
                        continue;
                    }

                    let v = if value_is_star {
                        // name-expression over the whole object: expand the
                        // subject itself
                        match id.as_str() {
                            Some(id_str) => self
                                .expand_resource(id_str, self.ctx.depth)?
                                .unwrap_or(Value::Null),
                            None => Value::Null,
                        }
                    } else {
                        self.eval_prop_value(&pinfo, value, &scope, grouped)?
                    };

                    let name = if pinfo.has_name_expr {
                        let name_expr = self.ast.children(prop)[1];
                        Some(name_string(&self.eval_expr(name_expr, &scope)?))
                    } else {
                        pinfo.name.clone().or_else(|| match self.ast.kind(value) {
                            OpKind::Project(p) => p.simple_name().map(str::to_string),
                            _ => None,
                        })
                    };

                    if let Some(shaped) = shaped_value(&pinfo, v) {
                        match shape {
                            Shape::Object => {
                                let name = name.ok_or_else(|| {
                                    Error::Evaluation(
                                        "object construct property needs a name".to_string(),
                                    )
                                })?;
                                object.insert(name, shaped);
                            }
                            Shape::Array => array.push(shaped),
                            Shape::Scalar => scalar = shaped,
                        }
                    }
                    if let OpKind::Project(p) = self.ast.kind(value) {
                        if let Some(n) = p.simple_name() {
                            props_output.insert(n.to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(all_info) = all_props {
            if shape == Shape::Object {
                props_output.extend(object.keys().cloned());
            }
            if let Some(id_str) = id.as_str() {
                for (prop_name, values) in self.subject_properties(id_str)? {
                    if props_output.contains(&prop_name) {
                        continue;
                    }
                    let mut vals = Vec::with_capacity(values.len());
                    for v in values {
                        vals.push(self.build_object(&v, self.ctx.depth)?);
                    }
                    let v = collapse(vals);
                    if let Some(shaped) = shaped_value(&all_info, v) {
                        match shape {
                            Shape::Object => object.insert(prop_name, shaped),
                            Shape::Array => array.push(shaped),
                            Shape::Scalar => scalar = shaped,
                        }
                    }
                }
            }
        }

        Ok(match shape {
            Shape::Object => Value::Object(object),
            Shape::Array => Value::List(array),
            Shape::Scalar => scalar,
        })
    }

    /// Evaluate a construct property's value expression against the current
    /// row. In a merged group, an expression over projections is evaluated
    /// once per group member and collected.
    fn eval_prop_value(
        &self,
        pinfo: &PropInfo,
        value: OpId,
        scope: &Scope<'_>,
        grouped: bool,
    ) -> Result<Value> {
        if matches!(self.ast.kind(value), OpKind::Select(_)) {
            return self.eval_nested_select(value, scope);
        }

        let member_table = scope.row.get(1).and_then(|cell| match cell {
            Cell::Table(rows) => Some(rows),
            Cell::Val(_) => None,
        });
        let direct = pinfo.projects.is_empty()
            || pinfo.projects.first() == Some(&value)
            || pinfo.has_agg
            || !grouped
            || member_table.is_none_or(|rows| rows.len() <= 1);

        if direct {
            return self.eval_expr(value, scope);
        }

        // evaluate per group member, so expressions over multi-valued rows
        // produce one result per member
        let rows = member_table.expect("checked above");
        let member_columns = scope.columns[1]
            .nested
            .as_deref()
            .unwrap_or(&[]);
        let mut out = Vec::with_capacity(rows.len());
        for member in rows {
            let member_scope = Scope {
                columns: member_columns,
                row: member,
            };
            out.push(self.eval_expr(value, &member_scope)?);
        }
        Ok(collapse(out))
    }

    /// A nested select correlates through its subject label: the outer
    /// row's column for that label supplies its input rows
    fn eval_nested_select(&self, select: OpId, scope: &Scope<'_>) -> Result<Value> {
        let label = self
            .ast
            .select_construct(select)
            .and_then(|c| self.ast.subject_label(c));
        let input = label
            .as_deref()
            .and_then(|label| find_column_rowinfo(scope.columns, label))
            .map(|(path, level)| {
                let rows = rows_at(&path, scope.row);
                Rel {
                    columns: level.to_vec(),
                    rows: Box::new(rows.into_iter().map(Ok)) as RowIter<'a>,
                }
            });
        let values: Vec<Value> = self
            .eval_select(select, input)?
            .collect::<Result<Vec<Value>>>()?;
        Ok(collapse(values))
    }

    /// All properties of one subject, decoded, grouped by predicate in
    /// store order
    fn subject_properties(&self, subject: &str) -> Result<Vec<(String, Vec<Value>)>> {
        let iter = self
            .ctx
            .store
            .matching(&TriplePattern::subject(subject), &MatchHints::default())?;
        let mut order: Vec<String> = Vec::new();
        let mut props: HashMap<String, Vec<Value>> = HashMap::new();
        for st in iter {
            let st: Statement = st?;
            let value = self.ctx.serializer.decode(&st.object, st.object_type)?;
            if !props.contains_key(&st.predicate) {
                order.push(st.predicate.clone());
            }
            props.entry(st.predicate).or_default().push(value);
        }
        Ok(order
            .into_iter()
            .map(|name| {
                let values = props.remove(&name).unwrap_or_default();
                (name, values)
            })
            .collect())
    }

    /// Expand a reference value into a nested object when depth allows, or
    /// when the target is a store-generated (embedded) resource
    fn build_object(&self, v: &Value, depth: u32) -> Result<Value> {
        let Value::Ref(id) = v else {
            return Ok(v.clone());
        };
        let generated = is_anonymous_id(id);
        if !generated && depth == 0 {
            return Ok(v.clone());
        }
        if self.ctx.construct_stack.borrow().iter().any(|s| s == id) {
            return Ok(v.clone());
        }
        let next_depth = if generated { depth } else { depth - 1 };
        match self.expand_resource(id, next_depth)? {
            Some(obj) => Ok(obj),
            None => Ok(v.clone()),
        }
    }

    /// Construct the `{*}` object for a single resource
    fn expand_resource(&self, id: &str, depth: u32) -> Result<Option<Value>> {
        let props = self.subject_properties(id)?;
        if props.is_empty() {
            return Ok(None);
        }
        self.ctx.construct_stack.borrow_mut().push(id.to_string());
        let mut map = ValueMap::new();
        if !is_anonymous_id(id) {
            map.insert("id", Value::String(id.to_string()));
        }
        let mut failed = None;
        for (name, values) in props {
            let mut vals = Vec::with_capacity(values.len());
            for v in values {
                match self.build_object(&v, depth) {
                    Ok(v) => vals.push(v),
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
            if failed.is_some() {
                break;
            }
            map.insert(name, collapse(vals));
        }
        self.ctx.construct_stack.borrow_mut().pop();
        match failed {
            Some(e) => Err(e),
            None => {
                // an object carrying nothing beyond its id stays a plain
                // reference
                let floor = usize::from(map.contains("id"));
                if map.len() > floor {
                    Ok(Some(Value::Object(map)))
                } else {
                    Ok(None)
                }
            }
        }
    }

    // ---- expressions ----

    fn eval_expr(&self, id: OpId, scope: &Scope<'_>) -> Result<Value> {
        match self.ast.kind(id) {
            OpKind::Constant(v) => Ok(v.clone()),
            OpKind::PropName(name) => Ok(Value::String(name.clone())),
            OpKind::BindVar(name) => self
                .ctx
                .bindvars
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UnknownBindVariable(name.clone())),
            OpKind::Label(name) => Ok(match find_column_pos(scope.columns, name) {
                Some(path) => collapse(non_null(flatten_cells(&path, scope.row))),
                None => Value::Null,
            }),
            OpKind::Project(p) => self.eval_project(p, scope),
            OpKind::Eq => {
                let children = self.ast.children(id);
                let a = self.eval_expr(children[0], scope)?;
                let b = self.eval_expr(children[1], scope)?;
                Ok(Value::Bool(eq_loose(&a, &b)))
            }
            OpKind::Cmp(op) => {
                let children = self.ast.children(id);
                let a = self.eval_expr(children[0], scope)?;
                let b = self.eval_expr(children[1], scope)?;
                let ord = a.compare(&b);
                Ok(Value::Bool(match op {
                    crate::ast::CmpOp::Lt => ord.is_lt(),
                    crate::ast::CmpOp::Le => ord.is_le(),
                    crate::ast::CmpOp::Gt => ord.is_gt(),
                    crate::ast::CmpOp::Ge => ord.is_ge(),
                }))
            }
            OpKind::And => {
                let children = self.ast.children(id);
                let a = self.eval_expr(children[0], scope)?;
                let b = self.eval_expr(children[1], scope)?;
                Ok(if a.is_truthy() && b.is_truthy() {
                    b
                } else {
                    Value::Bool(false)
                })
            }
            OpKind::Or => {
                let children = self.ast.children(id);
                let a = self.eval_expr(children[0], scope)?;
                if a.is_truthy() {
                    return Ok(a);
                }
                self.eval_expr(children[1], scope)
            }
            OpKind::Not => {
                let child = self.ast.children(id)[0];
                let v = self.eval_expr(child, scope)?;
                Ok(Value::Bool(!v.is_truthy()))
            }
            OpKind::IsNull => {
                let child = self.ast.children(id)[0];
                let v = self.eval_expr(child, scope)?;
                Ok(Value::Bool(v.is_null()))
            }
            OpKind::In => {
                let children = self.ast.children(id);
                let lhs = self.eval_expr(children[0], scope)?;
                let left: Vec<Value> = match lhs {
                    Value::List(items) => items,
                    v => vec![v],
                };
                for arg in &children[1..] {
                    let rhs = self.eval_expr(*arg, scope)?;
                    let matched = match &rhs {
                        Value::List(items) => left
                            .iter()
                            .any(|l| items.iter().any(|r| eq_loose(l, r))),
                        r => left.iter().any(|l| eq_loose(l, r)),
                    };
                    if matched {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            OpKind::FuncCall(info) => self.eval_func(id, &info.clone(), scope),
            other => Err(Error::Evaluation(format!(
                "cannot evaluate {other:?} as an expression"
            ))),
        }
    }

    fn eval_project(&self, p: &Projection, scope: &Scope<'_>) -> Result<Value> {
        if let [PathStep::Pos(pos)] = &p.path[..] {
            return match scope.row.get(pos.index()) {
                Some(Cell::Val(v)) => Ok(v.clone()),
                _ => Ok(Value::Null),
            };
        }
        if p.is_star() {
            return Err(Error::Evaluation(
                "'*' is only valid in a construct pattern".to_string(),
            ));
        }
        let name = p
            .simple_name()
            .ok_or_else(|| Error::Evaluation("malformed projection".to_string()))?;
        let path = find_column_pos(scope.columns, name)
            .ok_or_else(|| Error::Evaluation(format!("'{name}' projection not found")))?;
        let mut vals = non_null(flatten_cells(&path, scope.row));
        if p.construct_refs == Some(true) {
            let mut expanded = Vec::with_capacity(vals.len());
            for v in vals {
                expanded.push(self.build_object(&v, self.ctx.depth)?);
            }
            vals = expanded;
        }
        Ok(collapse(vals))
    }

    fn eval_func(
        &self,
        id: OpId,
        info: &crate::ast::FuncInfo,
        scope: &Scope<'_>,
    ) -> Result<Value> {
        let meta = self.ctx.functions.lookup(&info.name)?;
        let independent = info.independent && self.ast.is_independent(id);
        if independent {
            if let Some(v) = self.ctx.memo.borrow().get(&id) {
                return Ok(v.clone());
            }
        }

        let children = self.ast.children(id);
        let result = match &meta.imp {
            FuncImpl::Lazy(f) => {
                let mut args = NodeArgs {
                    ev: self,
                    scope,
                    children: &children,
                };
                f(&mut args)?
            }
            FuncImpl::Eager(f) => {
                if meta.aggregate {
                    let arg = children.first().copied();
                    let v = match arg.map(|a| self.ast.kind(a)) {
                        // count(*): one entry per group member
                        Some(OpKind::Project(p)) if p.is_star() => {
                            let members = match scope.row.get(1) {
                                Some(Cell::Table(rows)) => rows.len(),
                                Some(Cell::Val(_)) => 1,
                                None => 0,
                            };
                            Value::List(vec![Value::Null; members])
                        }
                        Some(_) => self.eval_expr(arg.expect("checked"), scope)?,
                        None => Value::Null,
                    };
                    f(&[v])?
                } else {
                    let mut args = Vec::with_capacity(children.len());
                    for child in &children {
                        args.push(self.eval_expr(*child, scope)?);
                    }
                    f(&args)?
                }
            }
        };
        if independent {
            self.ctx.memo.borrow_mut().insert(id, result.clone());
        }
        Ok(result)
    }
}

/// Lazy argument adapter for lazy functions like `if`
struct NodeArgs<'e, 'r, 'a> {
    ev: &'e Evaluator<'a>,
    scope: &'e Scope<'r>,
    children: &'e [OpId],
}

impl ArgEval for NodeArgs<'_, '_, '_> {
    fn arg_count(&self) -> usize {
        self.children.len()
    }

    fn eval_arg(&mut self, index: usize) -> Result<Value> {
        let id = *self
            .children
            .get(index)
            .ok_or_else(|| Error::Evaluation(format!("missing function argument {index}")))?;
        self.ev.eval_expr(id, self.scope)
    }
}

/// The shaping stream: splits rows into (subject, remainder) pairs and
/// constructs one value per subject, honoring offset and limit
struct ConstructIter<'a> {
    ev: Evaluator<'a>,
    rows: RowIter<'a>,
    pending: VecDeque<(Value, Row)>,
    subject_path: Vec<usize>,
    row_columns: Rc<Vec<Column>>,
    select_info: SelectInfo,
    construct: OpId,
    shape: Shape,
    grouped: bool,
    skipped: usize,
    yielded: usize,
    index: usize,
    done: bool,
}

impl Iterator for ConstructIter<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(limit) = self.select_info.limit {
                if self.yielded >= limit {
                    self.done = true;
                    return None;
                }
            }
            let Some((id, cols)) = self.pending.pop_front() else {
                match self.rows.next() {
                    None => {
                        self.done = true;
                        return None;
                    }
                    Some(Err(e)) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                    Some(Ok(row)) => {
                        match split_key(&self.subject_path, &row) {
                            Ok(pairs) => self.pending.extend(pairs),
                            Err(e) => {
                                self.done = true;
                                return Some(Err(e));
                            }
                        }
                        continue;
                    }
                }
            };
            if id.is_null() {
                // an outer-join null subject ends the stream
                self.done = true;
                if self.shape == Shape::Array {
                    return Some(Ok(Value::List(Vec::new())));
                }
                return None;
            }
            match self.ev.build_one(
                &id,
                &cols,
                &self.row_columns,
                self.construct,
                self.shape,
                &self.select_info,
                self.grouped,
            ) {
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Ok(None) => continue,
                Ok(Some(value)) => {
                    if self.skipped < self.select_info.offset.unwrap_or(0) {
                        self.skipped += 1;
                        continue;
                    }
                    self.yielded += 1;
                    self.index += 1;
                    if let Some(buffer) = &self.ev.ctx.debug {
                        let _ = writeln!(
                            buffer.borrow_mut(),
                            "row {}: {} -> {}",
                            self.index,
                            id.to_json(),
                            value.to_json()
                        );
                    }
                    return Some(Ok(value));
                }
            }
        }
    }
}

fn construct_shape(ast: &Ast, construct: OpId) -> Shape {
    match ast.kind(construct) {
        OpKind::Construct(shape) => *shape,
        _ => Shape::Object,
    }
}

fn id_str_visible(id: &Value) -> bool {
    match id.as_str() {
        Some(s) => !is_anonymous_id(s),
        None => false,
    }
}

/// Merge every constructed value into one: objects merge keys, arrays
/// concatenate, scalars collect into a list
fn merge_all<'a>(values: ValueIter<'a>, shape: Shape) -> ValueIter<'a> {
    let mut values = Some(values);
    let mut produced = false;
    Box::new(std::iter::from_fn(move || {
        if produced {
            return None;
        }
        produced = true;
        let iter = values.take()?;
        let mut object = ValueMap::new();
        let mut array = Vec::new();
        for value in iter {
            match value {
                Err(e) => return Some(Err(e)),
                Ok(Value::Object(map)) => object.merge(map),
                Ok(Value::List(items)) => array.extend(items),
                Ok(other) => array.push(other),
            }
        }
        Some(Ok(match shape {
            Shape::Object => Value::Object(object),
            _ => Value::List(array),
        }))
    }))
}

// ---- row & column plumbing ----

/// Find the path of a label in a (possibly nested) column list
pub fn find_column_pos(columns: &[Column], label: &str) -> Option<Vec<usize>> {
    for (i, col) in columns.iter().enumerate() {
        if col.label == label {
            return Some(vec![i]);
        }
        if let Some(nested) = &col.nested {
            if let Some(mut path) = find_column_pos(nested, label) {
                path.insert(0, i);
                return Some(path);
            }
        }
    }
    None
}

/// Like `find_column_pos`, also returning the column list that contains the
/// final position
pub fn find_column_rowinfo<'c>(
    columns: &'c [Column],
    label: &str,
) -> Option<(Vec<usize>, &'c [Column])> {
    for (i, col) in columns.iter().enumerate() {
        if col.label == label {
            return Some((vec![i], columns));
        }
        if let Some(nested) = &col.nested {
            if let Some((mut path, level)) = find_column_rowinfo(nested, label) {
                path.insert(0, i);
                return Some((path, level));
            }
        }
    }
    None
}

/// The rows that contain the cell at `path`: the row itself for a
/// top-level path, the deepest nested table's rows otherwise
fn rows_at(path: &[usize], row: &Row) -> Vec<Row> {
    if path.len() <= 1 {
        return vec![row.clone()];
    }
    match &row[path[0]] {
        Cell::Table(rows) => rows
            .iter()
            .flat_map(|nested| rows_at(&path[1..], nested))
            .collect(),
        Cell::Val(_) => Vec::new(),
    }
}

/// Collect the values at `path`, fanning out over nested tables
pub fn flatten_cells(path: &[usize], row: &Row) -> Vec<Value> {
    let mut out = Vec::new();
    collect_cells(path, row, &mut out);
    out
}

fn collect_cells(path: &[usize], row: &Row, out: &mut Vec<Value>) {
    let Some(cell) = row.get(path[0]) else {
        return;
    };
    if path.len() == 1 {
        if let Cell::Val(v) = cell {
            out.push(v.clone());
        }
        return;
    }
    if let Cell::Table(rows) = cell {
        for nested in rows {
            collect_cells(&path[1..], nested, out);
        }
    }
}

fn non_null(vals: Vec<Value>) -> Vec<Value> {
    let filtered: Vec<Value> = vals.into_iter().filter(|v| !v.is_null()).collect();
    filtered
}

/// Zero values are null, one stays scalar, more become a list
pub fn collapse(mut vals: Vec<Value>) -> Value {
    match vals.len() {
        0 => Value::Null,
        1 => vals.remove(0),
        _ => Value::List(vals),
    }
}

/// Multiplicity rules for one constructed property; `None` omits the key
fn shaped_value(pinfo: &PropInfo, v: Value) -> Option<Value> {
    let empty_list = matches!(&v, Value::List(items) if items.is_empty());
    if v.is_null() || empty_list {
        return match pinfo.if_empty {
            EmptyShape::Omit => None,
            EmptyShape::UseNull => Some(Value::Null),
            EmptyShape::UseList => Some(if empty_list { v } else { Value::List(Vec::new()) }),
        };
    }
    if pinfo.if_single == SingleShape::NoList && !v.is_list() {
        return Some(v);
    }
    Some(if v.is_list() {
        v
    } else {
        Value::List(vec![v])
    })
}

fn name_string(v: &Value) -> String {
    match v {
        Value::String(s) | Value::Ref(s) => s.clone(),
        Value::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
        other => other.to_json().to_string(),
    }
}

/// Equality with references and strings comparing by content
pub fn eq_loose(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x) | Value::Ref(x), Value::String(y) | Value::Ref(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| eq_loose(a, b))
        }
        _ => a == b,
    }
}

/// A stable grouping/join key for a value
fn value_key(v: &Value) -> String {
    match v {
        Value::Null => "z".to_string(),
        Value::Bool(b) => format!("b:{b}"),
        Value::Number(n) => format!("n:{n}"),
        Value::String(s) | Value::Ref(s) => format!("s:{s}"),
        other => format!("j:{}", other.to_json()),
    }
}

fn cell_key(cell: &Cell) -> Result<String> {
    match cell {
        Cell::Val(v) => Ok(value_key(v)),
        Cell::Table(_) => Err(Error::Evaluation(
            "malformed join: key column is a table".to_string(),
        )),
    }
}

fn column_signature(col: &Column) -> String {
    let mut out = col.label.clone();
    if let Some(nested) = &col.nested {
        out.push('[');
        for c in nested {
            out.push_str(&column_signature(c));
            out.push(',');
        }
        out.push(']');
    }
    out
}

/// Materialize rows on first pull; errors surface once, then the stream
/// ends
fn lazy_rows<'a, F>(init: F) -> RowIter<'a>
where
    F: FnOnce() -> Result<Vec<Row>> + 'a,
{
    let mut init = Some(init);
    let mut iter: Option<std::vec::IntoIter<Row>> = None;
    Box::new(std::iter::from_fn(move || loop {
        if let Some(it) = iter.as_mut() {
            return it.next().map(Ok);
        }
        match init.take() {
            None => return None,
            Some(f) => match f() {
                Ok(rows) => iter = Some(rows.into_iter()),
                Err(e) => {
                    iter = Some(Vec::new().into_iter());
                    return Some(Err(e));
                }
            },
        }
    }))
}

/// Split a row into (key, remainder) pairs. A nested key fans out: the
/// enclosing cells repeat for each nested row.
fn split_key(path: &[usize], row: &Row) -> Result<Vec<(Value, Row)>> {
    let pos = path[0];
    let rest: Row = row
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != pos)
        .map(|(_, c)| c.clone())
        .collect();
    if path.len() == 1 {
        let key = match row.get(pos) {
            Some(Cell::Val(v)) => v.clone(),
            _ => {
                return Err(Error::Evaluation(
                    "malformed join: key column is a table".to_string(),
                ))
            }
        };
        return Ok(vec![(key, rest)]);
    }
    let Some(Cell::Table(rows)) = row.get(pos) else {
        return Err(Error::Evaluation(
            "malformed join: nested key column is not a table".to_string(),
        ));
    };
    let mut out = Vec::new();
    for nested in rows {
        for (key, nested_rest) in split_key(&path[1..], nested)? {
            let mut combined = rest.clone();
            combined.extend(nested_rest);
            out.push((key, combined));
        }
    }
    Ok(out)
}

/// The columns of `split_key`'s remainder rows: enclosing columns first,
/// the nested remainder appended last
pub fn columns_without_key(path: &[usize], columns: &[Column]) -> Vec<Column> {
    let pos = path[0];
    let mut out: Vec<Column> = columns
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != pos)
        .map(|(_, c)| c.clone())
        .collect();
    if path.len() > 1 {
        if let Some(nested) = &columns[pos].nested {
            out.extend(columns_without_key(&path[1..], nested));
        }
    }
    out
}

/// Group a stream by the cell at `path`, yielding `[key, table]` rows in
/// first-encounter order
fn group_rel<'a>(rel: Rel<'a>, path: Vec<usize>, key_label: String, nested_label: String) -> Rel<'a> {
    let nested_columns = columns_without_key(&path, &rel.columns);
    let columns = vec![
        Column {
            label: key_label,
            nested: None,
        },
        Column {
            label: nested_label,
            nested: Some(nested_columns),
        },
    ];
    let rows_iter = rel.rows;
    let rows = lazy_rows(move || {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, (Value, Vec<Row>)> = HashMap::new();
        for row in rows_iter {
            let row = row?;
            for (key, rest) in split_key(&path, &row)? {
                let k = value_key(&key);
                match groups.get_mut(&k) {
                    Some((_, rows)) => rows.push(rest),
                    None => {
                        order.push(k.clone());
                        groups.insert(k, (key, vec![rest]));
                    }
                }
            }
        }
        Ok(order
            .into_iter()
            .map(|k| {
                let (key, rows) = groups.remove(&k).expect("group recorded");
                vec![Cell::Val(key), Cell::Table(rows)]
            })
            .collect())
    });
    Rel {
        columns,
        rows: Box::new(rows),
    }
}

/// A row of nulls matching a column layout; nested groups hold one nested
/// null row so projections into them resolve to null
fn null_row(columns: &[Column]) -> Row {
    columns
        .iter()
        .map(|col| match &col.nested {
            Some(nested) => Cell::Table(vec![null_row(nested)]),
            None => Cell::Val(Value::Null),
        })
        .collect()
}

/// Hash join of two grouped streams on their key column. The right side is
/// indexed on first pull; the left streams through.
fn hash_join<'a>(left: Rel<'a>, right: Rel<'a>, kind: JoinKind) -> Rel<'a> {
    let columns = match kind {
        JoinKind::Inner | JoinKind::LeftOuter => {
            let mut cols = left.columns.clone();
            cols.extend(right.columns.iter().cloned());
            cols
        }
        JoinKind::Anti | JoinKind::Semi => left.columns.clone(),
    };
    let right_null = null_row(&right.columns);
    Rel {
        columns,
        rows: Box::new(HashJoinIter {
            left: left.rows,
            right: Some(right.rows),
            index: HashMap::new(),
            right_null,
            kind,
            failed: false,
        }),
    }
}

struct HashJoinIter<'a> {
    left: RowIter<'a>,
    right: Option<RowIter<'a>>,
    index: HashMap<String, Row>,
    right_null: Row,
    kind: JoinKind,
    failed: bool,
}

impl Iterator for HashJoinIter<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(right) = self.right.take() {
            for row in right {
                match row {
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    Ok(row) => {
                        let key = match cell_key(&row[0]) {
                            Ok(k) => k,
                            Err(e) => {
                                self.failed = true;
                                return Some(Err(e));
                            }
                        };
                        self.index.insert(key, row);
                    }
                }
            }
        }
        loop {
            let row = match self.left.next()? {
                Ok(row) => row,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };
            let key = match cell_key(&row[0]) {
                Ok(k) => k,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };
            let matched = self.index.get(&key);
            match self.kind {
                JoinKind::Inner => {
                    if let Some(right) = matched {
                        let mut out = row;
                        out.extend(right.iter().cloned());
                        return Some(Ok(out));
                    }
                }
                JoinKind::LeftOuter => {
                    let mut out = row;
                    match matched {
                        Some(right) => out.extend(right.iter().cloned()),
                        None => out.extend(self.right_null.iter().cloned()),
                    }
                    return Some(Ok(out));
                }
                JoinKind::Anti => {
                    if matched.is_none() {
                        return Some(Ok(row));
                    }
                }
                JoinKind::Semi => {
                    if matched.is_some() {
                        return Some(Ok(row));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(v: &str) -> Cell {
        Cell::Val(Value::String(v.to_string()))
    }

    #[test]
    fn test_find_column_pos_nested() {
        let columns = vec![
            Column {
                label: "id".to_string(),
                nested: None,
            },
            Column {
                label: "#0".to_string(),
                nested: Some(vec![
                    Column {
                        label: "foo".to_string(),
                        nested: None,
                    },
                    Column {
                        label: "bar".to_string(),
                        nested: None,
                    },
                ]),
            },
        ];
        assert_eq!(find_column_pos(&columns, "id"), Some(vec![0]));
        assert_eq!(find_column_pos(&columns, "bar"), Some(vec![1, 1]));
        assert_eq!(find_column_pos(&columns, "baz"), None);
    }

    #[test]
    fn test_flatten_cells_over_table() {
        let row: Row = vec![
            val("s1"),
            Cell::Table(vec![vec![val("a")], vec![val("b")]]),
        ];
        assert_eq!(
            flatten_cells(&[1, 0], &row),
            vec![
                Value::String("a".to_string()),
                Value::String("b".to_string())
            ]
        );
    }

    #[test]
    fn test_split_key_nested_repeats_parent() {
        let row: Row = vec![
            val("outer"),
            Cell::Table(vec![
                vec![val("k1"), val("x")],
                vec![val("k2"), val("y")],
            ]),
        ];
        let pairs = split_key(&[1, 0], &row).expect("split");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, Value::String("k1".to_string()));
        assert_eq!(pairs[0].1, vec![val("outer"), val("x")]);
        assert_eq!(pairs[1].0, Value::String("k2".to_string()));
        assert_eq!(pairs[1].1, vec![val("outer"), val("y")]);
    }

    #[test]
    fn test_collapse() {
        assert_eq!(collapse(vec![]), Value::Null);
        assert_eq!(
            collapse(vec![Value::Number(1.0)]),
            Value::Number(1.0)
        );
        assert_eq!(
            collapse(vec![Value::Number(1.0), Value::Number(2.0)]),
            Value::List(vec![Value::Number(1.0), Value::Number(2.0)])
        );
    }

    #[test]
    fn test_eq_loose_refs_and_strings() {
        assert!(eq_loose(
            &Value::Ref("s1".to_string()),
            &Value::String("s1".to_string())
        ));
        assert!(!eq_loose(
            &Value::Ref("s1".to_string()),
            &Value::String("s2".to_string())
        ));
    }

    #[test]
    fn test_shaped_value_rules() {
        let base = PropInfo {
            name: None,
            if_empty: EmptyShape::UseNull,
            if_single: SingleShape::NoList,
            name_is_filter: false,
            has_name_expr: false,
            has_agg: false,
            projects: Vec::new(),
        };
        // null value with usenull keeps the key as null
        assert_eq!(shaped_value(&base, Value::Null), Some(Value::Null));
        // omit drops it
        let omit = PropInfo {
            if_empty: EmptyShape::Omit,
            ..base.clone()
        };
        assert_eq!(shaped_value(&omit, Value::Null), None);
        // forced list wraps scalars
        let listy = PropInfo {
            if_empty: EmptyShape::UseList,
            if_single: SingleShape::UseList,
            ..base.clone()
        };
        assert_eq!(
            shaped_value(&listy, Value::Number(1.0)),
            Some(Value::List(vec![Value::Number(1.0)]))
        );
        assert_eq!(
            shaped_value(&listy, Value::Null),
            Some(Value::List(Vec::new()))
        );
        // multiple values are always a list
        assert_eq!(
            shaped_value(&base, Value::List(vec![Value::Number(1.0), Value::Number(2.0)])),
            Some(Value::List(vec![Value::Number(1.0), Value::Number(2.0)]))
        );
    }

    #[test]
    fn test_null_row_shapes() {
        let columns = vec![
            Column {
                label: "a".to_string(),
                nested: None,
            },
            Column {
                label: "g".to_string(),
                nested: Some(vec![Column {
                    label: "b".to_string(),
                    nested: None,
                }]),
            },
        ];
        let row = null_row(&columns);
        assert_eq!(row[0], Cell::Val(Value::Null));
        assert_eq!(row[1], Cell::Table(vec![vec![Cell::Val(Value::Null)]]));
    }
}
