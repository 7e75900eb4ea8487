//! Rewrite engine
//!
//! Turns the boolean filter tree and the construct pattern of a select into
//! a tree of relational set operators:
//!
//! 1. projections used by the construct, group-by and order-by are folded
//!    into the filter expression as joins,
//! 2. the boolean tree maps onto Join/Union/Except with property paths
//!    expanded to join chains and adjacent filters consolidated,
//! 3. joins that share or reference a label are combined into one join.
//!
//! Filters that test a single statement always end up evaluated before the
//! joins that consume their rows; a join's key must already be bound when
//! the join runs.

use crate::ast::{
    Ast, FuncInfo, JoinCondInfo, JoinKind, OpId, OpKind, PathStep, Projection,
};
use crate::functions::{FuncImpl, FunctionRegistry};
use std::collections::HashMap;
use tern_core::{Error, NameMap, Result, TriplePos};
use tracing::debug;

/// A deferred join-condition: a label reference found inside a filter,
/// waiting for the join that defines the label
#[derive(Debug, Clone)]
struct JoinPred {
    /// The equality predicate the label appeared in (already unlinked)
    pred: OpId,
    /// The referenced label
    label: String,
    /// The filter the predicate was found in
    filter: OpId,
}

#[derive(Debug, Default)]
struct JoinAnalysis {
    /// Labels that denote this join itself
    aliases: Vec<String>,
    preds: Vec<JoinPred>,
}

/// Per-compile rewrite state: the label table, orphaned joins and the
/// anonymous-join counter. Constructed fresh for every compile call.
pub struct ParseState<'f> {
    pub functions: &'f FunctionRegistry,
    /// Labels to the joins carrying them, in encounter order
    labeled_joins: HashMap<String, Vec<OpId>>,
    labeled_join_order: Vec<String>,
    /// Joins lifted out of an expression, keyed by the join that replaced
    /// them; they stay part of the plan and are revisited label-first
    orphaned_joins: HashMap<OpId, Vec<OpId>>,
    anon_counter: u32,
}

impl<'f> ParseState<'f> {
    pub fn new(functions: &'f FunctionRegistry) -> Self {
        Self {
            functions,
            labeled_joins: HashMap::new(),
            labeled_join_order: Vec::new(),
            orphaned_joins: HashMap::new(),
            anon_counter: 0,
        }
    }

    pub fn next_anon_join_id(&mut self) -> String {
        self.anon_counter += 1;
        format!("@{}", self.anon_counter)
    }

    /// Build a function-call node, resolving the name against the registry
    pub fn get_func_op(&self, ast: &mut Ast, name: &str, args: Vec<OpId>) -> Result<OpId> {
        let meta = self.functions.lookup(name)?;
        let info = FuncInfo {
            name: name.to_string(),
            independent: meta.independent,
            aggregate: meta.aggregate,
            lazy: matches!(meta.imp, FuncImpl::Lazy(_)),
        };
        let op = ast.add_typed(OpKind::FuncCall(info), meta.result_type);
        for arg in args {
            ast.link(op, arg)?;
        }
        Ok(op)
    }

    /// Register a named join; the same name may be defined by several
    /// syntactic occurrences, which are merged later
    pub fn add_labeled_join(&mut self, ast: &mut Ast, name: &str, join: OpId) -> Result<()> {
        match ast.join_label(join) {
            Some(existing) if existing != name => {
                return Err(Error::Compile(format!(
                    "can't assign id {name}, join already labeled {existing}"
                )));
            }
            Some(_) => {}
            None => ast.set_join_label(join, name),
        }
        self.labeled_joins
            .entry(name.to_string())
            .or_default()
            .push(join);
        // outermost occurrence wins the merge order
        self.labeled_join_order.retain(|n| n != name);
        self.labeled_join_order.push(name.to_string());
        Ok(())
    }

    /// Build a join expression from the construct pattern: every projection
    /// the construct, group-by or order-by needs becomes part of the where
    /// expression, then the whole expression is rewritten
    pub fn join_from_construct(
        &mut self,
        ast: &mut Ast,
        construct: OpId,
        where_expr: Option<OpId>,
        group_by: Option<OpId>,
        order_by: Option<OpId>,
    ) -> Result<OpId> {
        let mut left = where_expr;

        for prop in ast.children(construct) {
            let OpKind::ConstructProp(info) = ast.kind(prop).clone() else {
                continue;
            };
            let mut projects = Vec::new();
            let name_expr = if info.has_name_expr {
                ast.children(prop).get(1).copied()
            } else {
                None
            };
            let mut has_agg = info.has_agg;
            for child in ast.descendants_until(prop, |a, id| {
                !a.kind(id).is_resource_set() && !matches!(a.kind(id), OpKind::Select(_))
            }) {
                match ast.kind(child).clone() {
                    OpKind::Project(p) => {
                        if p.is_star() || p.is_subject() {
                            continue;
                        }
                        let in_name_expr =
                            name_expr.is_some_and(|n| ast.is_descendant_of(child, n));
                        if !in_name_expr {
                            projects.push(child);
                        }
                        if info.if_empty == crate::ast::EmptyShape::Omit {
                            ast.node_mut(child).maybe = true;
                        }
                        let copy = ast.clone_subtree(child);
                        left = Some(self.and_with(ast, left, copy)?);
                    }
                    kind if kind.is_resource_set() => {
                        self.replace_join_with_label(ast, child)?;
                        left = Some(self.and_with(ast, left, child)?);
                    }
                    OpKind::FuncCall(f) if f.aggregate => {
                        has_agg = true;
                    }
                    _ => {}
                }
            }
            // ommittable properties join as outer joins
            if info.if_empty == crate::ast::EmptyShape::Omit {
                for child in ast.children(prop) {
                    ast.node_mut(child).maybe = true;
                }
            }
            if let OpKind::ConstructProp(info) = &mut ast.node_mut(prop).kind {
                info.projects = projects;
                info.has_agg = has_agg;
            }
        }

        if let Some(group_by) = group_by {
            let key = ast.children(group_by)[0];
            if let OpKind::Project(p) = ast.kind(key).clone() {
                let copy = ast.clone_subtree(key);
                left = Some(self.and_with(ast, left, copy)?);
                // the group key is output raw, not as an expanded object
                if let Some(name) = p.simple_name() {
                    for prop in ast.children(construct) {
                        if !matches!(ast.kind(prop), OpKind::ConstructProp(_)) {
                            continue;
                        }
                        let Some(value) = ast.children(prop).first().copied() else {
                            continue;
                        };
                        if let OpKind::Project(vp) = &mut ast.node_mut(value).kind {
                            if vp.simple_name() == Some(name) {
                                vp.construct_refs = Some(false);
                            }
                        }
                    }
                }
            }
        }

        if let Some(order_by) = order_by {
            for child in ast.descendants(order_by) {
                if matches!(ast.kind(child), OpKind::Project(_)) {
                    ast.node_mut(child).maybe = true;
                    let copy = ast.clone_subtree(child);
                    left = Some(self.and_with(ast, left, copy)?);
                }
            }
        }

        let join = match left {
            Some(expr) => self.make_join_expr(ast, expr)?,
            None => ast.add(OpKind::Join),
        };

        let name = ast.subject_label(construct);
        match name {
            None => {
                if let Some(join_name) = ast.join_label(join).map(str::to_string) {
                    // the join is named but the id is not; adopt the name
                    let label = ast.add(OpKind::Label(join_name));
                    let subject = ast
                        .construct_subject(construct)
                        .expect("construct always has a subject");
                    ast.link(subject, label)?;
                } else {
                    self.add_labeled_join(ast, "", join)?;
                }
            }
            Some(name) => self.add_labeled_join(ast, &name, join)?,
        }
        Ok(join)
    }

    fn and_with(&mut self, ast: &mut Ast, left: Option<OpId>, right: OpId) -> Result<OpId> {
        match left {
            None => Ok(right),
            Some(left) => {
                let and = ast.add(OpKind::And);
                ast.link(and, left)?;
                ast.link(and, right)?;
                Ok(and)
            }
        }
    }

    /// Replace a join nested inside an expression with a label referencing
    /// it; the join itself lives on as an orphan until label resolution
    pub fn replace_join_with_label(&mut self, ast: &mut Ast, join: OpId) -> Result<OpId> {
        let name = match ast.join_label(join) {
            Some(name) => name.to_string(),
            None => {
                let name = self.next_anon_join_id();
                self.add_labeled_join(ast, &name, join)?;
                name
            }
        };
        let label = ast.add(OpKind::Label(name));
        ast.node_mut(label).maybe = ast.node(join).maybe;
        if let Some(parent) = ast.parent(join) {
            ast.replace_child(parent, join, label)?;
        }
        Ok(label)
    }

    /// Rewrite a boolean expression into filters grouped by Join/Union/
    /// Except. Single-statement filters come out as direct children; every
    /// projection becomes a filter or join chain of its own.
    pub fn make_join_expr(&mut self, ast: &mut Ast, expr: OpId) -> Result<OpId> {
        let mut root_join = None;
        let mut cmproots: Vec<(OpId, OpId)> = Vec::new();
        let mut to_visit = vec![(None::<OpId>, expr)];

        while let Some((parent, mut v)) = to_visit.pop() {
            let mut not_count = 0;
            while matches!(ast.kind(v), OpKind::Not) {
                not_count += 1;
                v = ast.children(v)[0];
            }

            let set_op = match ast.kind(v) {
                OpKind::And => Some(OpKind::Join),
                OpKind::Or => Some(OpKind::Union),
                _ => None,
            };

            if let Some(set_op) = set_op {
                let mut parent = parent;
                if not_count % 2 == 1 {
                    // a negated logical subtree is a set difference against
                    // the enclosing join
                    let except = ast.add(OpKind::Except);
                    match parent {
                        None => root_join = Some(except),
                        Some(p) => {
                            let jc = self.new_join_cond(
                                ast,
                                except,
                                TriplePos::Subject,
                                JoinKind::Anti,
                            )?;
                            ast.link(p, jc)?;
                        }
                    }
                    parent = Some(except);
                }
                let target = match parent {
                    None => {
                        let op = ast.add(set_op);
                        root_join = Some(op);
                        op
                    }
                    // flatten and(and(a,b),c) into one join of three
                    Some(p) if *ast.kind(p) == set_op => p,
                    Some(p) => {
                        let op = ast.add(set_op);
                        let jc =
                            self.new_join_cond(ast, op, TriplePos::Subject, JoinKind::Inner)?;
                        ast.link(p, jc)?;
                        op
                    }
                };
                for arg in ast.children(v) {
                    to_visit.push((Some(target), arg));
                }
            } else {
                let parent = match parent {
                    Some(p) => p,
                    None => {
                        let op = ast.add(OpKind::Join);
                        root_join = Some(op);
                        op
                    }
                };
                if not_count % 2 == 1 {
                    let not = ast.add(OpKind::Not);
                    ast.link(not, v)?;
                    v = not;
                }
                cmproots.push((parent, v));
            }
        }

        for (parent, root) in cmproots {
            self.rewrite_comparison(ast, parent, root)?;
        }

        let root_join = root_join.ok_or_else(|| Error::Compile("empty expression".to_string()))?;
        ensure_join_keys(ast, root_join)?;
        ast.validate(root_join)?;
        Ok(root_join)
    }

    /// Rewrite one top-level comparison under its join: expand projections,
    /// consolidate the root filter, assign the join kind
    fn rewrite_comparison(&mut self, ast: &mut Ast, parent: OpId, root: OpId) -> Result<()> {
        let mut join_kind = JoinKind::Inner;
        let mut project_ops: Vec<(OpId, OpId)> = Vec::new();
        let mut skip_root = false;

        for child in
            ast.descendants_until(root, |a, id| !a.kind(id).is_resource_set())
        {
            match ast.kind(child).clone() {
                kind if kind.is_resource_set() => {
                    if child == root {
                        // a bare join expression participates directly, not
                        // as a filter predicate
                        ast.unlink(child);
                        skip_root = true;
                    } else {
                        self.replace_join_with_label(ast, child)?;
                    }
                    self.orphaned_joins.entry(parent).or_default().push(child);
                }
                OpKind::Project(_) => {
                    let child_parent = ast.parent(child);
                    if let Some(project_op) = self.project_to_filter(ast, child)? {
                        project_ops.push((child, project_op));
                    }
                    if child == root {
                        // a bare property reference only asserts existence
                        skip_root = true;
                    } else if child_parent == Some(root)
                        && matches!(ast.kind(root), OpKind::Not)
                    {
                        // "not prop": an anti-join existence test
                        join_kind = JoinKind::Anti;
                        skip_root = true;
                    }
                }
                _ => {}
            }
            if ast.node(child).maybe {
                let eligible = child == root
                    || matches!(
                        ast.kind(child),
                        OpKind::Project(_) | OpKind::Label(_)
                    )
                    || ast.kind(child).is_resource_set();
                if eligible {
                    join_kind = JoinKind::LeftOuter;
                } else {
                    return Err(Error::Compile(format!(
                        "illegal maybe expression: {child}"
                    )));
                }
            }
        }

        let filter = if skip_root {
            None
        } else {
            let filter = ast.add(OpKind::Filter);
            ast.link(filter, root)?;
            consolidate_filter(ast, filter, &mut project_ops)?;
            Some(filter)
        };

        if filter.is_some()
            && project_ops
                .iter()
                .any(|(_, op)| matches!(ast.kind(*op), OpKind::Filter))
        {
            // two property references compared against each other cannot be
            // consolidated into one filter; this engine does not join them
            return Err(Error::Compile(
                "comparing multiple property references in one expression is not supported"
                    .to_string(),
            ));
        }

        for (_, project_op) in project_ops {
            if let OpKind::JoinCond(_) = ast.kind(project_op) {
                if let OpKind::JoinCond(info) = &mut ast.node_mut(project_op).kind {
                    info.kind = join_kind;
                }
                ast.link(parent, project_op)?;
            } else {
                let jc = self.new_join_cond(ast, project_op, TriplePos::Subject, join_kind)?;
                ast.link(parent, jc)?;
            }
        }
        if let Some(filter) = filter {
            let jc = self.new_join_cond(ast, filter, TriplePos::Subject, join_kind)?;
            ast.link(parent, jc)?;
        }
        Ok(())
    }

    /// Wrap a relational child in a join condition keyed on a triple
    /// position: the position is normalized to a `#n` label on the child's
    /// filter
    fn new_join_cond(
        &mut self,
        ast: &mut Ast,
        child: OpId,
        pos: TriplePos,
        kind: JoinKind,
    ) -> Result<OpId> {
        let key = format!("#{}", pos.index());
        // best effort now; ensure_join_keys finishes the job once the
        // child's filters exist
        let _ = ast.add_label_to_join(child, &key, pos)?;
        let jc = ast.add(OpKind::JoinCond(JoinCondInfo { key, kind }));
        ast.link(jc, child)?;
        Ok(jc)
    }

    /// Return an op retrieving the rows that match a projection.
    ///
    /// `bar` becomes a filter testing the property name, labeled on its
    /// object column. `foo.bar` becomes a join chain: the filter for each
    /// path segment joins its object column to the subject of the next
    /// segment's filter, one join per segment.
    fn project_to_filter(&mut self, ast: &mut Ast, project: OpId) -> Result<Option<OpId>> {
        let OpKind::Project(p) = ast.kind(project).clone() else {
            return Ok(None);
        };
        if p.is_subject() || p.is_star() {
            return Ok(None);
        }

        let mut op: Option<(OpId, OpId)> = None; // (op, innermost filter)
        for step in p.path.iter().rev() {
            let PathStep::Name(name) = step else {
                return Err(Error::Compile(
                    "malformed projection path".to_string(),
                ));
            };
            match op {
                None => {
                    let filter = self.name_filter(ast, name)?;
                    ast.add_label(filter, name, TriplePos::Object)?;
                    op = Some((filter, filter));
                }
                Some((prev, _)) => {
                    let subject_label = self.next_anon_join_id();
                    let filter = self.name_filter(ast, name)?;
                    ast.add_label(filter, &subject_label, TriplePos::Subject)?;

                    let join = ast.add(OpKind::Join);
                    // a deeper chain is already a condition keyed on its
                    // own subject label
                    let prev_jc = if matches!(ast.kind(prev), OpKind::JoinCond(_)) {
                        prev
                    } else {
                        self.new_join_cond(ast, prev, TriplePos::Subject, JoinKind::Inner)?
                    };
                    let filter_jc =
                        self.new_join_cond(ast, filter, TriplePos::Object, JoinKind::Inner)?;
                    ast.link(join, prev_jc)?;
                    ast.link(join, filter_jc)?;

                    let jc = ast.add(OpKind::JoinCond(JoinCondInfo {
                        key: subject_label,
                        kind: JoinKind::Inner,
                    }));
                    ast.link(jc, join)?;
                    op = Some((jc, filter));
                }
            }
        }
        let (mut op, chain_filter) = op.expect("non-empty projection path");

        if let Some(varref) = &p.varref {
            // ?var.path: the label denotes the subject at the head of the
            // chain
            let head = match ast.kind(op) {
                OpKind::Filter => op,
                _ => chain_filter,
            };
            ast.add_label(head, varref, TriplePos::Subject)?;
            let join = ast.add(OpKind::Join);
            if matches!(ast.kind(op), OpKind::JoinCond(_)) {
                ast.link(join, op)?;
            } else {
                let jc = self.new_join_cond(ast, op, TriplePos::Subject, JoinKind::Inner)?;
                ast.link(join, jc)?;
            }
            self.add_labeled_join(ast, varref, join)?;
            op = join;
        }
        Ok(Some(op))
    }

    /// A filter testing "property name equals `name`"
    fn name_filter(&mut self, ast: &mut Ast, name: &str) -> Result<OpId> {
        let filter = ast.add(OpKind::Filter);
        let eq = ast.add(OpKind::Eq);
        let prop_name = ast.add(OpKind::PropName(name.to_string()));
        let pred_col = ast.add(OpKind::Project(Projection {
            path: vec![PathStep::Pos(TriplePos::Predicate)],
            varref: None,
            construct_refs: None,
        }));
        ast.link(eq, prop_name)?;
        ast.link(eq, pred_col)?;
        ast.link(filter, eq)?;
        Ok(filter)
    }

    /// When a join is about to be relocated out of its select, make sure
    /// the select can still find its rows by label
    fn prepare_join_move(&mut self, ast: &mut Ast, join: OpId) -> Result<()> {
        let Some(parent) = ast.parent(join) else {
            return Ok(());
        };
        if !matches!(ast.kind(parent), OpKind::Select(_)) {
            return Ok(());
        }
        let name = match ast.join_label(join) {
            Some(name) => name.to_string(),
            None => {
                let name = self.next_anon_join_id();
                ast.set_join_label(join, &name);
                name
            }
        };
        let Some(construct) = ast.select_construct(parent) else {
            return Ok(());
        };
        let subject = ast
            .construct_subject(construct)
            .expect("construct always has a subject");
        if ast.subject_label(construct).is_none() {
            let label = ast.add(OpKind::Label(name));
            ast.link(subject, label)?;
        }
        Ok(())
    }

    /// Combine joins that share a label into one join
    fn join_labeled_joins(&mut self, ast: &mut Ast) -> Result<HashMap<String, OpId>> {
        let mut merged = HashMap::new();
        for name in self.labeled_join_order.clone() {
            if name.is_empty() {
                continue;
            }
            let mut joins = self.labeled_joins.get(&name).cloned().unwrap_or_default();
            joins.dedup();
            let Some((&first, rest)) = joins.split_first() else {
                continue;
            };
            for &join in rest {
                if join == first {
                    continue;
                }
                self.prepare_join_move(ast, join)?;
                for child in ast.children(join) {
                    ast.link(first, child)?;
                }
                ast.unlink(join);
            }
            ast.set_join_label(first, &name);
            merged.insert(name, first);
        }
        Ok(merged)
    }

    /// Collect joins outermost-first: a select's where clause comes before
    /// its construct, so reference resolution lets outer joins absorb the
    /// nested trees that reference them
    fn find_joins_in_doc_order(&self, ast: &Ast, root: OpId, out: &mut Vec<OpId>) {
        if ast.kind(root).is_resource_set() {
            out.push(root);
            if let Some(orphans) = self.orphaned_joins.get(&root) {
                for orphan in orphans.clone() {
                    self.find_joins_in_doc_order(ast, orphan, out);
                }
            }
        }
        let children: Vec<OpId> = if matches!(ast.kind(root), OpKind::Select(_)) {
            let mut ordered = Vec::new();
            ordered.extend(ast.select_where(root));
            ordered.extend(ast.select_construct(root));
            ordered.extend(ast.select_group_by(root));
            ordered.extend(ast.select_order_by(root));
            ordered
        } else {
            ast.children(root)
        };
        for child in children {
            self.find_joins_in_doc_order(ast, child, out);
        }
    }

    /// Find the label references each join participates in. `id = ?x`
    /// aliases the join itself; `prop = ?x` records a deferred join
    /// condition; `?x = ?y` chains aliases.
    fn analyze_join(&self, ast: &mut Ast, join: OpId) -> Result<JoinAnalysis> {
        let mut analysis = JoinAnalysis::default();
        if let Some(name) = ast.join_label(join) {
            analysis.aliases.push(name.to_string());
        }

        // collect (pred, label) pairs: every label under this join (not
        // crossing nested set ops) with the enclosing filter predicate
        let mut preds = Vec::new();
        for node in ast.descendants_until(join, |a, id| {
            id == join || !a.kind(id).is_resource_set()
        }) {
            let OpKind::Label(label_name) = ast.kind(node).clone() else {
                continue;
            };
            let mut pred = None;
            let mut cursor = node;
            while let Some(p) = ast.parent(cursor) {
                if matches!(ast.kind(p), OpKind::Filter) {
                    pred = Some(cursor);
                    break;
                }
                cursor = p;
            }
            if let Some(pred) = pred {
                preds.push((pred, node, label_name));
            }
        }

        let mut handled = std::collections::HashSet::new();
        let mut remaining: Vec<OpId> = Vec::new();
        loop {
            let alias_count = analysis.aliases.len();
            for &(pred, label_node, ref label_name) in &preds {
                if handled.contains(&pred) {
                    continue;
                }
                let simple_eq = ast.parent(label_node) == Some(pred)
                    && matches!(ast.kind(pred), OpKind::Eq);
                let mut was_handled = false;
                if simple_eq {
                    let other = ast
                        .children(pred)
                        .into_iter()
                        .find(|c| *c != label_node);
                    match other.map(|o| (o, ast.kind(o).clone())) {
                        Some((_, OpKind::Project(p))) if p.is_subject() => {
                            // id = ?x: the label aliases this join
                            analysis.aliases.push(label_name.clone());
                            let filter = ast.parent(pred).expect("pred is inside a filter");
                            ast.detach(filter);
                            was_handled = true;
                        }
                        Some((_, OpKind::Project(p)))
                            if p.path == [PathStep::Pos(TriplePos::Object)] =>
                        {
                            // prop = ?x: defer as a join condition
                            let filter = ast.parent(pred).expect("pred is inside a filter");
                            ast.unlink(pred);
                            analysis.preds.push(JoinPred {
                                pred,
                                label: label_name.clone(),
                                filter,
                            });
                            was_handled = true;
                        }
                        Some((_, OpKind::Label(other_name))) => {
                            if analysis.aliases.contains(&other_name) {
                                analysis.aliases.push(label_name.clone());
                                let filter =
                                    ast.parent(pred).expect("pred is inside a filter");
                                ast.detach(filter);
                                was_handled = true;
                            } else if analysis.aliases.contains(label_name) {
                                analysis.aliases.push(other_name);
                                let filter =
                                    ast.parent(pred).expect("pred is inside a filter");
                                ast.detach(filter);
                                was_handled = true;
                            }
                        }
                        _ => {}
                    }
                }
                if was_handled {
                    handled.insert(pred);
                } else if analysis.aliases.contains(label_name) {
                    // a self reference is just the subject column
                    let subject = ast.add(OpKind::Project(Projection {
                        path: vec![PathStep::Pos(TriplePos::Subject)],
                        varref: None,
                        construct_refs: None,
                    }));
                    let parent = ast.parent(label_node).expect("label has a parent");
                    ast.replace_child(parent, label_node, subject)?;
                    handled.insert(pred);
                } else if !remaining.contains(&pred) {
                    remaining.push(pred);
                }
            }
            if analysis.aliases.len() == alias_count {
                break;
            }
            remaining.retain(|p| !handled.contains(p));
        }

        remaining.retain(|p| !handled.contains(p));
        if remaining.iter().any(|p| !ast.is_independent(*p)) {
            return Err(Error::Compile(
                "only equijoins are currently supported".to_string(),
            ));
        }
        Ok(analysis)
    }

    /// Merge label references into the joins that define the labels,
    /// deepest joins first
    fn make_join(
        &mut self,
        ast: &mut Ast,
        join: OpId,
        following: &[OpId],
        refs: &mut Vec<(String, OpId, OpId, OpId)>,
        analyses: &HashMap<OpId, JoinAnalysis>,
        labels: &HashMap<String, OpId>,
    ) -> Result<()> {
        let analysis = &analyses[&join];

        for jp in &analysis.preds {
            let ref_join = *labels
                .get(&jp.label)
                .ok_or_else(|| Error::UnresolvedLabel(jp.label.clone()))?;
            if !following.contains(&ref_join) {
                // the defining join comes earlier; resolve when we get there
                refs.push((jp.label.clone(), jp.pred, jp.filter, join));
                continue;
            }
            self.merge_reference(ast, join, ref_join, jp.filter)?;
        }

        // references recorded by joins processed before this one
        let mut index = 0;
        while index < refs.len() {
            let (label, pred, filter, ref_join) = refs[index].clone();
            if !analysis.aliases.contains(&label) {
                index += 1;
                continue;
            }
            let top_join = top_join_below(ast, ref_join, join);
            if !following.contains(&top_join) {
                index += 1;
                continue;
            }
            let join_type = filter_join_kind(ast, filter);
            self.prepare_join_move(ast, top_join)?;
            let prop_name = object_label(ast, filter)?;
            let jc = ast.add(OpKind::JoinCond(JoinCondInfo {
                key: prop_name,
                kind: join_type,
            }));
            ast.link(jc, top_join)?;
            ast.link(join, jc)?;
            ast.unlink(pred);
            refs.remove(index);
        }
        Ok(())
    }

    /// Join the join that defines a referenced label into the referencing
    /// join, relocating whichever join tree is free-standing
    fn merge_reference(
        &mut self,
        ast: &mut Ast,
        join: OpId,
        ref_join: OpId,
        filter: OpId,
    ) -> Result<()> {
        let top_join = top_join_below(ast, ref_join, join);
        let prop_name = object_label(ast, filter)?;
        let join_type = filter_join_kind(ast, filter);
        self.prepare_join_move(ast, top_join)?;

        if !ast.children(top_join).is_empty() {
            // give the referenced join a filter binding the referencing
            // property, then join it in by that statement's subject
            let bridge = self.name_filter(ast, &prop_name)?;
            ast.add_label(bridge, &format!("{prop_name}#id"), TriplePos::Subject)?;
            ast.add_label(bridge, &prop_name, TriplePos::Object)?;
            let bridge_jc = self.new_join_cond(ast, bridge, TriplePos::Object, join_type)?;
            ast.link(top_join, bridge_jc)?;

            let jc = ast.add(OpKind::JoinCond(JoinCondInfo {
                key: format!("{prop_name}#id"),
                kind: join_type,
            }));
            ast.link(jc, top_join)?;
            ast.link(join, jc)?;
            ast.detach(filter);
        } else {
            // the referenced join is empty: this join's rows already carry
            // the value, expose it under the join's label
            if let Some(name) = ast.join_label(top_join).map(str::to_string) {
                ast.add_label(filter, &name, TriplePos::Object)?;
            }
            ast.unlink(top_join);
        }
        Ok(())
    }

    /// Resolve deferred label references and merge labeled joins across the
    /// whole query
    pub fn build_joins(&mut self, ast: &mut Ast, root: OpId) -> Result<()> {
        ast.validate(root)?;
        self.join_labeled_joins(ast)?;

        let mut joins = Vec::new();
        self.find_joins_in_doc_order(ast, root, &mut joins);

        let mut analyses = HashMap::new();
        for &join in &joins {
            analyses.insert(join, self.analyze_join(ast, join)?);
        }
        let mut labels: HashMap<String, OpId> = HashMap::new();
        for &join in &joins {
            for alias in &analyses[&join].aliases {
                labels.entry(alias.clone()).or_insert(join);
            }
        }

        let mut refs = Vec::new();
        for i in (0..joins.len()).rev() {
            self.make_join(ast, joins[i], &joins[i + 1..], &mut refs, &analyses, &labels)?;
        }
        if let Some((label, ..)) = refs.first() {
            return Err(Error::UnresolvedLabel(label.clone()));
        }

        ensure_join_keys(ast, root)?;
        ast.validate(root)?;
        debug!(joins = joins.len(), "joins resolved");
        Ok(())
    }
}

/// The topmost set operator above `join` that is still below `top`
fn top_join_below(ast: &Ast, join: OpId, top: OpId) -> OpId {
    let mut candidate = join;
    let mut cursor = Some(join);
    while let Some(id) = cursor {
        if ast.kind(id).is_resource_set() {
            if id == top {
                return candidate;
            }
            candidate = id;
        }
        cursor = ast.parent(id);
    }
    candidate
}

/// The join kind of the condition wrapping a filter
fn filter_join_kind(ast: &Ast, filter: OpId) -> JoinKind {
    match ast.parent(filter).map(|p| ast.kind(p)) {
        Some(OpKind::JoinCond(info)) => info.kind,
        _ => JoinKind::Inner,
    }
}

/// The first object-position label of a filter
fn object_label(ast: &Ast, filter: OpId) -> Result<String> {
    ast.node(filter)
        .labels
        .iter()
        .find(|(_, pos)| *pos == TriplePos::Object)
        .map(|(name, _)| name.clone())
        .ok_or_else(|| Error::Compile("malformed join: filter has no object label".to_string()))
}

/// Make sure every positional `#n` join key is carried as a label by a
/// filter under its condition's child
fn ensure_join_keys(ast: &mut Ast, root: OpId) -> Result<()> {
    for id in ast.descendants(root) {
        let OpKind::JoinCond(info) = ast.kind(id) else {
            continue;
        };
        let Some(rest) = info.key.strip_prefix('#') else {
            continue;
        };
        let pos = match rest {
            "0" => TriplePos::Subject,
            "1" => TriplePos::Predicate,
            "2" => TriplePos::Object,
            _ => continue,
        };
        let key = info.key.clone();
        let child = ast.children(id)[0];
        if !ast.add_label_to_join(child, &key, pos)? {
            return Err(Error::Compile(
                "malformed join: position references no filter".to_string(),
            ));
        }
    }
    Ok(())
}

/// Consolidate a projection filter into the comparison's own filter, so a
/// test like `foo = 'bar'` runs as one filter over one statement instead of
/// a join of two. A consolidated filter carries at most one predicate per
/// triple position.
pub fn consolidate_filter(
    ast: &mut Ast,
    filter: OpId,
    project_ops: &mut Vec<(OpId, OpId)>,
) -> Result<bool> {
    let filter_projects: Vec<usize> = project_ops
        .iter()
        .enumerate()
        .filter(|(_, (_, op))| matches!(ast.kind(*op), OpKind::Filter))
        .map(|(i, _)| i)
        .collect();
    if filter_projects.len() != 1 {
        return Ok(false);
    }
    let at = filter_projects[0];
    let (project, _) = project_ops[at];

    let Some(name) = (match ast.kind(project) {
        OpKind::Project(p) if p.path.len() == 1 => p.simple_name().map(str::to_string),
        _ => None,
    }) else {
        return Ok(false);
    };

    // the projection now reads the object column of the consolidated filter
    if let OpKind::Project(p) = &mut ast.node_mut(project).kind {
        p.path = vec![PathStep::Pos(TriplePos::Object)];
    }
    let eq = ast.add(OpKind::Eq);
    let pred_col = ast.add(OpKind::Project(Projection {
        path: vec![PathStep::Pos(TriplePos::Predicate)],
        varref: None,
        construct_refs: None,
    }));
    let prop_name = ast.add(OpKind::PropName(name.clone()));
    ast.link(eq, pred_col)?;
    ast.link(eq, prop_name)?;
    ast.link(filter, eq)?;
    ast.add_label(filter, &name, TriplePos::Object)?;
    project_ops.remove(at);
    Ok(true)
}

/// Expand qualified names below a select using its namemap layered over the
/// enclosing one; nested selects resolve independently
pub fn resolve_names(ast: &mut Ast, select: OpId, inherited: &NameMap) {
    let own = match ast.kind(select) {
        OpKind::Select(info) => info.namemap.clone(),
        _ => None,
    };
    let effective = match own {
        Some(nm) => inherited.merged(&nm),
        None => inherited.clone(),
    };

    let nodes = ast.descendants_until(select, |a, id| {
        id == select || !matches!(a.kind(id), OpKind::Select(_))
    });
    for id in nodes {
        if id != select && matches!(ast.kind(id), OpKind::Select(_)) {
            resolve_names(ast, id, &effective);
            continue;
        }
        if effective.is_empty() {
            continue;
        }
        match &mut ast.node_mut(id).kind {
            OpKind::Project(p) => {
                for step in &mut p.path {
                    if let PathStep::Name(name) = step {
                        *name = effective.resolve(name);
                    }
                }
            }
            OpKind::PropName(name) => {
                *name = effective.resolve(name);
            }
            OpKind::JoinCond(info) => {
                if !info.key.starts_with('#') {
                    info.key = effective.resolve(&info.key);
                }
            }
            _ => {}
        }
        let labels = std::mem::take(&mut ast.node_mut(id).labels);
        ast.node_mut(id).labels = labels
            .into_iter()
            .map(|(name, pos)| {
                if name.starts_with('#') || name.starts_with('@') {
                    (name, pos)
                } else {
                    (effective.resolve(&name), pos)
                }
            })
            .collect();
    }
}
