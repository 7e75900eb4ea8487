//! Query AST
//!
//! Nodes live in an arena and address each other by index. The parent edge
//! is a plain index used only for traversal and local rewrites, never for
//! ownership. Linking checks the ancestor chain structurally, so a cycle is
//! rejected at the point it would be created.

use std::fmt::Write as _;
use tern_core::{Error, NameMap, Result, TriplePos, Value};

/// Index of a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(u32);

impl OpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Semantic type of an expression node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemType {
    Object,
    Number,
    String,
    Boolean,
    Tupleset,
}

/// Ordering comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// One step of a property path reference
#[derive(Debug, Clone, PartialEq)]
pub enum PathStep {
    /// A fixed triple position (subject/predicate/object)
    Pos(TriplePos),
    /// A named property
    Name(String),
    /// All properties
    Star,
}

/// A column reference: a property path, optionally qualified by a label
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub path: Vec<PathStep>,
    pub varref: Option<String>,
    /// Whether reference values should expand to nested objects; `None`
    /// means "decide from context"
    pub construct_refs: Option<bool>,
}

impl Projection {
    pub fn name(&self) -> &PathStep {
        self.path.last().expect("projection path is never empty")
    }

    /// Plain subject reference (`id`)
    pub fn is_subject(&self) -> bool {
        self.path == [PathStep::Pos(TriplePos::Subject)]
    }

    pub fn is_star(&self) -> bool {
        matches!(self.name(), PathStep::Star)
    }

    /// The projection's property name, if it is a plain named reference
    pub fn simple_name(&self) -> Option<&str> {
        match self.name() {
            PathStep::Name(n) => Some(n),
            _ => None,
        }
    }
}

/// How a join condition's child participates in the parent join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
    Anti,
    Semi,
}

impl JoinKind {
    pub fn symbol(self) -> &'static str {
        match self {
            JoinKind::Inner => "i",
            JoinKind::LeftOuter => "l",
            JoinKind::Anti => "a",
            JoinKind::Semi => "s",
        }
    }
}

/// The join key of a join condition: a label into the child's columns
#[derive(Debug, Clone, PartialEq)]
pub struct JoinCondInfo {
    pub key: String,
    pub kind: JoinKind,
}

/// Multiplicity when a property has no value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyShape {
    Omit,
    UseNull,
    UseList,
}

/// Multiplicity when a property has exactly one value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleShape {
    NoList,
    UseList,
}

/// Output shape of a construct pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Object,
    Array,
    Scalar,
}

/// A property of a construct pattern. Children: the value expression,
/// followed by the name expression when `has_name_expr` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct PropInfo {
    pub name: Option<String>,
    pub if_empty: EmptyShape,
    pub if_single: SingleShape,
    pub name_is_filter: bool,
    pub has_name_expr: bool,
    pub has_agg: bool,
    /// Projections inside the value expression, recorded during rewrite
    pub projects: Vec<OpId>,
}

/// Function call metadata resolved against the registry at parse time
#[derive(Debug, Clone, PartialEq)]
pub struct FuncInfo {
    pub name: String,
    pub independent: bool,
    pub aggregate: bool,
    pub lazy: bool,
}

/// Query criteria attached to a select
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectInfo {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub depth: Option<u32>,
    pub mergeall: bool,
    pub namemap: Option<NameMap>,
    /// Top-level queries without a filter skip store-generated subjects,
    /// which already appear embedded in other results
    pub skip_anonymous: bool,
}

/// The tagged variant each AST node is one case of
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    // boolean / value expressions
    And,
    Or,
    Not,
    In,
    IsNull,
    Eq,
    Cmp(CmpOp),
    Constant(Value),
    PropName(String),
    Label(String),
    BindVar(String),
    FuncCall(FuncInfo),
    Project(Projection),
    // relational operators
    Filter,
    Join,
    Union,
    Except,
    JoinCond(JoinCondInfo),
    // output shaping
    ConstructSubject(String),
    ConstructProp(PropInfo),
    Construct(Shape),
    GroupBy,
    OrderBy,
    SortExp { descending: bool },
    Select(SelectInfo),
}

impl OpKind {
    fn default_sem_type(&self) -> SemType {
        match self {
            OpKind::And
            | OpKind::Or
            | OpKind::Not
            | OpKind::In
            | OpKind::IsNull
            | OpKind::Eq
            | OpKind::Cmp(_) => SemType::Boolean,
            OpKind::Constant(v) => match v {
                Value::Bool(_) => SemType::Boolean,
                Value::Number(_) => SemType::Number,
                Value::String(_) => SemType::String,
                _ => SemType::Object,
            },
            OpKind::PropName(_) => SemType::String,
            OpKind::Filter
            | OpKind::Join
            | OpKind::Union
            | OpKind::Except
            | OpKind::JoinCond(_) => SemType::Tupleset,
            _ => SemType::Object,
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            OpKind::And => "And",
            OpKind::Or => "Or",
            OpKind::Not => "Not",
            OpKind::In => "In",
            OpKind::IsNull => "IsNull",
            OpKind::Eq => "Eq",
            OpKind::Cmp(_) => "Cmp",
            OpKind::Constant(_) => "Constant",
            OpKind::PropName(_) => "PropName",
            OpKind::Label(_) => "Label",
            OpKind::BindVar(_) => "BindVar",
            OpKind::FuncCall(_) => "FuncCall",
            OpKind::Project(_) => "Project",
            OpKind::Filter => "Filter",
            OpKind::Join => "Join",
            OpKind::Union => "Union",
            OpKind::Except => "Except",
            OpKind::JoinCond(_) => "JoinCond",
            OpKind::ConstructSubject(_) => "ConstructSubject",
            OpKind::ConstructProp(_) => "ConstructProp",
            OpKind::Construct(_) => "Construct",
            OpKind::GroupBy => "GroupBy",
            OpKind::OrderBy => "OrderBy",
            OpKind::SortExp { .. } => "SortExp",
            OpKind::Select(_) => "Select",
        }
    }

    /// Join, Union or Except
    pub fn is_resource_set(&self) -> bool {
        matches!(self, OpKind::Join | OpKind::Union | OpKind::Except)
    }
}

/// One node of the arena
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: OpKind,
    pub children: Vec<OpId>,
    pub parent: Option<OpId>,
    /// Labels bound at this node: name to triple position (filters only)
    pub labels: Vec<(String, TriplePos)>,
    pub maybe: bool,
    /// The join label of a Join/Union/Except node
    pub join_label: Option<String>,
    pub sem_type: SemType,
}

/// The AST arena
#[derive(Debug, Clone, Default)]
pub struct Ast {
    nodes: Vec<Node>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node with no parent
    pub fn add(&mut self, kind: OpKind) -> OpId {
        let sem_type = kind.default_sem_type();
        self.add_typed(kind, sem_type)
    }

    /// Create a node with an explicit semantic type (function calls carry
    /// the registry's result type)
    pub fn add_typed(&mut self, kind: OpKind, sem_type: SemType) -> OpId {
        let id = OpId(self.nodes.len() as u32);
        self.nodes.push(Node {
            kind,
            children: Vec::new(),
            parent: None,
            labels: Vec::new(),
            maybe: false,
            join_label: None,
            sem_type,
        });
        id
    }

    pub fn node(&self, id: OpId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: OpId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn kind(&self, id: OpId) -> &OpKind {
        &self.nodes[id.index()].kind
    }

    pub fn parent(&self, id: OpId) -> Option<OpId> {
        self.nodes[id.index()].parent
    }

    pub fn children(&self, id: OpId) -> Vec<OpId> {
        self.nodes[id.index()].children.clone()
    }

    /// Append `child` under `parent`, relinking from any previous parent.
    /// Rejects an edge that would make `child` its own ancestor.
    pub fn link(&mut self, parent: OpId, child: OpId) -> Result<()> {
        self.check_cycle(parent, child)?;
        self.unlink(child);
        self.nodes[parent.index()].children.push(child);
        self.nodes[child.index()].parent = Some(parent);
        Ok(())
    }

    fn check_cycle(&self, parent: OpId, child: OpId) -> Result<()> {
        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            if id == child {
                return Err(Error::Compile(format!(
                    "linking {child} under {parent} would create a cycle"
                )));
            }
            cursor = self.nodes[id.index()].parent;
        }
        Ok(())
    }

    /// Detach `child` from its parent, if any
    pub fn unlink(&mut self, child: OpId) {
        if let Some(old) = self.nodes[child.index()].parent {
            self.nodes[old.index()].children.retain(|c| *c != child);
            self.nodes[child.index()].parent = None;
        }
    }

    /// Detach a node; when the parent is a join condition the condition is
    /// removed from its join too, so no dangling conditions remain
    pub fn detach(&mut self, id: OpId) {
        if let Some(parent) = self.nodes[id.index()].parent {
            if matches!(self.kind(parent), OpKind::JoinCond(_)) {
                self.unlink(id);
                self.detach(parent);
                return;
            }
        }
        self.unlink(id);
    }

    /// Replace `old` with `new` at the same child position
    pub fn replace_child(&mut self, parent: OpId, old: OpId, new: OpId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        self.check_cycle(parent, new)?;
        let Some(at) = self.nodes[parent.index()]
            .children
            .iter()
            .position(|c| *c == old)
        else {
            return Err(Error::Compile(format!(
                "replace failed: {old} is not a child of {parent}"
            )));
        };
        self.unlink(new);
        self.nodes[parent.index()].children[at] = new;
        self.nodes[new.index()].parent = Some(parent);
        self.nodes[old.index()].parent = None;
        Ok(())
    }

    /// Pre-order traversal of the subtree at `root`
    pub fn descendants(&self, root: OpId) -> Vec<OpId> {
        self.descendants_until(root, |_, _| true)
    }

    /// Pre-order traversal; children of a node are visited only when
    /// `descend` returns true for it (the root is always visited)
    pub fn descendants_until<F>(&self, root: OpId, descend: F) -> Vec<OpId>
    where
        F: Fn(&Ast, OpId) -> bool,
    {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            if id == root || descend(self, id) {
                for child in self.nodes[id.index()].children.iter().rev() {
                    stack.push(*child);
                }
            }
        }
        out
    }

    /// Level-order traversal of the subtree at `root`
    pub fn breadth_first(&self, root: OpId) -> Vec<OpId> {
        let mut out = vec![root];
        let mut i = 0;
        while i < out.len() {
            out.extend(self.nodes[out[i].index()].children.iter().copied());
            i += 1;
        }
        out
    }

    pub fn is_descendant_of(&self, id: OpId, ancestor: OpId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.nodes[current.index()].parent;
        }
        false
    }

    /// Deep-copy a subtree; the copy has no parent
    pub fn clone_subtree(&mut self, id: OpId) -> OpId {
        let node = self.nodes[id.index()].clone();
        let copy = self.add_typed(node.kind, node.sem_type);
        self.nodes[copy.index()].labels = node.labels;
        self.nodes[copy.index()].maybe = node.maybe;
        self.nodes[copy.index()].join_label = node.join_label;
        for child in node.children {
            let child_copy = self.clone_subtree(child);
            self.nodes[copy.index()].children.push(child_copy);
            self.nodes[child_copy.index()].parent = Some(copy);
        }
        copy
    }

    /// Bind a label to a triple position on a filter
    pub fn add_label(&mut self, filter: OpId, label: &str, pos: TriplePos) -> Result<()> {
        let node = &mut self.nodes[filter.index()];
        for (name, p) in &node.labels {
            if name == label {
                if *p == pos {
                    return Ok(());
                }
                return Err(Error::Compile(format!(
                    "label '{label}' already used on a different position"
                )));
            }
        }
        node.labels.push((label.to_string(), pos));
        Ok(())
    }

    /// Bind a label on a relational node: the first filter underneath
    /// (level order) carries it
    pub fn add_label_to_join(&mut self, id: OpId, label: &str, pos: TriplePos) -> Result<bool> {
        if matches!(self.kind(id), OpKind::Filter) {
            self.add_label(id, label, pos)?;
            return Ok(true);
        }
        for candidate in self.breadth_first(id) {
            if matches!(self.kind(candidate), OpKind::Filter) {
                self.add_label(candidate, label, pos)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn join_label(&self, id: OpId) -> Option<&str> {
        self.nodes[id.index()].join_label.as_deref()
    }

    pub fn set_join_label(&mut self, id: OpId, label: &str) {
        self.nodes[id.index()].join_label = Some(label.to_string());
    }

    // ---- select / construct accessors ----

    fn child_where<F: Fn(&OpKind) -> bool>(&self, id: OpId, pred: F) -> Option<OpId> {
        self.nodes[id.index()]
            .children
            .iter()
            .copied()
            .find(|c| pred(self.kind(*c)))
    }

    pub fn select_construct(&self, select: OpId) -> Option<OpId> {
        self.child_where(select, |k| matches!(k, OpKind::Construct(_)))
    }

    pub fn select_where(&self, select: OpId) -> Option<OpId> {
        self.child_where(select, |k| k.is_resource_set())
    }

    pub fn select_group_by(&self, select: OpId) -> Option<OpId> {
        self.child_where(select, |k| matches!(k, OpKind::GroupBy))
    }

    pub fn select_order_by(&self, select: OpId) -> Option<OpId> {
        self.child_where(select, |k| matches!(k, OpKind::OrderBy))
    }

    pub fn construct_subject(&self, construct: OpId) -> Option<OpId> {
        self.child_where(construct, |k| matches!(k, OpKind::ConstructSubject(_)))
    }

    /// The label a construct binds its subject to, if any
    pub fn subject_label(&self, construct: OpId) -> Option<String> {
        let subject = self.construct_subject(construct)?;
        let child = self.nodes[subject.index()].children.first()?;
        match self.kind(*child) {
            OpKind::Label(name) => Some(name.clone()),
            _ => None,
        }
    }

    /// The single property name a group-by keys on
    pub fn group_by_name(&self, group_by: OpId) -> Option<String> {
        let child = self.nodes[group_by.index()].children.first()?;
        match self.kind(*child) {
            OpKind::Label(name) => Some(name.clone()),
            OpKind::Project(p) => p.simple_name().map(str::to_string),
            _ => None,
        }
    }

    /// An expression is independent when its value does not depend on the
    /// current row
    pub fn is_independent(&self, id: OpId) -> bool {
        match self.kind(id) {
            OpKind::Label(_) | OpKind::Project(_) => false,
            OpKind::FuncCall(info) if !info.independent => false,
            _ => self.nodes[id.index()]
                .children
                .iter()
                .all(|c| self.is_independent(*c)),
        }
    }

    /// Structural validation: parent backlinks are consistent and every
    /// child of a relational operator is a join condition
    pub fn validate(&self, root: OpId) -> Result<()> {
        for id in self.descendants(root) {
            let node = &self.nodes[id.index()];
            for child in &node.children {
                if self.nodes[child.index()].parent != Some(id) {
                    return Err(Error::Compile(format!(
                        "bad ast: {child} has a stale parent link"
                    )));
                }
            }
            if node.kind.is_resource_set() {
                for child in &node.children {
                    if !matches!(self.kind(*child), OpKind::JoinCond(_)) {
                        return Err(Error::Compile(format!(
                            "bad ast: child of {} is not a join condition",
                            node.kind.variant_name()
                        )));
                    }
                }
            }
            if let OpKind::JoinCond(_) = node.kind {
                if node.children.len() != 1 {
                    return Err(Error::Compile(
                        "bad ast: join condition must wrap exactly one child".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Human-readable plan dump, one node per line
    pub fn explain(&self, root: OpId) -> String {
        let mut out = String::new();
        self.explain_node(root, 0, &mut out);
        out
    }

    fn explain_node(&self, id: OpId, depth: usize, out: &mut String) {
        let node = &self.nodes[id.index()];
        for _ in 0..depth {
            out.push_str("  ");
        }
        out.push_str(node.kind.variant_name());
        match &node.kind {
            OpKind::Constant(v) => {
                let _ = write!(out, " {}", v.to_json());
            }
            OpKind::PropName(n) | OpKind::Label(n) | OpKind::BindVar(n) => {
                let _ = write!(out, " '{n}'");
            }
            OpKind::FuncCall(info) => {
                let _ = write!(out, " {}", info.name);
            }
            OpKind::Cmp(op) => {
                let _ = write!(out, " {}", op.symbol());
            }
            OpKind::Project(p) => {
                let path: Vec<String> = p
                    .path
                    .iter()
                    .map(|step| match step {
                        PathStep::Pos(TriplePos::Subject) => "#subject".to_string(),
                        PathStep::Pos(TriplePos::Predicate) => "#predicate".to_string(),
                        PathStep::Pos(TriplePos::Object) => "#object".to_string(),
                        PathStep::Name(n) => n.clone(),
                        PathStep::Star => "*".to_string(),
                    })
                    .collect();
                let _ = write!(out, " {}", path.join("."));
                if let Some(var) = &p.varref {
                    let _ = write!(out, " ?{var}");
                }
            }
            OpKind::JoinCond(info) => {
                let _ = write!(out, " key='{}' kind={}", info.key, info.kind.symbol());
            }
            OpKind::ConstructSubject(name) => {
                let _ = write!(out, " '{name}'");
            }
            OpKind::ConstructProp(info) => {
                if let Some(name) = &info.name {
                    let _ = write!(out, " '{name}'");
                }
            }
            OpKind::Construct(shape) => {
                let _ = write!(out, " {shape:?}");
            }
            OpKind::SortExp { descending } => {
                if *descending {
                    out.push_str(" desc");
                }
            }
            _ => {}
        }
        if let Some(label) = &node.join_label {
            let _ = write!(out, " name='{label}'");
        }
        if !node.labels.is_empty() {
            let labels: Vec<String> = node
                .labels
                .iter()
                .map(|(name, pos)| format!("{name}@{pos:?}"))
                .collect();
            let _ = write!(out, " labels=[{}]", labels.join(", "));
        }
        if node.maybe {
            out.push_str(" maybe");
        }
        out.push('\n');
        for child in &node.children {
            self.explain_node(*child, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_and_traverse() {
        let mut ast = Ast::new();
        let join = ast.add(OpKind::Join);
        let jc = ast.add(OpKind::JoinCond(JoinCondInfo {
            key: "#0".to_string(),
            kind: JoinKind::Inner,
        }));
        let filter = ast.add(OpKind::Filter);
        ast.link(join, jc).expect("link");
        ast.link(jc, filter).expect("link");

        assert_eq!(ast.children(join), vec![jc]);
        assert_eq!(ast.parent(filter), Some(jc));
        assert_eq!(ast.descendants(join), vec![join, jc, filter]);
        assert!(ast.is_descendant_of(filter, join));
        ast.validate(join).expect("valid");
    }

    #[test]
    fn test_cycle_rejected() {
        let mut ast = Ast::new();
        let a = ast.add(OpKind::And);
        let b = ast.add(OpKind::Or);
        ast.link(a, b).expect("link");
        let err = ast.link(b, a).expect_err("cycle must be rejected");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_relink_moves_child() {
        let mut ast = Ast::new();
        let a = ast.add(OpKind::And);
        let b = ast.add(OpKind::Or);
        let c = ast.add(OpKind::Constant(Value::Bool(true)));
        ast.link(a, c).expect("link");
        ast.link(b, c).expect("relink");
        assert!(ast.children(a).is_empty());
        assert_eq!(ast.children(b), vec![c]);
    }

    #[test]
    fn test_replace_child_keeps_position() {
        let mut ast = Ast::new();
        let and = ast.add(OpKind::And);
        let first = ast.add(OpKind::Constant(Value::Bool(true)));
        let second = ast.add(OpKind::Constant(Value::Bool(false)));
        let replacement = ast.add(OpKind::Constant(Value::Number(1.0)));
        ast.link(and, first).expect("link");
        ast.link(and, second).expect("link");

        ast.replace_child(and, first, replacement).expect("replace");
        assert_eq!(ast.children(and), vec![replacement, second]);
        assert_eq!(ast.parent(first), None);
    }

    #[test]
    fn test_detach_cascades_join_condition() {
        let mut ast = Ast::new();
        let join = ast.add(OpKind::Join);
        let jc = ast.add(OpKind::JoinCond(JoinCondInfo {
            key: "#0".to_string(),
            kind: JoinKind::Inner,
        }));
        let filter = ast.add(OpKind::Filter);
        ast.link(join, jc).expect("link");
        ast.link(jc, filter).expect("link");

        ast.detach(filter);
        // no dangling condition left under the join
        assert!(ast.children(join).is_empty());
    }

    #[test]
    fn test_join_children_must_be_conditions() {
        let mut ast = Ast::new();
        let join = ast.add(OpKind::Join);
        let filter = ast.add(OpKind::Filter);
        ast.link(join, filter).expect("link");
        assert!(ast.validate(join).is_err());
    }

    #[test]
    fn test_label_position_conflict() {
        let mut ast = Ast::new();
        let filter = ast.add(OpKind::Filter);
        ast.add_label(filter, "x", TriplePos::Object).expect("add");
        ast.add_label(filter, "x", TriplePos::Object).expect("idempotent");
        assert!(ast.add_label(filter, "x", TriplePos::Subject).is_err());
    }

    #[test]
    fn test_independence() {
        let mut ast = Ast::new();
        let constant = ast.add(OpKind::Constant(Value::Number(1.0)));
        assert!(ast.is_independent(constant));

        let project = ast.add(OpKind::Project(Projection {
            path: vec![PathStep::Name("foo".to_string())],
            varref: None,
            construct_refs: None,
        }));
        assert!(!ast.is_independent(project));

        let eq = ast.add(OpKind::Eq);
        ast.link(eq, project).expect("link");
        assert!(!ast.is_independent(eq));
    }

    #[test]
    fn test_clone_subtree() {
        let mut ast = Ast::new();
        let eq = ast.add(OpKind::Eq);
        let lhs = ast.add(OpKind::PropName("foo".to_string()));
        let rhs = ast.add(OpKind::Constant(Value::Number(1.0)));
        ast.link(eq, lhs).expect("link");
        ast.link(eq, rhs).expect("link");

        let copy = ast.clone_subtree(eq);
        assert_ne!(copy, eq);
        assert_eq!(ast.parent(copy), None);
        assert_eq!(ast.children(copy).len(), 2);
        assert_eq!(ast.kind(copy), &OpKind::Eq);
    }
}
