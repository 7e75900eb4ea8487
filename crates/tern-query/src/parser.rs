//! Query parser
//!
//! Hand-written recursive descent with a precedence-table expression
//! parser; reduction actions build arena nodes directly, there is no
//! intermediate parse tree. Every call constructs its own parser and
//! rewrite state, so concurrent compiles never share anything.
//!
//! Precedence, loosest first: or, and, maybe, not, in, comparisons,
//! additive, multiplicative, unary.

use crate::ast::{
    Ast, OpId, OpKind, PathStep, PropInfo, Projection, SelectInfo, Shape,
};
use crate::ast::{CmpOp, EmptyShape, SingleShape};
use crate::functions::FunctionRegistry;
use crate::lexer::{line_col, tokenize, Spanned, Tok};
use crate::rewrite::{resolve_names, ParseState};
use tern_core::{Error, NameMap, Result, TriplePos, Value};
use tracing::debug;

/// Parse a query, returning the compiled tree and diagnostics. A syntax or
/// compile problem yields no tree; the diagnostics tell why.
pub fn parse(
    query: &str,
    functions: &FunctionRegistry,
    namemap: Option<&NameMap>,
) -> (Option<(Ast, OpId)>, Vec<String>) {
    let (tokens, mut diagnostics) = tokenize(query);
    let mut parser = Parser {
        input: query,
        tokens,
        pos: 0,
        ast: Ast::new(),
        state: ParseState::new(functions),
    };
    match parser.parse_root(namemap) {
        Ok(root) => {
            debug!(nodes = %root, "query compiled");
            (Some((parser.ast, root)), diagnostics)
        }
        Err(e) => {
            diagnostics.push(e.to_string());
            (None, diagnostics)
        }
    }
}

/// How a property value was written: plain, or wrapped in `[...]`
struct ValueSpec {
    node: OpId,
    forcelist: bool,
}

/// The name side of a construct property
enum PropName {
    None,
    Text(String),
    Expr(OpId),
}

#[derive(Default)]
struct Criteria {
    where_expr: Option<OpId>,
    group_by: Option<OpId>,
    order_by: Option<OpId>,
    limit: Option<usize>,
    offset: Option<usize>,
    depth: Option<u32>,
    mergeall: bool,
    namemap: Option<NameMap>,
}

struct Parser<'a, 'f> {
    input: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    ast: Ast,
    state: ParseState<'f>,
}

impl<'a, 'f> Parser<'a, 'f> {
    // ---- token plumbing ----

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, n: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + n).map(|(t, _)| t)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<()> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(self.err_here(&format!("expected {what}")))
        }
    }

    fn err_here(&self, message: &str) -> Error {
        let (line, col, found) = match self.tokens.get(self.pos) {
            Some((tok, span)) => {
                let (line, col) = line_col(self.input, span.start);
                (line, col, format!("'{}'", &self.input[span.clone()]))
            }
            None => {
                let (line, col) = line_col(self.input, self.input.len());
                (line, col, "end of query".to_string())
            }
        };
        Error::Syntax(format!("{message} at {found} (line {line} char {col})"))
    }

    // ---- entry ----

    fn parse_root(&mut self, namemap: Option<&NameMap>) -> Result<OpId> {
        let root = self.parse_top()?;
        if self.pos < self.tokens.len() {
            return Err(self.err_here("unexpected trailing input"));
        }
        let base = namemap.cloned().unwrap_or_default();
        resolve_names(&mut self.ast, root, &base);
        self.state.build_joins(&mut self.ast, root)?;

        // a top-level query without a filter skips embedded resources that
        // already appear inside other results
        let where_empty = match self.ast.select_where(root) {
            None => true,
            Some(w) => self.ast.children(w).is_empty(),
        };
        if where_empty {
            if let OpKind::Select(info) = &mut self.ast.node_mut(root).kind {
                info.skip_anonymous = true;
            }
        }
        Ok(root)
    }

    fn parse_top(&mut self) -> Result<OpId> {
        match self.peek() {
            Some(Tok::LBrace) => self.parse_dict_construct(),
            Some(Tok::LBracket) => {
                self.bump();
                self.parse_list_construct(None)
            }
            Some(Tok::LParen) => self.parse_value_construct(),
            _ => Err(self.err_here("expected a query construct: {...}, [...] or (...)")),
        }
    }

    // ---- constructs ----

    fn parse_dict_construct(&mut self) -> Result<OpId> {
        self.expect(Tok::LBrace, "'{'")?;
        let label = self.take_label();
        let (props, criteria) = self.parse_body(Tok::RBrace, true)?;
        self.expect(Tok::RBrace, "'}'")?;
        self.finish_select(Shape::Object, label, props, criteria)
    }

    /// Called with the opening bracket consumed; `first` carries an already
    /// parsed first item expression when backtracking from a force-list
    fn parse_list_construct(&mut self, first: Option<OpId>) -> Result<OpId> {
        let label = if first.is_none() { self.take_label() } else { None };
        let mut props = Vec::new();
        if let Some(first) = first {
            props.push(self.make_prop(
                PropName::None,
                ValueSpec {
                    node: first,
                    forcelist: false,
                },
                false,
                false,
            )?);
            self.eat(&Tok::Comma);
        }
        let (more, criteria) = self.parse_body(Tok::RBracket, false)?;
        props.extend(more);
        self.expect(Tok::RBracket, "']'")?;
        self.finish_select(Shape::Array, label, props, criteria)
    }

    fn parse_value_construct(&mut self) -> Result<OpId> {
        self.expect(Tok::LParen, "'('")?;
        let expr = self.parse_expression(0)?;
        let prop = self.make_prop(
            PropName::None,
            ValueSpec {
                node: expr,
                forcelist: false,
            },
            false,
            false,
        )?;
        self.eat(&Tok::Comma);
        let mut criteria = Criteria::default();
        while let Some(tok) = self.peek() {
            if *tok == Tok::RParen {
                break;
            }
            if !is_op_start(tok) {
                return Err(self.err_here("expected a query criteria clause or ')'"));
            }
            self.parse_construct_op(&mut criteria)?;
            self.eat(&Tok::Comma);
        }
        self.expect(Tok::RParen, "')'")?;
        self.finish_select(Shape::Scalar, None, vec![prop], criteria)
    }

    fn take_label(&mut self) -> Option<String> {
        if let Some(Tok::QLabel(_)) = self.peek() {
            let Some(Tok::QLabel(name)) = self.bump() else {
                unreachable!("peeked a label");
            };
            self.eat(&Tok::Comma);
            Some(name)
        } else {
            None
        }
    }

    fn parse_body(&mut self, end: Tok, dict: bool) -> Result<(Vec<OpId>, Criteria)> {
        let mut props = Vec::new();
        let mut criteria = Criteria::default();
        loop {
            match self.peek() {
                None => break,
                Some(tok) if *tok == end => break,
                Some(tok) if is_op_start(tok) => {
                    self.parse_construct_op(&mut criteria)?;
                    self.eat(&Tok::Comma);
                }
                Some(_) => {
                    let item = if dict {
                        self.parse_dict_item()?
                    } else {
                        self.parse_list_item()?
                    };
                    props.push(item);
                    self.eat(&Tok::Comma);
                }
            }
        }
        Ok((props, criteria))
    }

    fn parse_construct_op(&mut self, criteria: &mut Criteria) -> Result<()> {
        match self.bump() {
            Some(Tok::Where) => {
                criteria.where_expr = Some(self.parse_expression(0)?);
            }
            Some(Tok::Group) => {
                self.expect(Tok::By, "'by' after 'group'")?;
                criteria.group_by = Some(self.parse_group_key()?);
            }
            Some(Tok::Groupby) => {
                self.expect(Tok::LParen, "'(' after 'groupby'")?;
                criteria.group_by = Some(self.parse_group_key()?);
                self.expect(Tok::RParen, "')'")?;
            }
            Some(Tok::Order) => {
                self.expect(Tok::By, "'by' after 'order'")?;
                criteria.order_by = Some(self.parse_sort_list()?);
            }
            Some(Tok::Orderby) => {
                self.expect(Tok::LParen, "'(' after 'orderby'")?;
                criteria.order_by = Some(self.parse_sort_list()?);
                self.expect(Tok::RParen, "')'")?;
            }
            Some(Tok::Limit) => criteria.limit = Some(self.parse_count("limit")?),
            Some(Tok::Offset) => criteria.offset = Some(self.parse_count("offset")?),
            Some(Tok::Depth) => criteria.depth = Some(self.parse_count("depth")? as u32),
            Some(Tok::Mergeall) => criteria.mergeall = true,
            Some(Tok::Namemap) => {
                self.expect(Tok::Eq, "'=' after 'namemap'")?;
                criteria.namemap = Some(self.parse_json_dict()?);
            }
            _ => return Err(self.err_here("expected a query criteria clause")),
        }
        Ok(())
    }

    fn parse_count(&mut self, what: &str) -> Result<usize> {
        match self.bump() {
            Some(Tok::Int(n)) if n >= 0 => Ok(n as usize),
            _ => Err(self.err_here(&format!("expected a non-negative integer after '{what}'"))),
        }
    }

    fn parse_group_key(&mut self) -> Result<OpId> {
        let key = self.parse_expression(0)?;
        if !matches!(self.ast.kind(key), OpKind::Project(_) | OpKind::Label(_)) {
            return Err(Error::Compile("bad group by expression".to_string()));
        }
        // extra group keys are accepted but only the first one groups
        while self.peek() == Some(&Tok::Comma) && !self.next_starts_op(1) {
            self.bump();
            let _ = self.parse_expression(0)?;
        }
        let group_by = self.ast.add(OpKind::GroupBy);
        self.ast.link(group_by, key)?;
        Ok(group_by)
    }

    fn parse_sort_list(&mut self) -> Result<OpId> {
        let order_by = self.ast.add(OpKind::OrderBy);
        loop {
            let expr = self.parse_expression(0)?;
            let descending = if self.eat(&Tok::Desc) {
                true
            } else {
                self.eat(&Tok::Asc);
                false
            };
            let sort = self.ast.add(OpKind::SortExp { descending });
            self.ast.link(sort, expr)?;
            self.ast.link(order_by, sort)?;
            if self.peek() == Some(&Tok::Comma) && !self.next_starts_op(1) {
                self.bump();
            } else {
                break;
            }
        }
        Ok(order_by)
    }

    fn next_starts_op(&self, ahead: usize) -> bool {
        self.peek_at(ahead).is_some_and(is_op_start)
    }

    fn parse_json_dict(&mut self) -> Result<NameMap> {
        self.expect(Tok::LBrace, "'{'")?;
        let mut namemap = NameMap::new();
        while self.peek() != Some(&Tok::RBrace) {
            let key = match self.bump() {
                Some(Tok::Str(s)) | Some(Tok::Name(s)) => s,
                _ => return Err(self.err_here("expected a namemap key")),
            };
            self.expect(Tok::Colon, "':'")?;
            match self.peek() {
                Some(Tok::LBrace) => {
                    // nested maps configure the serializer, not the engine
                    let _ = self.parse_json_dict()?;
                }
                _ => match self.bump() {
                    Some(Tok::Str(replacement)) => namemap.insert(key, replacement),
                    _ => return Err(self.err_here("expected a namemap value")),
                },
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(Tok::RBrace, "'}'")?;
        Ok(namemap)
    }

    // ---- construct items ----

    fn parse_dict_item(&mut self) -> Result<OpId> {
        match self.peek() {
            Some(Tok::Omitnull) => {
                self.bump();
                let expr = self.parse_expression(0)?;
                if self.eat(&Tok::Colon) {
                    let value = self.parse_dict_value()?;
                    self.make_prop(PropName::Expr(expr), value, false, true)
                } else {
                    let name = self.bare_name_of(expr)?;
                    self.make_prop(
                        PropName::Text(name),
                        ValueSpec {
                            node: expr,
                            forcelist: false,
                        },
                        true,
                        true,
                    )
                }
            }
            Some(Tok::Maybe) => {
                self.bump();
                let name = self.parse_bare_columnref()?;
                let node = self.add_project_name(&name);
                self.ast.node_mut(node).maybe = true;
                self.make_prop(
                    PropName::Text(name),
                    ValueSpec {
                        node,
                        forcelist: false,
                    },
                    true,
                    false,
                )
            }
            Some(Tok::LBracket) => {
                self.bump();
                let (omit, maybe) = match self.peek() {
                    Some(Tok::Omitnull) => {
                        self.bump();
                        (true, false)
                    }
                    Some(Tok::Maybe) => {
                        self.bump();
                        (false, true)
                    }
                    _ => (false, false),
                };
                let name = self.parse_bare_columnref()?;
                self.expect(Tok::RBracket, "']'")?;
                let node = self.add_project_name(&name);
                if maybe {
                    self.ast.node_mut(node).maybe = true;
                }
                self.make_prop(
                    PropName::Text(name),
                    ValueSpec {
                        node,
                        forcelist: true,
                    },
                    true,
                    omit,
                )
            }
            // bare `id` outputs the subject under the key "id"
            Some(Tok::Id) if self.peek_at(1) != Some(&Tok::Colon) => {
                self.bump();
                let node = self.add_project_subject();
                self.make_prop(
                    PropName::Text("id".to_string()),
                    ValueSpec {
                        node,
                        forcelist: false,
                    },
                    true,
                    false,
                )
            }
            _ => {
                let expr = self.parse_expression(0)?;
                if self.eat(&Tok::Colon) {
                    let value = self.parse_dict_value()?;
                    self.make_prop(PropName::Expr(expr), value, false, false)
                } else {
                    let name = self.bare_name_of(expr)?;
                    let name_is_filter = name != "*";
                    self.make_prop(
                        PropName::Text(name),
                        ValueSpec {
                            node: expr,
                            forcelist: false,
                        },
                        name_is_filter,
                        false,
                    )
                }
            }
        }
    }

    fn parse_list_item(&mut self) -> Result<OpId> {
        let expr = self.parse_expression(0)?;
        self.make_prop(
            PropName::None,
            ValueSpec {
                node: expr,
                forcelist: false,
            },
            false,
            false,
        )
    }

    fn parse_dict_value(&mut self) -> Result<ValueSpec> {
        match self.peek() {
            Some(Tok::LBrace) => {
                let node = self.parse_dict_construct()?;
                Ok(ValueSpec {
                    node,
                    forcelist: false,
                })
            }
            Some(Tok::LBracket) => {
                self.bump();
                match self.peek() {
                    Some(Tok::LBrace) => {
                        let node = self.parse_dict_construct()?;
                        self.expect(Tok::RBracket, "']'")?;
                        Ok(ValueSpec {
                            node,
                            forcelist: true,
                        })
                    }
                    Some(Tok::LBracket) => {
                        self.bump();
                        let node = self.parse_list_construct(None)?;
                        self.expect(Tok::RBracket, "']'")?;
                        Ok(ValueSpec {
                            node,
                            forcelist: true,
                        })
                    }
                    Some(Tok::RBracket) => {
                        // an empty list construct
                        self.bump();
                        let node =
                            self.finish_select(Shape::Array, None, Vec::new(), Criteria::default())?;
                        Ok(ValueSpec {
                            node,
                            forcelist: false,
                        })
                    }
                    _ => {
                        let expr = self.parse_expression(0)?;
                        if self.eat(&Tok::RBracket) {
                            Ok(ValueSpec {
                                node: expr,
                                forcelist: true,
                            })
                        } else {
                            // more items follow: this is a list construct
                            let node = self.parse_list_construct(Some(expr))?;
                            Ok(ValueSpec {
                                node,
                                forcelist: false,
                            })
                        }
                    }
                }
            }
            _ => {
                let node = self.parse_expression(0)?;
                Ok(ValueSpec {
                    node,
                    forcelist: false,
                })
            }
        }
    }

    fn bare_name_of(&self, expr: OpId) -> Result<String> {
        match self.ast.kind(expr) {
            OpKind::Project(p) if p.path.len() == 1 => match &p.path[0] {
                PathStep::Name(name) => Ok(name.clone()),
                PathStep::Star => Ok("*".to_string()),
                PathStep::Pos(_) => Err(self.err_here("expected ':' after expression")),
            },
            _ => Err(self.err_here("expected ':' after expression")),
        }
    }

    fn parse_bare_columnref(&mut self) -> Result<String> {
        match self.bump() {
            Some(Tok::Name(name)) | Some(Tok::PropString(name)) => Ok(name),
            Some(Tok::Star) => Ok("*".to_string()),
            _ => Err(self.err_here("expected a property name")),
        }
    }

    fn add_project_name(&mut self, name: &str) -> OpId {
        let path = if name == "*" {
            vec![PathStep::Star]
        } else {
            vec![PathStep::Name(name.to_string())]
        };
        self.ast.add(OpKind::Project(Projection {
            path,
            varref: None,
            construct_refs: None,
        }))
    }

    fn add_project_subject(&mut self) -> OpId {
        self.ast.add(OpKind::Project(Projection {
            path: vec![PathStep::Pos(TriplePos::Subject)],
            varref: None,
            construct_refs: None,
        }))
    }

    fn make_prop(
        &mut self,
        name: PropName,
        value: ValueSpec,
        name_is_filter: bool,
        omit: bool,
    ) -> Result<OpId> {
        let mut name_is_filter = name_is_filter;
        let (plain, name_expr) = match name {
            PropName::None => (None, None),
            PropName::Text(t) if t == "*" => {
                name_is_filter = false;
                (None, None)
            }
            PropName::Text(t) => (Some(t), None),
            PropName::Expr(e) => match self.ast.kind(e) {
                OpKind::Constant(Value::String(s)) => (Some(s.clone()), None),
                _ => (None, Some(e)),
            },
        };
        let if_empty = if omit {
            EmptyShape::Omit
        } else if value.forcelist {
            EmptyShape::UseList
        } else {
            EmptyShape::UseNull
        };
        let if_single = if value.forcelist {
            SingleShape::UseList
        } else {
            SingleShape::NoList
        };

        // a standalone projection value expands reference values to objects
        if let OpKind::Project(p) = &mut self.ast.node_mut(value.node).kind {
            if p.construct_refs.is_none() && p.path != [PathStep::Pos(TriplePos::Subject)] {
                p.construct_refs = Some(true);
            }
        }

        let prop = self.ast.add(OpKind::ConstructProp(PropInfo {
            name: plain,
            if_empty,
            if_single,
            name_is_filter,
            has_name_expr: name_expr.is_some(),
            has_agg: false,
            projects: Vec::new(),
        }));
        self.ast.link(prop, value.node)?;
        if let Some(name_expr) = name_expr {
            self.ast.link(prop, name_expr)?;
        }
        Ok(prop)
    }

    fn finish_select(
        &mut self,
        shape: Shape,
        label: Option<String>,
        props: Vec<OpId>,
        criteria: Criteria,
    ) -> Result<OpId> {
        let construct = self.ast.add(OpKind::Construct(shape));
        for prop in props {
            self.ast.link(construct, prop)?;
        }
        let subject = self.ast.add(OpKind::ConstructSubject("id".to_string()));
        self.ast.link(construct, subject)?;
        if let Some(label) = label {
            let node = self.ast.add(OpKind::Label(label));
            self.ast.link(subject, node)?;
        }

        let join = self.state.join_from_construct(
            &mut self.ast,
            construct,
            criteria.where_expr,
            criteria.group_by,
            criteria.order_by,
        )?;

        let select = self.ast.add(OpKind::Select(SelectInfo {
            limit: criteria.limit,
            offset: criteria.offset,
            depth: criteria.depth,
            mergeall: criteria.mergeall,
            namemap: criteria.namemap,
            skip_anonymous: false,
        }));
        self.ast.link(select, construct)?;
        self.ast.link(select, join)?;
        if let Some(group_by) = criteria.group_by {
            self.ast.link(select, group_by)?;
        }
        if let Some(order_by) = criteria.order_by {
            self.ast.link(select, order_by)?;
        }
        Ok(select)
    }

    // ---- expressions ----

    fn parse_expression(&mut self, min_bp: u8) -> Result<OpId> {
        let mut lhs = self.parse_prefix()?;
        loop {
            let Some(tok) = self.peek() else { break };
            match tok {
                Tok::Or if 1 >= min_bp => {
                    self.bump();
                    let rhs = self.parse_expression(2)?;
                    lhs = self.binary(OpKind::Or, lhs, rhs)?;
                }
                Tok::And if 3 >= min_bp => {
                    self.bump();
                    let rhs = self.parse_expression(4)?;
                    lhs = self.binary(OpKind::And, lhs, rhs)?;
                }
                Tok::Not if 7 >= min_bp && self.peek_at(1) == Some(&Tok::In) => {
                    self.bump();
                    self.bump();
                    let in_op = self.parse_in_rhs(lhs)?;
                    let not = self.ast.add(OpKind::Not);
                    self.ast.link(not, in_op)?;
                    lhs = not;
                }
                Tok::In if 7 >= min_bp => {
                    self.bump();
                    lhs = self.parse_in_rhs(lhs)?;
                }
                Tok::Is if 9 >= min_bp => {
                    self.bump();
                    let negated = self.eat(&Tok::Not);
                    self.expect(Tok::Null, "'null' after 'is'")?;
                    let is_null = self.ast.add(OpKind::IsNull);
                    self.ast.link(is_null, lhs)?;
                    lhs = if negated {
                        let not = self.ast.add(OpKind::Not);
                        self.ast.link(not, is_null)?;
                        not
                    } else {
                        is_null
                    };
                }
                Tok::Eq | Tok::Ne | Tok::Lt | Tok::Le | Tok::Gt | Tok::Ge if 9 >= min_bp => {
                    let tok = self.bump().expect("peeked");
                    let rhs = self.parse_expression(10)?;
                    // comparisons are non-associative: a = b = c is an error
                    if matches!(
                        self.peek(),
                        Some(Tok::Eq | Tok::Ne | Tok::Lt | Tok::Le | Tok::Gt | Tok::Ge)
                    ) {
                        return Err(self.err_here("comparison operators do not chain"));
                    }
                    lhs = match tok {
                        Tok::Eq => self.binary(OpKind::Eq, lhs, rhs)?,
                        Tok::Ne => {
                            let eq = self.binary(OpKind::Eq, lhs, rhs)?;
                            let not = self.ast.add(OpKind::Not);
                            self.ast.link(not, eq)?;
                            not
                        }
                        Tok::Lt => self.binary(OpKind::Cmp(CmpOp::Lt), lhs, rhs)?,
                        Tok::Le => self.binary(OpKind::Cmp(CmpOp::Le), lhs, rhs)?,
                        Tok::Gt => self.binary(OpKind::Cmp(CmpOp::Gt), lhs, rhs)?,
                        Tok::Ge => self.binary(OpKind::Cmp(CmpOp::Ge), lhs, rhs)?,
                        _ => unreachable!("matched above"),
                    };
                }
                Tok::Plus | Tok::Minus if 11 >= min_bp => {
                    let name = if *tok == Tok::Plus { "add" } else { "sub" };
                    self.bump();
                    let rhs = self.parse_expression(12)?;
                    lhs = self.state.get_func_op(&mut self.ast, name, vec![lhs, rhs])?;
                }
                Tok::Star | Tok::Slash | Tok::Percent if 13 >= min_bp => {
                    let name = match tok {
                        Tok::Star => "mul",
                        Tok::Slash => "div",
                        _ => "mod",
                    };
                    self.bump();
                    let rhs = self.parse_expression(14)?;
                    lhs = self.state.get_func_op(&mut self.ast, name, vec![lhs, rhs])?;
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn binary(&mut self, kind: OpKind, lhs: OpId, rhs: OpId) -> Result<OpId> {
        let op = self.ast.add(kind);
        self.ast.link(op, lhs)?;
        self.ast.link(op, rhs)?;
        Ok(op)
    }

    fn parse_in_rhs(&mut self, lhs: OpId) -> Result<OpId> {
        let in_op = self.ast.add(OpKind::In);
        self.ast.link(in_op, lhs)?;
        if self.eat(&Tok::LParen) {
            loop {
                let arg = self.parse_expression(0)?;
                self.ast.link(in_op, arg)?;
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
            self.expect(Tok::RParen, "')'")?;
        } else {
            let rhs = self.parse_expression(8)?;
            self.ast.link(in_op, rhs)?;
        }
        Ok(in_op)
    }

    fn parse_prefix(&mut self) -> Result<OpId> {
        match self.peek() {
            Some(Tok::Minus) => {
                self.bump();
                let operand = self.parse_expression(15)?;
                self.state.get_func_op(&mut self.ast, "negate", vec![operand])
            }
            Some(Tok::Plus) => {
                self.bump();
                self.parse_expression(15)
            }
            Some(Tok::Not) => {
                self.bump();
                let operand = self.parse_expression(6)?;
                let not = self.ast.add(OpKind::Not);
                self.ast.link(not, operand)?;
                Ok(not)
            }
            Some(Tok::Maybe) => {
                self.bump();
                let operand = self.parse_expression(5)?;
                self.ast.node_mut(operand).maybe = true;
                Ok(operand)
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<OpId> {
        match self.bump() {
            Some(Tok::Int(n)) => Ok(self.ast.add(OpKind::Constant(Value::Number(n as f64)))),
            Some(Tok::Float(f)) => Ok(self.ast.add(OpKind::Constant(Value::Number(f)))),
            Some(Tok::Str(s)) => Ok(self.ast.add(OpKind::Constant(Value::String(s)))),
            // true/false double as zero-argument predicate functions
            Some(Tok::True) => {
                if self.peek() == Some(&Tok::LParen) {
                    self.parse_funccall("true")
                } else {
                    Ok(self.ast.add(OpKind::Constant(Value::Bool(true))))
                }
            }
            Some(Tok::False) => {
                if self.peek() == Some(&Tok::LParen) {
                    self.parse_funccall("false")
                } else {
                    Ok(self.ast.add(OpKind::Constant(Value::Bool(false))))
                }
            }
            Some(Tok::Null) => Ok(self.ast.add(OpKind::Constant(Value::Null))),
            Some(Tok::BindVar(name)) => Ok(self.ast.add(OpKind::BindVar(name))),
            Some(Tok::QLabel(name)) => self.parse_label_ref(name),
            Some(Tok::Id) => Ok(self.add_project_subject()),
            Some(Tok::Star) => Ok(self.add_project_name("*")),
            Some(Tok::Name(name)) | Some(Tok::PropString(name)) => {
                if self.peek() == Some(&Tok::LParen) {
                    self.parse_funccall(&name)
                } else {
                    self.parse_columnref(name)
                }
            }
            Some(Tok::LParen) => {
                let expr = self.parse_expression(0)?;
                self.expect(Tok::RParen, "')'")?;
                Ok(expr)
            }
            Some(Tok::LBrace) => self.parse_join_atom(),
            _ => Err(self.err_here("unexpected token in expression")),
        }
    }

    /// `?x`, `?x.prop.path`, or `?x.id` (which is just `?x`)
    fn parse_label_ref(&mut self, name: String) -> Result<OpId> {
        if self.peek() != Some(&Tok::Period) {
            return Ok(self.ast.add(OpKind::Label(name)));
        }
        let mut path = Vec::new();
        let mut construct_refs = None;
        while self.eat(&Tok::Period) {
            match self.bump() {
                Some(Tok::Id) => {
                    if path.is_empty() {
                        return Ok(self.ast.add(OpKind::Label(name)));
                    }
                    construct_refs = Some(false);
                    break;
                }
                Some(Tok::Name(seg)) | Some(Tok::PropString(seg)) => {
                    path.push(PathStep::Name(seg));
                }
                Some(Tok::Star) => path.push(PathStep::Star),
                _ => return Err(self.err_here("expected a property name after '.'")),
            }
        }
        Ok(self.ast.add(OpKind::Project(Projection {
            path,
            varref: Some(name),
            construct_refs,
        })))
    }

    /// `prop`, `prop.path`, or `prop.path.id`
    fn parse_columnref(&mut self, first: String) -> Result<OpId> {
        let mut path = vec![PathStep::Name(first)];
        let mut construct_refs = None;
        while self.eat(&Tok::Period) {
            match self.bump() {
                Some(Tok::Id) => {
                    construct_refs = Some(false);
                    break;
                }
                Some(Tok::Name(seg)) | Some(Tok::PropString(seg)) => {
                    path.push(PathStep::Name(seg));
                }
                Some(Tok::Star) => path.push(PathStep::Star),
                _ => return Err(self.err_here("expected a property name after '.'")),
            }
        }
        Ok(self.ast.add(OpKind::Project(Projection {
            path,
            varref: None,
            construct_refs,
        })))
    }

    fn parse_funccall(&mut self, name: &str) -> Result<OpId> {
        self.expect(Tok::LParen, "'('")?;
        let mut args = Vec::new();
        if self.peek() != Some(&Tok::RParen) {
            loop {
                args.push(self.parse_expression(0)?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(Tok::RParen, "')'")?;
        self.state.get_func_op(&mut self.ast, name, args)
    }

    /// `{ [?label [,]] expression }` inside an expression: a join set
    fn parse_join_atom(&mut self) -> Result<OpId> {
        let label = self.take_label();
        let expr = self.parse_expression(0)?;
        self.expect(Tok::RBrace, "'}'")?;
        let join = self.state.make_join_expr(&mut self.ast, expr)?;
        if let Some(label) = label {
            self.state.add_labeled_join(&mut self.ast, &label, join)?;
        }
        Ok(join)
    }
}

fn is_op_start(tok: &Tok) -> bool {
    matches!(
        tok,
        Tok::Where
            | Tok::Group
            | Tok::Groupby
            | Tok::Order
            | Tok::Orderby
            | Tok::Limit
            | Tok::Offset
            | Tok::Depth
            | Tok::Mergeall
            | Tok::Namemap
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::JoinKind;

    fn compile(query: &str) -> (Ast, OpId) {
        let functions = FunctionRegistry::new();
        let (result, diagnostics) = parse(query, &functions, None);
        let Some((ast, root)) = result else {
            panic!("compile failed: {diagnostics:?}");
        };
        (ast, root)
    }

    fn compile_err(query: &str) -> Vec<String> {
        let functions = FunctionRegistry::new();
        let (result, diagnostics) = parse(query, &functions, None);
        assert!(result.is_none(), "expected {query:?} to fail");
        diagnostics
    }

    #[test]
    fn test_parse_star_query() {
        let (ast, root) = compile("{*}");
        assert!(matches!(ast.kind(root), OpKind::Select(_)));
        let construct = ast.select_construct(root).expect("construct");
        assert!(matches!(ast.kind(construct), OpKind::Construct(Shape::Object)));
        // top-level unfiltered query skips embedded resources
        let OpKind::Select(info) = ast.kind(root) else {
            unreachable!()
        };
        assert!(info.skip_anonymous);
    }

    #[test]
    fn test_parse_shapes() {
        let (ast, root) = compile("[*]");
        let construct = ast.select_construct(root).expect("construct");
        assert!(matches!(ast.kind(construct), OpKind::Construct(Shape::Array)));

        let (ast, root) = compile("(foo)");
        let construct = ast.select_construct(root).expect("construct");
        assert!(matches!(ast.kind(construct), OpKind::Construct(Shape::Scalar)));
    }

    #[test]
    fn test_criteria_clauses() {
        let (ast, root) = compile("{ foo where (bar = 1) order by foo desc limit 5 offset 2 }");
        let OpKind::Select(info) = ast.kind(root) else {
            unreachable!()
        };
        assert_eq!(info.limit, Some(5));
        assert_eq!(info.offset, Some(2));
        assert!(ast.select_order_by(root).is_some());
        assert!(ast.select_where(root).is_some());
    }

    #[test]
    fn test_groupby_both_spellings() {
        let (ast, root) = compile("{ subject, content groupby(subject) }");
        assert!(ast.select_group_by(root).is_some());
        let (ast, root) = compile("{ subject, content group by subject }");
        assert!(ast.select_group_by(root).is_some());
    }

    #[test]
    fn test_consolidated_filter_structure() {
        // foo = 'bar' must become exactly one filter testing both the
        // property name and the object value
        let (ast, root) = compile("{ id where (foo = 'bar') }");
        let where_ = ast.select_where(root).expect("where");
        let filters: Vec<OpId> = ast
            .descendants(where_)
            .into_iter()
            .filter(|id| matches!(ast.kind(*id), OpKind::Filter))
            .collect();
        assert_eq!(filters.len(), 1, "expected one consolidated filter");

        let filter = filters[0];
        let preds = ast.children(filter);
        assert_eq!(preds.len(), 2, "object test plus property-name test");
        let labels = &ast.node(filter).labels;
        assert!(labels.iter().any(|(name, pos)| name == "foo" && *pos == TriplePos::Object));
    }

    #[test]
    fn test_property_path_builds_join_chain() {
        let (ast, root) = compile(r#"{ "child_label" : parent.label }"#);
        let where_ = ast.select_where(root).expect("where");
        // two filters: one per path segment
        let filters: Vec<OpId> = ast
            .descendants(where_)
            .into_iter()
            .filter(|id| matches!(ast.kind(*id), OpKind::Filter))
            .collect();
        assert_eq!(filters.len(), 2);
        // nested join joins the segments
        let joins: Vec<OpId> = ast
            .descendants(where_)
            .into_iter()
            .filter(|id| matches!(ast.kind(*id), OpKind::Join))
            .collect();
        assert_eq!(joins.len(), 2, "outer join plus path join");
    }

    #[test]
    fn test_maybe_forces_left_outer() {
        let (ast, root) = compile("{ name, maybe age }");
        let where_ = ast.select_where(root).expect("where");
        let kinds: Vec<JoinKind> = ast
            .children(where_)
            .into_iter()
            .filter_map(|jc| match ast.kind(jc) {
                OpKind::JoinCond(info) => Some(info.kind),
                _ => None,
            })
            .collect();
        assert!(kinds.contains(&JoinKind::Inner));
        assert!(kinds.contains(&JoinKind::LeftOuter));
    }

    #[test]
    fn test_not_property_is_anti_join() {
        let (ast, root) = compile("{ id where (not foo) }");
        let where_ = ast.select_where(root).expect("where");
        let kinds: Vec<JoinKind> = ast
            .children(where_)
            .into_iter()
            .filter_map(|jc| match ast.kind(jc) {
                OpKind::JoinCond(info) => Some(info.kind),
                _ => None,
            })
            .collect();
        assert!(kinds.contains(&JoinKind::Anti));
    }

    #[test]
    fn test_label_reference_merges_joins() {
        // both occurrences of ?child must resolve to one relational node
        let (ast, root) = compile(
            "{ ?child, * where ( {child = ?child} ) }",
        );
        let where_ = ast.select_where(root).expect("where");
        assert_eq!(ast.join_label(where_), Some("child"));
        // the where join now contains the child-filter join as a condition
        let has_join_child = ast.children(where_).iter().any(|jc| {
            ast.children(*jc)
                .first()
                .is_some_and(|c| ast.kind(*c).is_resource_set())
        });
        assert!(has_join_child, "referenced join merged into labeled join");
    }

    #[test]
    fn test_unknown_label_fails() {
        let diagnostics = compile_err("{ id where (foo = ?nope) }");
        assert!(
            diagnostics.iter().any(|d| d.contains("unknown label")),
            "got: {diagnostics:?}"
        );
    }

    #[test]
    fn test_unknown_function_fails() {
        let diagnostics = compile_err("{ 'x': frobnicate(foo) }");
        assert!(
            diagnostics.iter().any(|d| d.contains("not defined")),
            "got: {diagnostics:?}"
        );
    }

    #[test]
    fn test_syntax_error_reports_position() {
        let diagnostics = compile_err("{ foo : }");
        assert!(!diagnostics.is_empty());
        assert!(diagnostics[0].contains("line"), "got: {diagnostics:?}");
    }

    #[test]
    fn test_or_becomes_union() {
        let (ast, root) = compile("{ id where (foo = 1 or bar = 2) }");
        let where_ = ast.select_where(root).expect("where");
        let unions: Vec<OpId> = ast
            .descendants(where_)
            .into_iter()
            .filter(|id| matches!(ast.kind(*id), OpKind::Union))
            .collect();
        assert_eq!(unions.len(), 1);
    }

    #[test]
    fn test_and_flattens() {
        let (ast, root) = compile("{ id where (a = 1 and b = 2 and c = 3) }");
        let where_ = ast.select_where(root).expect("where");
        // one join of three conditions, not nested pairs
        let joins: Vec<OpId> = ast
            .descendants(where_)
            .into_iter()
            .filter(|id| matches!(ast.kind(*id), OpKind::Join))
            .collect();
        assert_eq!(joins.len(), 1);
        assert_eq!(ast.children(where_).len(), 3);
    }

    #[test]
    fn test_multi_label_equality_unsupported() {
        // two labels compared to each other where neither denotes the
        // enclosing join is an intentional scope limit, not a bug
        let diagnostics = compile_err("{ id where (foo = ?a and bar = ?b and ?a = ?b) }");
        assert!(
            diagnostics.iter().any(|d| d.contains("equijoin")),
            "got: {diagnostics:?}"
        );
        // chained label comparisons do not parse
        let diagnostics = compile_err("{ id where (?a = ?b = ?c) }");
        assert!(!diagnostics.is_empty());
    }

    #[test]
    fn test_fresh_parser_state_per_compile() {
        // anonymous join counters restart per compile: compiling the same
        // query twice yields identical plans
        let (ast1, root1) = compile("{ 'x': a.b }");
        let (ast2, root2) = compile("{ 'x': a.b }");
        assert_eq!(ast1.explain(root1), ast2.explain(root2));
    }

    #[test]
    fn test_namemap_resolution() {
        let (ast, root) = compile(
            r#"{ "v" : <ex:version> where (<ex:version> = 2) namemap = { "ex": "http://example.com/" } }"#,
        );
        let where_ = ast.select_where(root).expect("where");
        let resolved = ast.descendants(where_).into_iter().any(|id| {
            matches!(ast.kind(id), OpKind::PropName(n) if n == "http://example.com/version")
        });
        assert!(resolved, "{}", ast.explain(root));
    }
}
