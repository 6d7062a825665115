//! WHERE-clause predicates
//!
//! A shape's `where` parameter is parsed with `sqlparser` and compiled into a
//! small expression tree restricted to the supported dialect: column
//! references, literals, comparisons, `AND`/`OR`/`NOT`, `IS [NOT] NULL`,
//! `IS [NOT] TRUE/FALSE/UNKNOWN`, `[I]LIKE`, `[NOT] IN`, `[NOT] BETWEEN`,
//! unary minus and simple casts.
//!
//! Evaluation follows SQL three-valued logic. Boolean results are carried as
//! [`Value::Bool`], UNKNOWN as [`Value::Null`]. [`Predicate::matches`]
//! projects UNKNOWN to `false`.

use crate::error::{Error, Result};
use crate::value::{Row, Value};
use regex::{Regex, RegexBuilder};
use sqlparser::ast::{self, BinaryOperator, UnaryOperator};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// A compiled WHERE clause
#[derive(Clone)]
pub struct Predicate {
    sql: String,
    root: Node,
    columns: Vec<String>,
}

impl Predicate {
    /// Parse and compile a WHERE clause
    pub fn parse(sql: &str) -> Result<Self> {
        let dialect = PostgreSqlDialect {};
        let mut parser = Parser::new(&dialect)
            .try_with_sql(sql)
            .map_err(|e| Error::InvalidWhere(e.to_string()))?;
        let expr = parser
            .parse_expr()
            .map_err(|e| Error::InvalidWhere(e.to_string()))?;
        if parser.peek_token().token != Token::EOF {
            return Err(Error::InvalidWhere(format!(
                "unexpected input after expression: {sql}"
            )));
        }

        let root = compile(&expr)?;
        let mut columns = BTreeSet::new();
        root.collect_columns(&mut columns);

        Ok(Self {
            sql: expr.to_string(),
            root,
            columns: columns.into_iter().collect(),
        })
    }

    /// Normalised SQL text, stable for equal expressions
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Columns referenced by the expression, sorted
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Evaluate against a row: `Some(bool)` or `None` for UNKNOWN
    pub fn evaluate(&self, row: &Row) -> Result<Option<bool>> {
        match self.root.eval(row)? {
            Value::Bool(b) => Ok(Some(b)),
            Value::Null => Ok(None),
            other => Err(Error::Predicate(format!(
                "WHERE clause must evaluate to a boolean, got {other}"
            ))),
        }
    }

    /// Whether the row satisfies the predicate; UNKNOWN is `false`
    pub fn matches(&self, row: &Row) -> Result<bool> {
        Ok(self.evaluate(row)? == Some(true))
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate").field("sql", &self.sql).finish()
    }
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        self.sql == other.sql
    }
}

impl Eq for Predicate {}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    fn test(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::NotEq => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::LtEq => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::GtEq => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CastType {
    Int,
    Float,
    Bool,
    Text,
}

#[derive(Debug, Clone)]
enum Node {
    Column(String),
    Literal(Value),
    Compare(CmpOp, Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
    Neg(Box<Node>),
    IsNull(Box<Node>, bool),
    /// `IS [NOT] TRUE | FALSE | UNKNOWN`; target `None` is UNKNOWN
    IsBool {
        expr: Box<Node>,
        target: Option<bool>,
        negated: bool,
    },
    Like {
        expr: Box<Node>,
        pattern: Box<Node>,
        compiled: Option<Regex>,
        negated: bool,
        case_insensitive: bool,
    },
    InList {
        expr: Box<Node>,
        list: Vec<Node>,
        negated: bool,
    },
    Between {
        expr: Box<Node>,
        low: Box<Node>,
        high: Box<Node>,
        negated: bool,
    },
    Cast(Box<Node>, CastType),
}

fn unsupported(what: impl fmt::Display) -> Error {
    Error::InvalidWhere(format!("unsupported expression: {what}"))
}

fn compile(expr: &ast::Expr) -> Result<Node> {
    use ast::Expr;

    let boxed = |e: &Expr| compile(e).map(Box::new);

    let node = match expr {
        Expr::Identifier(ident) => Node::Column(if ident.quote_style.is_some() {
            ident.value.clone()
        } else {
            ident.value.to_ascii_lowercase()
        }),
        Expr::Value(v) => Node::Literal(literal(&v.value)?),
        Expr::Nested(inner) => compile(inner)?,
        Expr::BinaryOp { left, op, right } => {
            let (l, r) = (boxed(left)?, boxed(right)?);
            match op {
                BinaryOperator::And => Node::And(l, r),
                BinaryOperator::Or => Node::Or(l, r),
                BinaryOperator::Eq => Node::Compare(CmpOp::Eq, l, r),
                BinaryOperator::NotEq => Node::Compare(CmpOp::NotEq, l, r),
                BinaryOperator::Lt => Node::Compare(CmpOp::Lt, l, r),
                BinaryOperator::LtEq => Node::Compare(CmpOp::LtEq, l, r),
                BinaryOperator::Gt => Node::Compare(CmpOp::Gt, l, r),
                BinaryOperator::GtEq => Node::Compare(CmpOp::GtEq, l, r),
                other => return Err(unsupported(format!("operator {other}"))),
            }
        }
        Expr::UnaryOp { op, expr: inner } => match op {
            UnaryOperator::Not => Node::Not(boxed(inner)?),
            UnaryOperator::Minus => match compile(inner)? {
                Node::Literal(Value::Int(i)) => Node::Literal(Value::Int(-i)),
                Node::Literal(Value::Float(f)) => Node::Literal(Value::Float(-f)),
                other => Node::Neg(Box::new(other)),
            },
            UnaryOperator::Plus => compile(inner)?,
            other => return Err(unsupported(format!("operator {other}"))),
        },
        Expr::IsNull(inner) => Node::IsNull(boxed(inner)?, false),
        Expr::IsNotNull(inner) => Node::IsNull(boxed(inner)?, true),
        Expr::IsTrue(inner) => is_bool(boxed(inner)?, Some(true), false),
        Expr::IsNotTrue(inner) => is_bool(boxed(inner)?, Some(true), true),
        Expr::IsFalse(inner) => is_bool(boxed(inner)?, Some(false), false),
        Expr::IsNotFalse(inner) => is_bool(boxed(inner)?, Some(false), true),
        Expr::IsUnknown(inner) => is_bool(boxed(inner)?, None, false),
        Expr::IsNotUnknown(inner) => is_bool(boxed(inner)?, None, true),
        Expr::Like {
            negated,
            expr: inner,
            pattern,
            ..
        } => like(boxed(inner)?, boxed(pattern)?, *negated, false)?,
        Expr::ILike {
            negated,
            expr: inner,
            pattern,
            ..
        } => like(boxed(inner)?, boxed(pattern)?, *negated, true)?,
        Expr::InList {
            expr: inner,
            list,
            negated,
        } => Node::InList {
            expr: boxed(inner)?,
            list: list.iter().map(compile).collect::<Result<_>>()?,
            negated: *negated,
        },
        Expr::Between {
            expr: inner,
            negated,
            low,
            high,
        } => Node::Between {
            expr: boxed(inner)?,
            low: boxed(low)?,
            high: boxed(high)?,
            negated: *negated,
        },
        Expr::Cast {
            expr: inner,
            data_type,
            ..
        } => Node::Cast(boxed(inner)?, cast_type(&data_type.to_string())?),
        Expr::CompoundIdentifier(parts) => {
            return Err(Error::InvalidWhere(format!(
                "qualified column references are not supported: {}",
                parts
                    .iter()
                    .map(|p| p.value.as_str())
                    .collect::<Vec<_>>()
                    .join(".")
            )))
        }
        other => return Err(unsupported(other)),
    };
    Ok(node)
}

fn is_bool(expr: Box<Node>, target: Option<bool>, negated: bool) -> Node {
    Node::IsBool {
        expr,
        target,
        negated,
    }
}

fn like(expr: Box<Node>, pattern: Box<Node>, negated: bool, case_insensitive: bool) -> Result<Node> {
    let compiled = match pattern.as_ref() {
        Node::Literal(Value::Text(p)) => Some(like_regex(p, case_insensitive)?),
        _ => None,
    };
    Ok(Node::Like {
        expr,
        pattern,
        compiled,
        negated,
        case_insensitive,
    })
}

fn literal(value: &ast::Value) -> Result<Value> {
    match value {
        ast::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Value::Int(i))
            } else {
                n.parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| Error::InvalidWhere(format!("invalid number: {n}")))
            }
        }
        ast::Value::SingleQuotedString(s) => Ok(Value::Text(s.clone())),
        ast::Value::Boolean(b) => Ok(Value::Bool(*b)),
        ast::Value::Null => Ok(Value::Null),
        other => Err(unsupported(format!("literal {other}"))),
    }
}

fn cast_type(name: &str) -> Result<CastType> {
    let lower = name.to_ascii_lowercase();
    let base = lower.split('(').next().unwrap_or_default().trim();
    match base {
        "int" | "integer" | "int2" | "int4" | "int8" | "smallint" | "bigint" => Ok(CastType::Int),
        "float" | "float4" | "float8" | "real" | "double precision" | "numeric" | "decimal" => {
            Ok(CastType::Float)
        }
        "bool" | "boolean" => Ok(CastType::Bool),
        "text" | "varchar" | "character varying" | "char" | "character" | "bpchar" => {
            Ok(CastType::Text)
        }
        _ => Err(unsupported(format!("cast to {name}"))),
    }
}

/// Translate a LIKE pattern into an anchored regex.
///
/// `%` matches any run, `_` a single character, and `\` makes the next
/// character literal. Everything else is literal.
fn like_regex(pattern: &str, case_insensitive: bool) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    re.push_str(&regex::escape(&next.to_string()));
                }
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    RegexBuilder::new(&re)
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| Error::InvalidWhere(format!("invalid LIKE pattern: {e}")))
}

/// Three-valued AND over `Value::Bool`/`Value::Null`
fn and3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn or3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

fn truth(v: Option<bool>) -> Value {
    v.map(Value::Bool).unwrap_or(Value::Null)
}

fn as_truth(v: &Value) -> Result<Option<bool>> {
    match v {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Null => Ok(None),
        Value::Text(s) => match s.as_str() {
            "t" | "true" => Ok(Some(true)),
            "f" | "false" => Ok(Some(false)),
            _ => Err(Error::Predicate(format!("{s:?} is not a boolean"))),
        },
        other => Err(Error::Predicate(format!("{other} is not a boolean"))),
    }
}

/// Compare two non-null values with numeric coercion.
///
/// Returns `None` when the values have no defined order (NaN).
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Text(_)) => as_truth(b).ok().flatten().map(|y| x.cmp(&y)),
        (Value::Text(_), Value::Bool(y)) => as_truth(a).ok().flatten().map(|x| x.cmp(y)),
        _ if a.is_numeric() || b.is_numeric() => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => Some(a.to_string().cmp(&b.to_string())),
        },
        _ => Some(a.to_string().cmp(&b.to_string())),
    }
}

impl Node {
    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            Node::Column(c) => {
                out.insert(c.clone());
            }
            Node::Literal(_) => {}
            Node::Compare(_, l, r) | Node::And(l, r) | Node::Or(l, r) => {
                l.collect_columns(out);
                r.collect_columns(out);
            }
            Node::Not(e) | Node::Neg(e) | Node::IsNull(e, _) | Node::Cast(e, _) => {
                e.collect_columns(out)
            }
            Node::IsBool { expr, .. } => expr.collect_columns(out),
            Node::Like { expr, pattern, .. } => {
                expr.collect_columns(out);
                pattern.collect_columns(out);
            }
            Node::InList { expr, list, .. } => {
                expr.collect_columns(out);
                list.iter().for_each(|n| n.collect_columns(out));
            }
            Node::Between {
                expr, low, high, ..
            } => {
                expr.collect_columns(out);
                low.collect_columns(out);
                high.collect_columns(out);
            }
        }
    }

    fn eval(&self, row: &Row) -> Result<Value> {
        match self {
            Node::Column(name) => Ok(row.get(name).cloned().unwrap_or(Value::Null)),
            Node::Literal(v) => Ok(v.clone()),
            Node::Compare(op, l, r) => {
                let (a, b) = (l.eval(row)?, r.eval(row)?);
                if a.is_null() || b.is_null() {
                    return Ok(Value::Null);
                }
                Ok(truth(compare(&a, &b).map(|ord| op.test(ord))))
            }
            Node::And(l, r) => {
                let a = as_truth(&l.eval(row)?)?;
                if a == Some(false) {
                    return Ok(Value::Bool(false));
                }
                Ok(truth(and3(a, as_truth(&r.eval(row)?)?)))
            }
            Node::Or(l, r) => {
                let a = as_truth(&l.eval(row)?)?;
                if a == Some(true) {
                    return Ok(Value::Bool(true));
                }
                Ok(truth(or3(a, as_truth(&r.eval(row)?)?)))
            }
            Node::Not(e) => Ok(truth(as_truth(&e.eval(row)?)?.map(|b| !b))),
            Node::Neg(e) => match e.eval(row)? {
                Value::Null => Ok(Value::Null),
                Value::Int(i) => Ok(Value::Int(-i)),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => other
                    .as_f64()
                    .map(|f| Value::Float(-f))
                    .ok_or_else(|| Error::Predicate(format!("cannot negate {other}"))),
            },
            Node::IsNull(e, negated) => Ok(Value::Bool(e.eval(row)?.is_null() != *negated)),
            Node::IsBool {
                expr,
                target,
                negated,
            } => {
                let v = as_truth(&expr.eval(row)?)?;
                Ok(Value::Bool((v == *target) != *negated))
            }
            Node::Like {
                expr,
                pattern,
                compiled,
                negated,
                case_insensitive,
            } => {
                let subject = expr.eval(row)?;
                if subject.is_null() {
                    return Ok(Value::Null);
                }
                let matched = match compiled {
                    Some(re) => re.is_match(&subject.to_string()),
                    None => {
                        let p = pattern.eval(row)?;
                        if p.is_null() {
                            return Ok(Value::Null);
                        }
                        like_regex(&p.to_string(), *case_insensitive)?
                            .is_match(&subject.to_string())
                    }
                };
                Ok(Value::Bool(matched != *negated))
            }
            Node::InList {
                expr,
                list,
                negated,
            } => {
                let needle = expr.eval(row)?;
                if needle.is_null() {
                    return Ok(Value::Null);
                }
                let mut found = false;
                for item in list {
                    let v = item.eval(row)?;
                    if !v.is_null() && compare(&needle, &v) == Some(Ordering::Equal) {
                        found = true;
                        break;
                    }
                }
                Ok(Value::Bool(found != *negated))
            }
            Node::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let x = expr.eval(row)?;
                let (lo, hi) = (low.eval(row)?, high.eval(row)?);
                let ge = if x.is_null() || lo.is_null() {
                    None
                } else {
                    compare(&x, &lo).map(|o| o != Ordering::Less)
                };
                let le = if x.is_null() || hi.is_null() {
                    None
                } else {
                    compare(&x, &hi).map(|o| o != Ordering::Greater)
                };
                let inside = and3(ge, le);
                Ok(truth(if *negated { inside.map(|b| !b) } else { inside }))
            }
            Node::Cast(e, ty) => cast(e.eval(row)?, *ty),
        }
    }
}

fn cast(v: Value, ty: CastType) -> Result<Value> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let fail = |v: &Value| Error::Predicate(format!("cannot cast {v} to {ty:?}"));
    match ty {
        CastType::Text => Ok(Value::Text(v.to_string())),
        CastType::Bool => as_truth(&v)
            .ok()
            .flatten()
            .map(Value::Bool)
            .ok_or_else(|| fail(&v)),
        CastType::Int => match &v {
            Value::Int(_) => Ok(v),
            Value::Float(f) => Ok(Value::Int(f.round() as i64)),
            Value::Text(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| fail(&v)),
            _ => Err(fail(&v)),
        },
        CastType::Float => v.as_f64().map(Value::Float).ok_or_else(|| fail(&v)),
    }
}
