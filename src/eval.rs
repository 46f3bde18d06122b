//! Expression Evaluator for the nlib rendering engine
//!
//! Interprets lowered template expressions against a scope holding the
//! controller (`this`), loop locals and `$event`. Bindings evaluate in read
//! mode and may not assign; event statements evaluate in statement mode where
//! writes go through the controller interposer.

use indexmap::IndexMap;
use std::rc::Rc;

use crate::error::{EngineError, Result};
use crate::expr::{
    ArrayItem, Arrow, ArrowBody, AssignmentOperator, BinaryOperator, Expr, LogicalOperator,
    MemberKey, ObjectEntry, Program, UnaryOperator, UpdateOperator,
};
use crate::value::{format_number, Function, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Property, attribute and text bindings.
    Read,
    /// Event bindings; assignment and update are allowed.
    Statement,
}

/// Names visible to an expression besides globals.
#[derive(Clone, Default)]
pub struct Scope {
    this: Value,
    locals: Rc<IndexMap<String, Value>>,
}

impl Scope {
    pub fn new(this: Value) -> Self {
        Self {
            this,
            locals: Rc::new(IndexMap::new()),
        }
    }

    pub fn this(&self) -> &Value {
        &self.this
    }

    pub fn with_local(&self, name: &str, value: Value) -> Scope {
        self.with_locals([(name.to_string(), value)])
    }

    pub fn with_locals(&self, locals: impl IntoIterator<Item = (String, Value)>) -> Scope {
        let mut map = (*self.locals).clone();
        map.extend(locals);
        Scope {
            this: self.this.clone(),
            locals: Rc::new(map),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.locals.get(name).cloned()
    }

    pub fn local_names(&self) -> impl Iterator<Item = &str> {
        self.locals.keys().map(String::as_str)
    }
}

/// Evaluates a binding expression.
pub fn evaluate(expr: &Expr, scope: &Scope) -> Result<Value> {
    Interpreter::new(scope.clone(), EvalMode::Read).eval(expr)
}

/// Runs an event statement list and returns the value of the last statement.
pub fn execute(program: &Program, scope: &Scope) -> Result<Value> {
    let mut interpreter = Interpreter::new(scope.clone(), EvalMode::Statement);
    let mut last = Value::Undefined;
    for statement in &program.statements {
        last = interpreter.eval(statement)?;
    }
    Ok(last)
}

fn bind_error(message: impl Into<String>) -> EngineError {
    EngineError::bind(message)
}

// ═══════════════════════════════════════════════════════════════════════════════
// GLOBALS
// ═══════════════════════════════════════════════════════════════════════════════

fn native(name: &str, f: impl Fn(&[Value]) -> std::result::Result<Value, String> + 'static) -> Value {
    Value::Function(Function::new(name, f))
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Undefined)
}

fn math_fold(args: &[Value], init: f64, pick: fn(f64, f64) -> f64) -> Value {
    let mut acc = init;
    for value in args {
        let n = value.to_number();
        if n.is_nan() {
            return Value::Number(f64::NAN);
        }
        acc = pick(acc, n);
    }
    Value::Number(acc)
}

fn unary_math(name: &str, f: fn(f64) -> f64) -> (String, Value) {
    (
        name.to_string(),
        native(name, move |args| Ok(Value::Number(f(arg(args, 0).to_number())))),
    )
}

fn js_round(n: f64) -> f64 {
    (n + 0.5).floor()
}

fn parse_int(text: &str, radix: u32) -> f64 {
    let text = text.trim_start();
    let (negative, text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (radix, text) = if (radix == 16 || radix == 0) && (text.starts_with("0x") || text.starts_with("0X")) {
        (16, &text[2..])
    } else if radix == 0 {
        (10, text)
    } else {
        (radix, text)
    };
    let digits: String = text.chars().take_while(|c| c.is_digit(radix)).collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let value = i64::from_str_radix(&digits, radix)
        .map(|n| n as f64)
        .unwrap_or(f64::NAN);
    if negative {
        -value
    } else {
        value
    }
}

fn parse_float(text: &str) -> f64 {
    let text = text.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    let mut seen_exp = false;
    let bytes = text.as_bytes();
    while end < bytes.len() {
        let c = bytes[end] as char;
        let ok = c.is_ascii_digit()
            || ((c == '-' || c == '+') && (end == 0 || matches!(bytes[end - 1], b'e' | b'E')))
            || (c == '.' && !seen_dot && !seen_exp)
            || ((c == 'e' || c == 'E') && !seen_exp && end > 0);
        if !ok {
            break;
        }
        seen_dot |= c == '.';
        seen_exp |= c == 'e' || c == 'E';
        end += 1;
    }
    let mut candidate = &text[..end];
    while !candidate.is_empty() {
        if let Ok(n) = candidate.parse::<f64>() {
            return n;
        }
        candidate = &candidate[..candidate.len() - 1];
    }
    if text.starts_with("Infinity") {
        return f64::INFINITY;
    }
    f64::NAN
}

fn json_stringify(args: &[Value]) -> std::result::Result<Value, String> {
    let Some(json) = arg(args, 0).to_json() else {
        return Ok(Value::Undefined);
    };
    let indent = arg(args, 2);
    let text = if indent.is_truthy() {
        serde_json::to_string_pretty(&json)
    } else {
        serde_json::to_string(&json)
    };
    text.map(Value::String).map_err(|e| e.to_string())
}

fn build_globals() -> IndexMap<String, Value> {
    let mut globals = IndexMap::new();

    let mut math: IndexMap<String, Value> = [
        unary_math("abs", f64::abs),
        unary_math("ceil", f64::ceil),
        unary_math("floor", f64::floor),
        unary_math("round", js_round),
        unary_math("sqrt", f64::sqrt),
        unary_math("trunc", f64::trunc),
        unary_math("log", f64::ln),
        unary_math("sign", |n| if n == 0.0 || n.is_nan() { n } else { n.signum() }),
    ]
    .into_iter()
    .collect();
    math.insert("max".into(), native("max", |args| Ok(math_fold(args, f64::NEG_INFINITY, f64::max))));
    math.insert("min".into(), native("min", |args| Ok(math_fold(args, f64::INFINITY, f64::min))));
    math.insert(
        "pow".into(),
        native("pow", |args| Ok(Value::Number(arg(args, 0).to_number().powf(arg(args, 1).to_number())))),
    );
    math.insert("PI".into(), Value::Number(std::f64::consts::PI));
    math.insert("E".into(), Value::Number(std::f64::consts::E));
    globals.insert("Math".to_string(), Value::from(math));

    globals.insert(
        "JSON".to_string(),
        Value::object([
            ("stringify", native("stringify", json_stringify)),
            (
                "parse",
                native("parse", |args| {
                    serde_json::from_str::<serde_json::Value>(&arg(args, 0).to_js_string())
                        .map(Value::from)
                        .map_err(|e| format!("SyntaxError: {}", e))
                }),
            ),
        ]),
    );

    globals.insert(
        "Object".to_string(),
        Value::object([
            (
                "keys",
                native("keys", |args| {
                    Ok(Value::array(entries_of(&arg(args, 0)).into_iter().map(|(k, _)| Value::String(k)).collect()))
                }),
            ),
            (
                "values",
                native("values", |args| {
                    Ok(Value::array(entries_of(&arg(args, 0)).into_iter().map(|(_, v)| v).collect()))
                }),
            ),
            (
                "entries",
                native("entries", |args| {
                    Ok(Value::array(
                        entries_of(&arg(args, 0))
                            .into_iter()
                            .map(|(k, v)| Value::array(vec![Value::String(k), v]))
                            .collect(),
                    ))
                }),
            ),
        ]),
    );

    globals.insert(
        "Array".to_string(),
        Value::object([
            (
                "isArray",
                native("isArray", |args| Ok(Value::Bool(matches!(arg(args, 0), Value::Array(_))))),
            ),
            (
                "from",
                native("from", |args| {
                    Ok(match arg(args, 0) {
                        Value::Array(items) => Value::array((*items).clone()),
                        Value::String(s) => Value::array(s.chars().map(|c| Value::String(c.to_string())).collect()),
                        _ => Value::array(vec![]),
                    })
                }),
            ),
        ]),
    );

    globals.insert(
        "String".to_string(),
        native("String", |args| Ok(Value::String(args.first().map_or(String::new(), Value::to_js_string)))),
    );
    globals.insert(
        "Number".to_string(),
        native("Number", |args| Ok(Value::Number(args.first().map_or(0.0, Value::to_number)))),
    );
    globals.insert(
        "Boolean".to_string(),
        native("Boolean", |args| Ok(Value::Bool(arg(args, 0).is_truthy()))),
    );
    globals.insert(
        "parseInt".to_string(),
        native("parseInt", |args| {
            let radix = arg(args, 1).to_number();
            let radix = if radix.is_nan() { 0 } else { radix as u32 };
            if radix != 0 && !(2..=36).contains(&radix) {
                return Ok(Value::Number(f64::NAN));
            }
            Ok(Value::Number(parse_int(&arg(args, 0).to_js_string(), radix)))
        }),
    );
    globals.insert(
        "parseFloat".to_string(),
        native("parseFloat", |args| Ok(Value::Number(parse_float(&arg(args, 0).to_js_string())))),
    );
    globals.insert(
        "isNaN".to_string(),
        native("isNaN", |args| Ok(Value::Bool(arg(args, 0).to_number().is_nan()))),
    );
    globals.insert(
        "isFinite".to_string(),
        native("isFinite", |args| Ok(Value::Bool(arg(args, 0).to_number().is_finite()))),
    );

    let log = |level: &'static str| {
        native(level, move |args| {
            let message = args.iter().map(Value::to_js_string).collect::<Vec<_>>().join(" ");
            match level {
                "error" => tracing::error!(target: "nlib_engine::template", "{}", message),
                "warn" => tracing::warn!(target: "nlib_engine::template", "{}", message),
                _ => tracing::info!(target: "nlib_engine::template", "{}", message),
            }
            Ok(Value::Undefined)
        })
    };
    globals.insert(
        "console".to_string(),
        Value::object([("log", log("log")), ("warn", log("warn")), ("error", log("error"))]),
    );

    globals
}

thread_local! {
    static GLOBALS: IndexMap<String, Value> = build_globals();
}

/// Names resolvable without a scope entry.
pub fn is_global(name: &str) -> bool {
    GLOBALS.with(|globals| globals.contains_key(name))
}

fn global(name: &str) -> Option<Value> {
    GLOBALS.with(|globals| globals.get(name).cloned())
}

fn entries_of(value: &Value) -> Vec<(String, Value)> {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect(),
        Value::String(s) => s
            .chars()
            .enumerate()
            .map(|(i, c)| (i.to_string(), Value::String(c.to_string())))
            .collect(),
        _ => vec![],
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OPERATORS
// ═══════════════════════════════════════════════════════════════════════════════

fn to_primitive(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Event(_) | Value::Element(_) | Value::Controller(_) => {
            Value::String(value.to_js_string())
        }
        other => other.clone(),
    }
}

fn to_int32(value: &Value) -> i32 {
    let n = value.to_number();
    if !n.is_finite() {
        return 0;
    }
    (n.trunc() as i64 & 0xFFFF_FFFF) as u32 as i32
}

fn compare(left: &Value, right: &Value, test: fn(std::cmp::Ordering) -> bool) -> Value {
    let (left, right) = (to_primitive(left), to_primitive(right));
    if let (Value::String(a), Value::String(b)) = (&left, &right) {
        return Value::Bool(test(a.cmp(b)));
    }
    let (a, b) = (left.to_number(), right.to_number());
    match a.partial_cmp(&b) {
        Some(ordering) => Value::Bool(test(ordering)),
        None => Value::Bool(false),
    }
}

fn binary(operator: BinaryOperator, left: &Value, right: &Value) -> Result<Value> {
    use std::cmp::Ordering;
    Ok(match operator {
        BinaryOperator::Addition => {
            let (l, r) = (to_primitive(left), to_primitive(right));
            if matches!(l, Value::String(_)) || matches!(r, Value::String(_)) {
                Value::String(format!("{}{}", l.to_js_string(), r.to_js_string()))
            } else {
                Value::Number(l.to_number() + r.to_number())
            }
        }
        BinaryOperator::Subtraction => Value::Number(left.to_number() - right.to_number()),
        BinaryOperator::Multiplication => Value::Number(left.to_number() * right.to_number()),
        BinaryOperator::Division => Value::Number(left.to_number() / right.to_number()),
        BinaryOperator::Remainder => Value::Number(left.to_number() % right.to_number()),
        BinaryOperator::Exponential => Value::Number(left.to_number().powf(right.to_number())),
        BinaryOperator::Equality => Value::Bool(left.loose_equals(right)),
        BinaryOperator::Inequality => Value::Bool(!left.loose_equals(right)),
        BinaryOperator::StrictEquality => Value::Bool(left.strict_equals(right)),
        BinaryOperator::StrictInequality => Value::Bool(!left.strict_equals(right)),
        BinaryOperator::LessThan => compare(left, right, |o| o == Ordering::Less),
        BinaryOperator::LessEqualThan => compare(left, right, |o| o != Ordering::Greater),
        BinaryOperator::GreaterThan => compare(left, right, |o| o == Ordering::Greater),
        BinaryOperator::GreaterEqualThan => compare(left, right, |o| o != Ordering::Less),
        BinaryOperator::BitwiseAnd => Value::Number((to_int32(left) & to_int32(right)) as f64),
        BinaryOperator::BitwiseOR => Value::Number((to_int32(left) | to_int32(right)) as f64),
        BinaryOperator::BitwiseXOR => Value::Number((to_int32(left) ^ to_int32(right)) as f64),
        BinaryOperator::ShiftLeft => {
            Value::Number(to_int32(left).wrapping_shl(to_int32(right) as u32 & 31) as f64)
        }
        BinaryOperator::ShiftRight => {
            Value::Number(to_int32(left).wrapping_shr(to_int32(right) as u32 & 31) as f64)
        }
        BinaryOperator::ShiftRightZeroFill => {
            Value::Number(((to_int32(left) as u32) >> (to_int32(right) as u32 & 31)) as f64)
        }
        BinaryOperator::In => match right {
            Value::Object(map) => Value::Bool(map.contains_key(&left.to_js_string())),
            Value::Array(items) => {
                let key = left.to_js_string();
                Value::Bool(key == "length" || key.parse::<usize>().map_or(false, |i| i < items.len()))
            }
            other => {
                return Err(bind_error(format!(
                    "Cannot use 'in' operator to search for '{}' in {}",
                    left.to_js_string(),
                    other.to_js_string()
                )))
            }
        },
        _ => return Err(bind_error(format!("Unsupported operator {:?}", operator))),
    })
}

fn assignment_binary(operator: AssignmentOperator) -> Option<BinaryOperator> {
    Some(match operator {
        AssignmentOperator::Addition => BinaryOperator::Addition,
        AssignmentOperator::Subtraction => BinaryOperator::Subtraction,
        AssignmentOperator::Multiplication => BinaryOperator::Multiplication,
        AssignmentOperator::Division => BinaryOperator::Division,
        AssignmentOperator::Remainder => BinaryOperator::Remainder,
        AssignmentOperator::Exponential => BinaryOperator::Exponential,
        AssignmentOperator::ShiftLeft => BinaryOperator::ShiftLeft,
        AssignmentOperator::ShiftRight => BinaryOperator::ShiftRight,
        AssignmentOperator::ShiftRightZeroFill => BinaryOperator::ShiftRightZeroFill,
        AssignmentOperator::BitwiseOR => BinaryOperator::BitwiseOR,
        AssignmentOperator::BitwiseXOR => BinaryOperator::BitwiseXOR,
        AssignmentOperator::BitwiseAnd => BinaryOperator::BitwiseAnd,
        _ => return None,
    })
}

fn assignment_logical(operator: AssignmentOperator) -> Option<LogicalOperator> {
    Some(match operator {
        AssignmentOperator::LogicalOr => LogicalOperator::Or,
        AssignmentOperator::LogicalAnd => LogicalOperator::And,
        AssignmentOperator::LogicalNullish => LogicalOperator::Coalesce,
        _ => return None,
    })
}

/// True when the right-hand side of a logical operator is skipped.
fn short_circuits(operator: LogicalOperator, left: &Value) -> bool {
    match operator {
        LogicalOperator::Or => left.is_truthy(),
        LogicalOperator::And => !left.is_truthy(),
        LogicalOperator::Coalesce => !left.is_nullish(),
    }
}

fn relative_index(index: &Value, len: usize, default: usize) -> usize {
    if matches!(index, Value::Undefined) {
        return default;
    }
    let n = index.to_number();
    let n = if n.is_nan() { 0.0 } else { n.trunc() };
    if n < 0.0 {
        (len as f64 + n).max(0.0) as usize
    } else {
        (n as usize).min(len)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INTERPRETER
// ═══════════════════════════════════════════════════════════════════════════════

struct Interpreter {
    scope: Scope,
    mode: EvalMode,
}

impl Interpreter {
    fn new(scope: Scope, mode: EvalMode) -> Self {
        Self { scope, mode }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::This => Ok(self.scope.this.clone()),
            Expr::Identifier(name) => self.lookup(name),
            Expr::Template { quasis, expressions } => {
                let mut out = String::new();
                for (i, quasi) in quasis.iter().enumerate() {
                    out.push_str(quasi);
                    if let Some(expr) = expressions.get(i) {
                        out.push_str(&self.eval(expr)?.to_js_string());
                    }
                }
                Ok(Value::String(out))
            }
            Expr::Array(items) => Ok(Value::array(self.eval_items(items)?)),
            Expr::Object(entries) => {
                let mut map = IndexMap::new();
                for entry in entries {
                    match entry {
                        ObjectEntry::Property { key, value } => {
                            let key = self.member_key(key)?;
                            let value = self.eval(value)?;
                            map.insert(key, value);
                        }
                        ObjectEntry::Spread(expr) => {
                            map.extend(entries_of(&self.eval(expr)?));
                        }
                    }
                }
                Ok(Value::from(map))
            }
            Expr::Member { .. } | Expr::Call { .. } => {
                Ok(self.eval_chain(expr)?.unwrap_or(Value::Undefined))
            }
            Expr::Chain(inner) => Ok(self.eval_chain(inner)?.unwrap_or(Value::Undefined)),
            Expr::Unary { operator, argument } => self.eval_unary(*operator, argument),
            Expr::Binary { operator, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*operator, &left, &right)
            }
            Expr::Logical { operator, left, right } => {
                let left = self.eval(left)?;
                if short_circuits(*operator, &left) {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test)?.is_truthy() {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
            Expr::Assign {
                operator,
                target,
                value,
            } => self.eval_assign(*operator, target, value),
            Expr::Update {
                operator,
                prefix,
                target,
            } => {
                self.require_statement("update")?;
                let old = self.eval(target)?.to_number();
                let new = match operator {
                    UpdateOperator::Increment => old + 1.0,
                    UpdateOperator::Decrement => old - 1.0,
                };
                self.assign(target, Value::Number(new))?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            Expr::Sequence(expressions) => {
                let mut last = Value::Undefined;
                for expr in expressions {
                    last = self.eval(expr)?;
                }
                Ok(last)
            }
            Expr::Arrow(arrow) => Ok(self.closure(arrow)),
        }
    }

    fn lookup(&self, name: &str) -> Result<Value> {
        if let Some(value) = self.scope.lookup(name) {
            return Ok(value);
        }
        global(name).ok_or_else(|| bind_error(format!("{} is not defined", name)))
    }

    fn require_statement(&self, what: &str) -> Result<()> {
        match self.mode {
            EvalMode::Statement => Ok(()),
            EvalMode::Read => Err(bind_error(format!(
                "Bindings must not mutate state ({} is only allowed in event bindings)",
                what
            ))),
        }
    }

    fn eval_items(&mut self, items: &[ArrayItem]) -> Result<Vec<Value>> {
        let mut out = vec![];
        for item in items {
            let value = self.eval(&item.expr)?;
            if item.spread {
                match value {
                    Value::Array(values) => out.extend(values.iter().cloned()),
                    Value::String(s) => out.extend(s.chars().map(|c| Value::String(c.to_string()))),
                    other => {
                        return Err(bind_error(format!("{} is not iterable", other.to_js_string())))
                    }
                }
            } else {
                out.push(value);
            }
        }
        Ok(out)
    }

    fn member_key(&mut self, key: &MemberKey) -> Result<String> {
        match key {
            MemberKey::Static(name) => Ok(name.clone()),
            MemberKey::Computed(expr) => Ok(match self.eval(expr)? {
                Value::Number(n) => format_number(n),
                other => other.to_js_string(),
            }),
        }
    }

    /// Evaluates a member or call. `None` means an optional link
    /// short-circuited.
    fn eval_chain(&mut self, expr: &Expr) -> Result<Option<Value>> {
        match expr {
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let Some(object) = self.eval_chain(object)? else {
                    return Ok(None);
                };
                if *optional && object.is_nullish() {
                    return Ok(None);
                }
                let key = self.member_key(property)?;
                get_member(&object, &key).map(Some)
            }
            Expr::Call {
                callee,
                arguments,
                optional,
            } => {
                let (this, function) = match callee.as_ref() {
                    Expr::Member {
                        object,
                        property,
                        optional: member_optional,
                    } => {
                        let Some(object) = self.eval_chain(object)? else {
                            return Ok(None);
                        };
                        if *member_optional && object.is_nullish() {
                            return Ok(None);
                        }
                        let key = self.member_key(property)?;
                        let function = get_member(&object, &key)?;
                        (Some((object, key)), function)
                    }
                    other => match self.eval_chain(other)? {
                        Some(function) => (None, function),
                        None => return Ok(None),
                    },
                };
                if *optional && function.is_nullish() {
                    return Ok(None);
                }
                let args = self.eval_items(arguments)?;
                let result = match (&this, &function) {
                    (_, Value::Function(f)) => f.call(&args).map_err(bind_error),
                    (Some((object, key)), _) => Err(bind_error(format!(
                        "{}.{} is not a function",
                        object.to_js_string(),
                        key
                    ))),
                    (None, other) => Err(bind_error(format!(
                        "{} is not a function",
                        other.to_js_string()
                    ))),
                };
                result.map(Some)
            }
            other => self.eval(other).map(Some),
        }
    }

    fn eval_unary(&mut self, operator: UnaryOperator, argument: &Expr) -> Result<Value> {
        if operator == UnaryOperator::Typeof {
            if let Expr::Identifier(name) = argument {
                if self.scope.lookup(name).is_none() && global(name).is_none() {
                    return Ok(Value::String("undefined".to_string()));
                }
            }
        }
        let value = self.eval(argument)?;
        Ok(match operator {
            UnaryOperator::UnaryNegation => Value::Number(-value.to_number()),
            UnaryOperator::UnaryPlus => Value::Number(value.to_number()),
            UnaryOperator::LogicalNot => Value::Bool(!value.is_truthy()),
            UnaryOperator::BitwiseNot => Value::Number(!to_int32(&value) as f64),
            UnaryOperator::Typeof => Value::String(value.type_of().to_string()),
            UnaryOperator::Void => Value::Undefined,
            UnaryOperator::Delete => {
                return Err(bind_error("delete is not supported in templates"))
            }
        })
    }

    fn eval_assign(&mut self, operator: AssignmentOperator, target: &Expr, value: &Expr) -> Result<Value> {
        self.require_statement("assignment")?;
        if !target.is_assignable() {
            return Err(bind_error("Invalid assignment target"));
        }
        let new_value = if operator == AssignmentOperator::Assign {
            self.eval(value)?
        } else if let Some(logical) = assignment_logical(operator) {
            let current = self.eval(target)?;
            if short_circuits(logical, &current) {
                return Ok(current);
            }
            self.eval(value)?
        } else if let Some(op) = assignment_binary(operator) {
            let current = self.eval(target)?;
            let right = self.eval(value)?;
            binary(op, &current, &right)?
        } else {
            return Err(bind_error("Unsupported assignment operator"));
        };
        self.assign(target, new_value.clone())?;
        Ok(new_value)
    }

    fn assign(&mut self, target: &Expr, value: Value) -> Result<()> {
        match target {
            Expr::Identifier(name) => {
                if self.scope.locals.contains_key(name) {
                    Rc::make_mut(&mut self.scope.locals).insert(name.clone(), value);
                    Ok(())
                } else {
                    Err(bind_error(format!("Cannot assign to undeclared variable '{}'", name)))
                }
            }
            Expr::Member { object, property, .. } => {
                let container = self.eval(object)?;
                let key = self.member_key(property)?;
                match container {
                    Value::Controller(handle) => handle.set(&key, value).map_err(bind_error),
                    Value::Element(element) => {
                        let dom = element
                            .dom()
                            .ok_or_else(|| bind_error("Element belongs to a dropped document"))?;
                        dom.set_property(element.node(), &key, value);
                        Ok(())
                    }
                    Value::Object(mut map) => {
                        Rc::make_mut(&mut map).insert(key, value);
                        self.assign(object, Value::Object(map))
                    }
                    Value::Array(mut items) => {
                        let index = key
                            .parse::<usize>()
                            .map_err(|_| bind_error(format!("Invalid array index '{}'", key)))?;
                        let items_mut = Rc::make_mut(&mut items);
                        if index >= items_mut.len() {
                            items_mut.resize(index + 1, Value::Undefined);
                        }
                        items_mut[index] = value;
                        self.assign(object, Value::Array(items))
                    }
                    other => Err(bind_error(format!(
                        "Cannot set properties of {} (setting '{}')",
                        other.to_js_string(),
                        key
                    ))),
                }
            }
            _ => Err(bind_error("Invalid assignment target")),
        }
    }

    fn closure(&self, arrow: &Rc<Arrow>) -> Value {
        let arrow = arrow.clone();
        let scope = self.scope.clone();
        let mode = self.mode;
        native("anonymous", move |args| {
            let locals = arrow
                .params
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), arg(args, i)));
            let mut interpreter = Interpreter::new(scope.with_locals(locals), mode);
            let result = match &arrow.body {
                ArrowBody::Expression(expr) => interpreter.eval(expr),
                ArrowBody::Block { statements, result } => {
                    let mut out = Ok(Value::Undefined);
                    for statement in statements {
                        if let Err(e) = interpreter.eval(statement) {
                            out = Err(e);
                            break;
                        }
                    }
                    match (out, result) {
                        (Ok(_), Some(result)) => interpreter.eval(result),
                        (out, _) => out,
                    }
                }
            };
            result.map_err(|e| e.message)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MEMBER ACCESS
// ═══════════════════════════════════════════════════════════════════════════════

fn get_member(object: &Value, key: &str) -> Result<Value> {
    match object {
        Value::Undefined | Value::Null => Err(bind_error(format!(
            "Cannot read properties of {} (reading '{}')",
            object.to_js_string(),
            key
        ))),
        Value::Controller(handle) => Ok(handle.get(key)),
        Value::Element(element) => Ok(element_member(element, key)),
        Value::Event(event) => Ok(event_member(event, key)),
        Value::Function(f) => Ok(match key {
            "name" => Value::String(f.name().to_string()),
            _ => Value::Undefined,
        }),
        Value::String(s) => Ok(string_method(s, key).unwrap_or_else(|| object.get_member(key))),
        Value::Array(items) => Ok(array_method(items, key).unwrap_or_else(|| object.get_member(key))),
        Value::Number(n) => Ok(number_method(*n, key).unwrap_or(Value::Undefined)),
        other => Ok(other.get_member(key)),
    }
}

fn element_member(element: &crate::dom::ElementRef, key: &str) -> Value {
    match key {
        "getAttribute" | "hasAttribute" => {
            let element = element.clone();
            let has = key == "hasAttribute";
            native(key, move |args| {
                let value = element.get_attribute(&arg(args, 0).to_js_string());
                Ok(if has { Value::Bool(!value.is_nullish()) } else { value })
            })
        }
        _ => element.get(key),
    }
}

fn event_member(event: &Rc<crate::dom::Event>, key: &str) -> Value {
    match key {
        "type" => Value::String(event.event_type().to_string()),
        "detail" => event.detail().clone(),
        "bubbles" => Value::Bool(event.bubbles()),
        "defaultPrevented" => Value::Bool(event.default_prevented()),
        "target" => event.target_ref().map_or(Value::Null, Value::Element),
        "currentTarget" => event.current_target_ref().map_or(Value::Null, Value::Element),
        "stopPropagation" => {
            let event = event.clone();
            native(key, move |_| {
                event.stop_propagation();
                Ok(Value::Undefined)
            })
        }
        "preventDefault" => {
            let event = event.clone();
            native(key, move |_| {
                event.prevent_default();
                Ok(Value::Undefined)
            })
        }
        _ => Value::Undefined,
    }
}

fn number_method(n: f64, key: &str) -> Option<Value> {
    Some(match key {
        "toFixed" => native(key, move |args| {
            let digits = arg(args, 0).to_number();
            let digits = if digits.is_nan() { 0 } else { digits.clamp(0.0, 100.0) as usize };
            Ok(Value::String(format!("{:.*}", digits, n)))
        }),
        "toString" => native(key, move |args| {
            let radix = arg(args, 0).to_number();
            if radix.is_nan() || radix == 10.0 || n.fract() != 0.0 {
                return Ok(Value::String(format_number(n)));
            }
            let radix = radix as u32;
            if !(2..=36).contains(&radix) {
                return Err("toString() radix must be between 2 and 36".to_string());
            }
            let mut value = n.abs() as u64;
            let mut digits = vec![];
            loop {
                digits.push(std::char::from_digit((value % radix as u64) as u32, radix).unwrap_or('0'));
                value /= radix as u64;
                if value == 0 {
                    break;
                }
            }
            if n < 0.0 {
                digits.push('-');
            }
            Ok(Value::String(digits.into_iter().rev().collect()))
        }),
        _ => return None,
    })
}

fn string_method(s: &str, key: &str) -> Option<Value> {
    let source = s.to_string();
    let text = {
        let source = source.clone();
        move |f: fn(&str, &[Value]) -> Value| {
            let s = source.clone();
            move |args: &[Value]| -> std::result::Result<Value, String> { Ok(f(&s, args)) }
        }
    };
    Some(match key {
        "includes" => native(key, text(|s, a| Value::Bool(s.contains(arg(a, 0).to_js_string().as_str())))),
        "startsWith" => native(key, text(|s, a| Value::Bool(s.starts_with(arg(a, 0).to_js_string().as_str())))),
        "endsWith" => native(key, text(|s, a| Value::Bool(s.ends_with(arg(a, 0).to_js_string().as_str())))),
        "indexOf" => native(
            key,
            text(|s, a| {
                let needle = arg(a, 0).to_js_string();
                Value::Number(
                    s.find(needle.as_str())
                        .map_or(-1.0, |byte| s[..byte].chars().count() as f64),
                )
            }),
        ),
        "toUpperCase" => native(key, text(|s, _| Value::String(s.to_uppercase()))),
        "toLowerCase" => native(key, text(|s, _| Value::String(s.to_lowercase()))),
        "trim" => native(key, text(|s, _| Value::String(s.trim().to_string()))),
        "trimStart" => native(key, text(|s, _| Value::String(s.trim_start().to_string()))),
        "trimEnd" => native(key, text(|s, _| Value::String(s.trim_end().to_string()))),
        "charAt" => native(
            key,
            text(|s, a| {
                let i = arg(a, 0).to_number();
                let i = if i.is_nan() { 0 } else { i as usize };
                Value::String(s.chars().nth(i).map(String::from).unwrap_or_default())
            }),
        ),
        "slice" | "substring" => native(
            key,
            text(|s, a| {
                let chars: Vec<char> = s.chars().collect();
                let start = relative_index(&arg(a, 0), chars.len(), 0);
                let end = relative_index(&arg(a, 1), chars.len(), chars.len());
                Value::String(if start < end { chars[start..end].iter().collect() } else { String::new() })
            }),
        ),
        "split" => native(
            key,
            text(|s, a| {
                let parts: Vec<Value> = match arg(a, 0) {
                    Value::Undefined => vec![Value::String(s.to_string())],
                    sep => {
                        let sep = sep.to_js_string();
                        if sep.is_empty() {
                            s.chars().map(|c| Value::String(c.to_string())).collect()
                        } else {
                            s.split(sep.as_str()).map(Value::from).collect()
                        }
                    }
                };
                Value::array(parts)
            }),
        ),
        "replace" => native(
            key,
            text(|s, a| Value::String(s.replacen(arg(a, 0).to_js_string().as_str(), &arg(a, 1).to_js_string(), 1))),
        ),
        "replaceAll" => native(
            key,
            text(|s, a| Value::String(s.replace(arg(a, 0).to_js_string().as_str(), &arg(a, 1).to_js_string()))),
        ),
        "repeat" => native(
            key,
            text(|s, a| Value::String(s.repeat(arg(a, 0).to_number().max(0.0) as usize))),
        ),
        "padStart" | "padEnd" => {
            let start = key == "padStart";
            let s = source.clone();
            native(key, move |a| {
                let width = arg(a, 0).to_number().max(0.0) as usize;
                let fill = match arg(a, 1) {
                    Value::Undefined => " ".to_string(),
                    other => other.to_js_string(),
                };
                let len = s.chars().count();
                if width <= len || fill.is_empty() {
                    return Ok(Value::String(s.clone()));
                }
                let pad: String = fill.chars().cycle().take(width - len).collect();
                Ok(Value::String(if start { format!("{}{}", pad, s) } else { format!("{}{}", s, pad) }))
            })
        }
        "concat" => native(
            key,
            text(|s, a| Value::String(a.iter().fold(s.to_string(), |acc, v| acc + &v.to_js_string()))),
        ),
        "toString" => native(key, text(|s, _| Value::String(s.to_string()))),
        _ => return None,
    })
}

fn call_callback(callback: &Value, args: &[Value]) -> std::result::Result<Value, String> {
    match callback {
        Value::Function(f) => f.call(args),
        other => Err(format!("{} is not a function", other.to_js_string())),
    }
}

#[derive(Clone, Copy)]
enum Walk {
    Map,
    Filter,
    Find,
    FindIndex,
    Some,
    Every,
    ForEach,
}

fn walk(items: Rc<Vec<Value>>, name: &str, walk: Walk) -> Value {
    native(name, move |args| {
        let callback = arg(args, 0);
        let this = Value::Array(items.clone());
        let mut out = vec![];
        for (i, item) in items.iter().enumerate() {
            let result = call_callback(&callback, &[item.clone(), Value::from(i), this.clone()])?;
            match walk {
                Walk::Map => out.push(result),
                Walk::Filter if result.is_truthy() => out.push(item.clone()),
                Walk::Find if result.is_truthy() => return Ok(item.clone()),
                Walk::FindIndex if result.is_truthy() => return Ok(Value::from(i)),
                Walk::Some if result.is_truthy() => return Ok(Value::Bool(true)),
                Walk::Every if !result.is_truthy() => return Ok(Value::Bool(false)),
                _ => {}
            }
        }
        Ok(match walk {
            Walk::Map | Walk::Filter => Value::array(out),
            Walk::Find | Walk::ForEach => Value::Undefined,
            Walk::FindIndex => Value::Number(-1.0),
            Walk::Some => Value::Bool(false),
            Walk::Every => Value::Bool(true),
        })
    })
}

fn array_method(items: &Rc<Vec<Value>>, key: &str) -> Option<Value> {
    let items = items.clone();
    Some(match key {
        "map" => walk(items, key, Walk::Map),
        "filter" => walk(items, key, Walk::Filter),
        "find" => walk(items, key, Walk::Find),
        "findIndex" => walk(items, key, Walk::FindIndex),
        "some" => walk(items, key, Walk::Some),
        "every" => walk(items, key, Walk::Every),
        "forEach" => walk(items, key, Walk::ForEach),
        "includes" => native(key, move |args| {
            let needle = arg(args, 0);
            Ok(Value::Bool(items.iter().any(|item| {
                item.strict_equals(&needle) || (item.to_number().is_nan() && needle.to_number().is_nan() && matches!((item, &needle), (Value::Number(_), Value::Number(_))))
            })))
        }),
        "indexOf" => native(key, move |args| {
            let needle = arg(args, 0);
            Ok(Value::Number(
                items.iter().position(|item| item.strict_equals(&needle)).map_or(-1.0, |i| i as f64),
            ))
        }),
        "join" => native(key, move |args| {
            let separator = match arg(args, 0) {
                Value::Undefined => ",".to_string(),
                other => other.to_js_string(),
            };
            Ok(Value::String(
                items
                    .iter()
                    .map(|v| if v.is_nullish() { String::new() } else { v.to_js_string() })
                    .collect::<Vec<_>>()
                    .join(&separator),
            ))
        }),
        "slice" => native(key, move |args| {
            let start = relative_index(&arg(args, 0), items.len(), 0);
            let end = relative_index(&arg(args, 1), items.len(), items.len());
            Ok(Value::array(if start < end { items[start..end].to_vec() } else { vec![] }))
        }),
        "at" => native(key, move |args| {
            let n = arg(args, 0).to_number();
            let n = if n.is_nan() { 0 } else { n.trunc() as i64 };
            let index = if n < 0 { items.len() as i64 + n } else { n };
            Ok(usize::try_from(index).ok().and_then(|i| items.get(i).cloned()).unwrap_or_default())
        }),
        "concat" => native(key, move |args| {
            let mut out = (*items).clone();
            for value in args {
                match value {
                    Value::Array(more) => out.extend(more.iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            Ok(Value::array(out))
        }),
        "reduce" => native(key, move |args| {
            let callback = arg(args, 0);
            let this = Value::Array(items.clone());
            let mut iter = items.iter().enumerate();
            let mut acc = match args.get(1) {
                Some(initial) => initial.clone(),
                None => match iter.next() {
                    Some((_, first)) => first.clone(),
                    None => return Err("Reduce of empty array with no initial value".to_string()),
                },
            };
            for (i, item) in iter {
                acc = call_callback(&callback, &[acc, item.clone(), Value::from(i), this.clone()])?;
            }
            Ok(acc)
        }),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{parse_expression, parse_program};

    fn eval_with(source: &str, scope: &Scope) -> Value {
        evaluate(&parse_expression(source).unwrap(), scope).unwrap()
    }

    fn eval(source: &str) -> Value {
        eval_with(source, &Scope::default())
    }

    #[test]
    fn test_arithmetic_and_strings() {
        assert_eq!(eval("1 + 2 * 3"), Value::Number(7.0));
        assert_eq!(eval("'a' + 1"), Value::from("a1"));
        assert_eq!(eval("`x${1 + 1}y`"), Value::from("x2y"));
        assert_eq!(eval("7 % 4 === 3 ? 'yes' : 'no'"), Value::from("yes"));
        assert_eq!(eval("'b' > 'a'"), Value::Bool(true));
    }

    #[test]
    fn test_logical_operators_return_operands() {
        assert_eq!(eval("0 || 'x'"), Value::from("x"));
        assert_eq!(eval("null ?? 3"), Value::Number(3.0));
        assert_eq!(eval("'' && 1"), Value::from(""));
    }

    #[test]
    fn test_locals_and_optional_chaining() {
        let scope = Scope::default().with_local(
            "user",
            Value::object([("name", Value::from("Ann")), ("tags", Value::array(vec![]))]),
        );
        assert_eq!(eval_with("user.name.toUpperCase()", &scope), Value::from("ANN"));
        assert_eq!(eval_with("user.address?.street", &scope), Value::Undefined);
        assert_eq!(eval_with("user.missing?.()", &scope), Value::Undefined);
        assert_eq!(eval_with("user.tags.length", &scope), Value::Number(0.0));
    }

    #[test]
    fn test_unknown_identifier_is_bind_error() {
        let err = evaluate(&parse_expression("nope + 1").unwrap(), &Scope::default()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Bind);
        assert!(err.message.contains("nope is not defined"));
        assert_eq!(eval("typeof nope"), Value::from("undefined"));
    }

    #[test]
    fn test_reading_property_of_undefined_fails() {
        assert!(evaluate(&parse_expression("undefined.x").unwrap(), &Scope::default()).is_err());
    }

    #[test]
    fn test_array_callbacks() {
        let scope = Scope::default().with_local(
            "items",
            Value::array(vec![Value::from(1), Value::from(2), Value::from(3)]),
        );
        assert_eq!(
            eval_with("items.map(x => x * 2).filter((x, i) => i > 0).length", &scope),
            Value::Number(2.0)
        );
        assert_eq!(eval_with("items.find(x => x > 1)", &scope), Value::Number(2.0));
        assert_eq!(eval_with("items.some(x => x > 2)", &scope), Value::Bool(true));
        assert_eq!(eval_with("items.every(x => x > 2)", &scope), Value::Bool(false));
    }

    #[test]
    fn test_globals() {
        assert_eq!(eval("Math.max(1, 5, 3)"), Value::Number(5.0));
        assert_eq!(eval("Math.round(2.5)"), Value::Number(3.0));
        assert_eq!(eval("parseInt('42px')"), Value::Number(42.0));
        assert_eq!(eval("parseFloat('1.5e1x')"), Value::Number(15.0));
        assert_eq!(eval("JSON.stringify({a: [1, 'b']})"), Value::from(r#"{"a":[1,"b"]}"#));
        assert_eq!(eval("Object.keys({a: 1, b: 2}).join('-')"), Value::from("a-b"));
        assert_eq!(eval("(3.14159).toFixed(2)"), Value::from("3.14"));
        assert_eq!(eval("'a,b'.split(',')[1]"), Value::from("b"));
        assert_eq!(eval("'7'.padStart(3, '0')"), Value::from("007"));
    }

    #[test]
    fn test_read_mode_rejects_assignment() {
        let scope = Scope::default().with_local("x", Value::from(1));
        let err = evaluate(&parse_expression("x = 2").unwrap(), &scope).unwrap_err();
        assert!(err.message.contains("must not mutate"));
    }

    #[test]
    fn test_statements_assign_locals_copy_on_write() {
        let original = Value::object([("n", Value::from(1))]);
        let scope = Scope::default().with_local("state", original.clone());
        let program = parse_program("state.n += 2; state.n").unwrap();
        assert_eq!(execute(&program, &scope).unwrap(), Value::Number(3.0));
        assert_eq!(original.get_member("n"), Value::Number(1.0));
    }

    #[test]
    fn test_update_expressions() {
        let scope = Scope::default().with_local("i", Value::from(1));
        assert_eq!(execute(&parse_program("i++").unwrap(), &scope).unwrap(), Value::Number(1.0));
        assert_eq!(execute(&parse_program("++i; i").unwrap(), &scope).unwrap(), Value::Number(2.0));
    }
}
