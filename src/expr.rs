//! Template Expression Module for the nlib rendering engine
//!
//! Parses the JS-shaped expressions found in bindings with oxc and lowers
//! them into an owned tree that outlives the parser arena. The evaluator in
//! `eval.rs` interprets that tree on every render.

use oxc_allocator::Allocator;
use oxc_ast::ast::{
    self, Argument, ArrayExpressionElement, AssignmentTarget, ChainElement, Expression,
    ObjectPropertyKind, PropertyKey, SimpleAssignmentTarget, Statement,
};
use oxc_ast_visit::Visit;
use oxc_parser::Parser;
use oxc_span::SourceType;
use std::rc::Rc;

pub use oxc_syntax::operator::{
    AssignmentOperator, BinaryOperator, LogicalOperator, UnaryOperator, UpdateOperator,
};

use crate::error::{EngineError, Result, ERR_PARSE_EXPRESSION};
use crate::value::Value;

// ═══════════════════════════════════════════════════════════════════════════════
// OWNED AST
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Template {
        quasis: Vec<String>,
        expressions: Vec<Expr>,
    },
    Identifier(String),
    This,
    Array(Vec<ArrayItem>),
    Object(Vec<ObjectEntry>),
    Member {
        object: Box<Expr>,
        property: MemberKey,
        optional: bool,
    },
    Call {
        callee: Box<Expr>,
        arguments: Vec<ArrayItem>,
        optional: bool,
    },
    /// Boundary of an optional chain: a short-circuit anywhere inside
    /// yields `undefined` for the whole chain.
    Chain(Box<Expr>),
    Unary {
        operator: UnaryOperator,
        argument: Box<Expr>,
    },
    Binary {
        operator: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        operator: LogicalOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
    Assign {
        operator: AssignmentOperator,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Update {
        operator: UpdateOperator,
        prefix: bool,
        target: Box<Expr>,
    },
    Sequence(Vec<Expr>),
    Arrow(Rc<Arrow>),
}

#[derive(Debug, Clone)]
pub enum MemberKey {
    Static(String),
    Computed(Box<Expr>),
}

#[derive(Debug, Clone)]
pub struct ArrayItem {
    pub expr: Expr,
    pub spread: bool,
}

#[derive(Debug, Clone)]
pub enum ObjectEntry {
    Property { key: MemberKey, value: Expr },
    Spread(Expr),
}

#[derive(Debug)]
pub struct Arrow {
    pub params: Vec<String>,
    pub body: ArrowBody,
}

#[derive(Debug)]
pub enum ArrowBody {
    Expression(Expr),
    /// Expression statements followed by an optional `return`.
    Block { statements: Vec<Expr>, result: Option<Expr> },
}

impl Expr {
    /// True if the expression can appear on the left of `=`.
    pub fn is_assignable(&self) -> bool {
        matches!(self, Expr::Identifier(_) | Expr::Member { .. })
    }
}

/// A parsed binding: the source text plus one expression per `;`
/// separated statement.
#[derive(Debug, Clone)]
pub struct Program {
    pub source: String,
    pub statements: Vec<Expr>,
}

impl Program {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSING
// ═══════════════════════════════════════════════════════════════════════════════

fn expression_error(source: &str, message: impl Into<String>) -> EngineError {
    EngineError::parse(ERR_PARSE_EXPRESSION, message).context(source.to_string())
}

/// Parses a single expression.
pub fn parse_expression(source: &str) -> Result<Expr> {
    let allocator = Allocator::default();
    let source_type = SourceType::default().with_typescript(true);
    let ret = Parser::new(&allocator, source, source_type).parse_expression();
    match ret {
        Ok(expr) => lower(&expr, source),
        Err(errors) => Err(expression_error(
            source,
            format!("Invalid expression syntax: {:?}", errors),
        )),
    }
}

/// Parses an event statement list. Every statement must be an expression.
pub fn parse_program(source: &str) -> Result<Program> {
    let allocator = Allocator::default();
    let source_type = SourceType::default().with_typescript(true);
    let ret = Parser::new(&allocator, source, source_type).parse();
    if !ret.errors.is_empty() {
        return Err(expression_error(
            source,
            format!("Invalid statement syntax: {:?}", ret.errors),
        ));
    }

    // A leading string statement parses as a directive.
    let mut statements: Vec<Expr> = ret
        .program
        .directives
        .iter()
        .map(|directive| Expr::Literal(Value::from(directive.expression.value.as_str())))
        .collect();
    for statement in &ret.program.body {
        match statement {
            Statement::ExpressionStatement(stmt) => statements.push(lower(&stmt.expression, source)?),
            Statement::EmptyStatement(_) => {}
            _ => return Err(expression_error(source, "Only expression statements are allowed in event bindings")),
        }
    }
    Ok(Program {
        source: source.to_string(),
        statements,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOWERING
// ═══════════════════════════════════════════════════════════════════════════════

struct ParamCollector {
    names: Vec<String>,
}

impl<'a> Visit<'a> for ParamCollector {
    fn visit_binding_identifier(&mut self, ident: &ast::BindingIdentifier<'a>) {
        self.names.push(ident.name.to_string());
    }
}

fn boxed(expr: &Expression, source: &str) -> Result<Box<Expr>> {
    Ok(Box::new(lower(expr, source)?))
}

fn lower_arguments(arguments: &[Argument], source: &str) -> Result<Vec<ArrayItem>> {
    arguments
        .iter()
        .map(|arg| match arg {
            Argument::SpreadElement(spread) => Ok(ArrayItem {
                expr: lower(&spread.argument, source)?,
                spread: true,
            }),
            other => match other.as_expression() {
                Some(expr) => Ok(ArrayItem {
                    expr: lower(expr, source)?,
                    spread: false,
                }),
                None => Err(expression_error(source, "Unsupported call argument")),
            },
        })
        .collect()
}

fn lower_static_member(member: &ast::StaticMemberExpression, source: &str) -> Result<Expr> {
    Ok(Expr::Member {
        object: boxed(&member.object, source)?,
        property: MemberKey::Static(member.property.name.to_string()),
        optional: member.optional,
    })
}

fn lower_computed_member(member: &ast::ComputedMemberExpression, source: &str) -> Result<Expr> {
    Ok(Expr::Member {
        object: boxed(&member.object, source)?,
        property: MemberKey::Computed(boxed(&member.expression, source)?),
        optional: member.optional,
    })
}

fn lower_call(call: &ast::CallExpression, source: &str) -> Result<Expr> {
    Ok(Expr::Call {
        callee: boxed(&call.callee, source)?,
        arguments: lower_arguments(&call.arguments, source)?,
        optional: call.optional,
    })
}

fn lower_simple_target(target: &SimpleAssignmentTarget, source: &str) -> Result<Expr> {
    match target {
        SimpleAssignmentTarget::AssignmentTargetIdentifier(id) => {
            Ok(Expr::Identifier(id.name.to_string()))
        }
        SimpleAssignmentTarget::StaticMemberExpression(member) => lower_static_member(member, source),
        SimpleAssignmentTarget::ComputedMemberExpression(member) => {
            lower_computed_member(member, source)
        }
        _ => Err(expression_error(source, "Unsupported assignment target")),
    }
}

fn lower_assignment_target(target: &AssignmentTarget, source: &str) -> Result<Expr> {
    match target {
        AssignmentTarget::AssignmentTargetIdentifier(id) => Ok(Expr::Identifier(id.name.to_string())),
        AssignmentTarget::StaticMemberExpression(member) => lower_static_member(member, source),
        AssignmentTarget::ComputedMemberExpression(member) => lower_computed_member(member, source),
        _ => Err(expression_error(
            source,
            "Destructuring assignments are not supported in templates",
        )),
    }
}

fn lower_arrow(arrow: &ast::ArrowFunctionExpression, source: &str) -> Result<Expr> {
    let mut params = vec![];
    for param in &arrow.params.items {
        let mut collector = ParamCollector { names: vec![] };
        collector.visit_formal_parameter(param);
        match collector.names.as_slice() {
            [name] => params.push(name.clone()),
            _ => {
                return Err(expression_error(
                    source,
                    "Arrow function parameters must be plain identifiers",
                ))
            }
        }
    }
    if arrow.params.rest.is_some() {
        return Err(expression_error(source, "Rest parameters are not supported"));
    }

    let body = if arrow.expression {
        match arrow.body.statements.first() {
            Some(Statement::ExpressionStatement(stmt)) => {
                ArrowBody::Expression(lower(&stmt.expression, source)?)
            }
            _ => return Err(expression_error(source, "Malformed arrow function body")),
        }
    } else {
        let mut statements = vec![];
        let mut result = None;
        for stmt in &arrow.body.statements {
            match stmt {
                Statement::ExpressionStatement(stmt) => {
                    statements.push(lower(&stmt.expression, source)?)
                }
                Statement::ReturnStatement(ret) => {
                    if let Some(argument) = &ret.argument {
                        result = Some(lower(argument, source)?);
                    }
                    break;
                }
                _ => {
                    return Err(expression_error(
                        source,
                        "Only expression and return statements are allowed in arrow functions",
                    ))
                }
            }
        }
        ArrowBody::Block { statements, result }
    };

    Ok(Expr::Arrow(Rc::new(Arrow { params, body })))
}

fn lower(expr: &Expression, source: &str) -> Result<Expr> {
    match expr {
        Expression::BooleanLiteral(lit) => Ok(Expr::Literal(Value::Bool(lit.value))),
        Expression::NullLiteral(_) => Ok(Expr::Literal(Value::Null)),
        Expression::NumericLiteral(lit) => Ok(Expr::Literal(Value::Number(lit.value))),
        Expression::StringLiteral(lit) => Ok(Expr::Literal(Value::String(lit.value.to_string()))),
        Expression::TemplateLiteral(tpl) => {
            let quasis = tpl
                .quasis
                .iter()
                .map(|q| {
                    q.value
                        .cooked
                        .as_ref()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| q.value.raw.to_string())
                })
                .collect();
            let expressions = tpl
                .expressions
                .iter()
                .map(|e| lower(e, source))
                .collect::<Result<Vec<_>>>()?;
            Ok(Expr::Template { quasis, expressions })
        }
        Expression::Identifier(id) => Ok(match id.name.as_str() {
            "undefined" => Expr::Literal(Value::Undefined),
            "NaN" => Expr::Literal(Value::Number(f64::NAN)),
            "Infinity" => Expr::Literal(Value::Number(f64::INFINITY)),
            name => Expr::Identifier(name.to_string()),
        }),
        Expression::ThisExpression(_) => Ok(Expr::This),
        Expression::ArrayExpression(array) => {
            let mut items = vec![];
            for element in &array.elements {
                match element {
                    ArrayExpressionElement::SpreadElement(spread) => items.push(ArrayItem {
                        expr: lower(&spread.argument, source)?,
                        spread: true,
                    }),
                    ArrayExpressionElement::Elision(_) => items.push(ArrayItem {
                        expr: Expr::Literal(Value::Undefined),
                        spread: false,
                    }),
                    other => match other.as_expression() {
                        Some(e) => items.push(ArrayItem {
                            expr: lower(e, source)?,
                            spread: false,
                        }),
                        None => return Err(expression_error(source, "Unsupported array element")),
                    },
                }
            }
            Ok(Expr::Array(items))
        }
        Expression::ObjectExpression(object) => {
            let mut entries = vec![];
            for property in &object.properties {
                match property {
                    ObjectPropertyKind::ObjectProperty(p) => {
                        let key = match &p.key {
                            PropertyKey::StaticIdentifier(id) if !p.computed => {
                                MemberKey::Static(id.name.to_string())
                            }
                            other => match other.as_expression() {
                                Some(e) => MemberKey::Computed(boxed(e, source)?),
                                None => {
                                    return Err(expression_error(source, "Unsupported object key"))
                                }
                            },
                        };
                        entries.push(ObjectEntry::Property {
                            key,
                            value: lower(&p.value, source)?,
                        });
                    }
                    ObjectPropertyKind::SpreadProperty(spread) => {
                        entries.push(ObjectEntry::Spread(lower(&spread.argument, source)?));
                    }
                }
            }
            Ok(Expr::Object(entries))
        }
        Expression::StaticMemberExpression(member) => lower_static_member(member, source),
        Expression::ComputedMemberExpression(member) => lower_computed_member(member, source),
        Expression::CallExpression(call) => lower_call(call, source),
        Expression::ChainExpression(chain) => {
            let inner = match &chain.expression {
                ChainElement::CallExpression(call) => lower_call(call, source)?,
                ChainElement::StaticMemberExpression(member) => lower_static_member(member, source)?,
                ChainElement::ComputedMemberExpression(member) => {
                    lower_computed_member(member, source)?
                }
                ChainElement::TSNonNullExpression(non_null) => lower(&non_null.expression, source)?,
                _ => return Err(expression_error(source, "Unsupported optional chain")),
            };
            Ok(Expr::Chain(Box::new(inner)))
        }
        Expression::UnaryExpression(unary) => Ok(Expr::Unary {
            operator: unary.operator,
            argument: boxed(&unary.argument, source)?,
        }),
        Expression::BinaryExpression(binary) => Ok(Expr::Binary {
            operator: binary.operator,
            left: boxed(&binary.left, source)?,
            right: boxed(&binary.right, source)?,
        }),
        Expression::LogicalExpression(logical) => Ok(Expr::Logical {
            operator: logical.operator,
            left: boxed(&logical.left, source)?,
            right: boxed(&logical.right, source)?,
        }),
        Expression::ConditionalExpression(cond) => Ok(Expr::Conditional {
            test: boxed(&cond.test, source)?,
            consequent: boxed(&cond.consequent, source)?,
            alternate: boxed(&cond.alternate, source)?,
        }),
        Expression::AssignmentExpression(assign) => Ok(Expr::Assign {
            operator: assign.operator,
            target: Box::new(lower_assignment_target(&assign.left, source)?),
            value: boxed(&assign.right, source)?,
        }),
        Expression::UpdateExpression(update) => Ok(Expr::Update {
            operator: update.operator,
            prefix: update.prefix,
            target: Box::new(lower_simple_target(&update.argument, source)?),
        }),
        Expression::SequenceExpression(seq) => Ok(Expr::Sequence(
            seq.expressions
                .iter()
                .map(|e| lower(e, source))
                .collect::<Result<Vec<_>>>()?,
        )),
        Expression::ParenthesizedExpression(paren) => lower(&paren.expression, source),
        Expression::ArrowFunctionExpression(arrow) => lower_arrow(arrow, source),
        Expression::TSAsExpression(e) => lower(&e.expression, source),
        Expression::TSSatisfiesExpression(e) => lower(&e.expression, source),
        Expression::TSNonNullExpression(e) => lower(&e.expression, source),
        _ => Err(expression_error(
            source,
            "Unsupported syntax in template expression",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_chain() {
        let expr = parse_expression("this.user.name").unwrap();
        match expr {
            Expr::Member {
                object,
                property: MemberKey::Static(name),
                optional: false,
            } => {
                assert_eq!(name, "name");
                assert!(matches!(*object, Expr::Member { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_optional_chain_is_wrapped() {
        let expr = parse_expression("this.a?.b").unwrap();
        assert!(matches!(expr, Expr::Chain(_)));
    }

    #[test]
    fn test_globals_become_literals() {
        assert!(matches!(
            parse_expression("undefined").unwrap(),
            Expr::Literal(Value::Undefined)
        ));
        assert!(matches!(
            parse_expression("(1)").unwrap(),
            Expr::Literal(Value::Number(n)) if n == 1.0
        ));
    }

    #[test]
    fn test_arrow_params() {
        let expr = parse_expression("(a, b) => a + b").unwrap();
        let Expr::Arrow(arrow) = expr else {
            panic!("expected arrow");
        };
        assert_eq!(arrow.params, vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(arrow.body, ArrowBody::Expression(Expr::Binary { .. })));
    }

    #[test]
    fn test_program_splits_top_level_semicolons() {
        let program = parse_program("this.a = 1; this.log('x;y'); ").unwrap();
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(program.statements[0], Expr::Assign { .. }));
    }

    #[test]
    fn test_program_keeps_semicolons_inside_template_literals() {
        let program = parse_program("this.log(`a;${ [1, 2].join(';') }`); this.c++").unwrap();
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(program.statements[0], Expr::Call { .. }));
        assert!(matches!(program.statements[1], Expr::Update { .. }));
    }

    #[test]
    fn test_program_rejects_declarations() {
        assert!(parse_program("let x = 1").is_err());
        assert!(parse_program("").unwrap().is_empty());
    }

    #[test]
    fn test_syntax_errors_are_parse_errors() {
        let err = parse_expression("this.a +").unwrap_err();
        assert_eq!(err.code, ERR_PARSE_EXPRESSION);
        assert!(parse_expression("new Foo()").is_err());
        assert!(parse_expression("({a} = b)").is_err());
    }
}
