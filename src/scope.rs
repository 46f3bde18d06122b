use std::collections::HashSet;

use crate::eval::is_global;
use crate::expr::{ArrowBody, Expr, MemberKey, ObjectEntry, Program};

lazy_static::lazy_static! {
    /// Names the template runtime provides without a declaration.
    pub static ref TEMPLATE_IMPLICITS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("$event");
        s
    };
}

/// Compile-time check of the identifiers a template expression references.
/// Unknown names are reported, not rejected: they fail at render time as
/// bind errors instead.
pub struct ScopeValidator {
    pub allowed_locals: HashSet<String>,
    pub component: String,
}

impl ScopeValidator {
    pub fn new(component: &str) -> Self {
        Self {
            allowed_locals: HashSet::new(),
            component: component.to_string(),
        }
    }

    pub fn add_locals(&mut self, locals: impl IntoIterator<Item = String>) {
        self.allowed_locals.extend(locals);
    }

    /// Returns every unknown identifier in first-seen order.
    pub fn unknown_identifiers(&self, expr: &Expr) -> Vec<String> {
        let mut collector = ReferenceCollector::default();
        collector.visit(expr);
        let mut seen = HashSet::new();
        collector
            .references
            .into_iter()
            .filter(|name| {
                !self.allowed_locals.contains(name)
                    && !TEMPLATE_IMPLICITS.contains(name.as_str())
                    && !is_global(name)
            })
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    /// Logs a warning per unknown identifier in `expr`.
    pub fn verify(&self, expr: &Expr, source: &str) -> usize {
        let unknown = self.unknown_identifiers(expr);
        for ident in &unknown {
            tracing::warn!(
                component = %self.component,
                expression = source,
                "Unknown identifier '{}'. Use `this.{}` for controller properties.",
                ident,
                ident
            );
        }
        unknown.len()
    }

    /// Checks every statement of an event program; returns the unknown count.
    pub fn verify_program(&self, program: &Program) -> usize {
        program
            .statements
            .iter()
            .map(|statement| self.verify(statement, &program.source))
            .sum()
    }
}

/// Collects free identifier references; arrow parameters are bound for
/// their body only.
#[derive(Default)]
struct ReferenceCollector {
    references: Vec<String>,
    bindings: Vec<String>,
}

impl ReferenceCollector {
    fn visit(&mut self, expr: &Expr) {
        match expr {
            Expr::Identifier(name) => {
                if !self.bindings.contains(name) {
                    self.references.push(name.clone());
                }
            }
            Expr::Literal(_) | Expr::This => {}
            Expr::Template { expressions, .. } | Expr::Sequence(expressions) => {
                expressions.iter().for_each(|e| self.visit(e));
            }
            Expr::Array(items) => items.iter().for_each(|item| self.visit(&item.expr)),
            Expr::Object(entries) => {
                for entry in entries {
                    match entry {
                        ObjectEntry::Property { key, value } => {
                            self.visit_key(key);
                            self.visit(value);
                        }
                        ObjectEntry::Spread(e) => self.visit(e),
                    }
                }
            }
            Expr::Member { object, property, .. } => {
                self.visit(object);
                self.visit_key(property);
            }
            Expr::Call { callee, arguments, .. } => {
                self.visit(callee);
                arguments.iter().for_each(|item| self.visit(&item.expr));
            }
            Expr::Chain(inner) => self.visit(inner),
            Expr::Unary { argument, .. } => self.visit(argument),
            Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
                self.visit(left);
                self.visit(right);
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                self.visit(test);
                self.visit(consequent);
                self.visit(alternate);
            }
            Expr::Assign { target, value, .. } => {
                self.visit(target);
                self.visit(value);
            }
            Expr::Update { target, .. } => self.visit(target),
            Expr::Arrow(arrow) => {
                let depth = self.bindings.len();
                self.bindings.extend(arrow.params.iter().cloned());
                match &arrow.body {
                    ArrowBody::Expression(e) => self.visit(e),
                    ArrowBody::Block { statements, result } => {
                        statements.iter().for_each(|e| self.visit(e));
                        if let Some(result) = result {
                            self.visit(result);
                        }
                    }
                }
                self.bindings.truncate(depth);
            }
        }
    }

    fn visit_key(&mut self, key: &MemberKey) {
        if let MemberKey::Computed(e) = key {
            self.visit(e);
        }
    }
}
