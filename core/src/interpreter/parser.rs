//! PEST-based parser for the guest language
//!
//! Produces the AST in [`super::ast`], tagging every node with its source line.

use std::rc::Rc;

use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;
use thiserror::Error;

use super::ast::{Arg, BinaryOp, Expr, ExprKind, Program};

/* ===================== PEST Parser ===================== */

#[derive(Parser)]
#[grammar = "interpreter/guest.pest"]
struct GuestParser;

/* ===================== Error Types ===================== */

#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("{0}")]
    PestError(String, Option<u32>),
    #[error("{0}")]
    BuildError(String, Option<u32>),
}

impl ParseError {
    /// 1-based line of the failure, when known
    pub fn line(&self) -> Option<u32> {
        match self {
            ParseError::PestError(_, line) | ParseError::BuildError(_, line) => *line,
        }
    }
}

impl From<pest::error::Error<Rule>> for ParseError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        let line = match err.line_col {
            pest::error::LineColLocation::Pos((line, _)) => line,
            pest::error::LineColLocation::Span((line, _), _) => line,
        };
        ParseError::PestError(err.to_string(), Some(line as u32))
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/* ===================== Public API ===================== */

/// Parse `code` into a program whose positions are attributed to `source`.
/// `line_offset` is added to every line number.
pub fn parse_program(code: &str, source: &str, line_offset: u32) -> ParseResult<Program> {
    let mut pairs = GuestParser::parse(Rule::program, code).map_err(|err| {
        let mut err = ParseError::from(err);
        if let ParseError::PestError(_, Some(line)) = &mut err {
            *line += line_offset;
        }
        err
    })?;
    let builder = Builder { line_offset };
    let program = next_pair(&mut pairs, "program")?;

    let mut body = Vec::new();
    for pair in program.into_inner() {
        match pair.as_rule() {
            Rule::statements => body = builder.statements(pair)?,
            Rule::EOI => {}
            other => return Err(unexpected(other, &pair, line_offset)),
        }
    }

    Ok(Program {
        source: Rc::from(source),
        body,
    })
}

/// Parse a single snippet attributed to `<text>`
pub fn parse(code: &str) -> ParseResult<Program> {
    parse_program(code, "<text>", 0)
}

/* ===================== AST Builder ===================== */

struct Builder {
    line_offset: u32,
}

fn next_pair<'i>(pairs: &mut Pairs<'i, Rule>, what: &str) -> ParseResult<Pair<'i, Rule>> {
    pairs
        .next()
        .ok_or_else(|| ParseError::BuildError(format!("Missing {}", what), None))
}

fn unexpected(rule: Rule, pair: &Pair<Rule>, line_offset: u32) -> ParseError {
    ParseError::BuildError(
        format!("Unexpected {:?}", rule),
        Some(pair.line_col().0 as u32 + line_offset),
    )
}

type BuildFn = for<'i> fn(&Builder, Pair<'i, Rule>) -> ParseResult<Expr>;

impl Builder {
    fn line(&self, pair: &Pair<Rule>) -> u32 {
        pair.line_col().0 as u32 + self.line_offset
    }

    fn statements(&self, pair: Pair<Rule>) -> ParseResult<Vec<Expr>> {
        pair.into_inner().map(|stmt| self.statement(stmt)).collect()
    }

    fn statement(&self, pair: Pair<Rule>) -> ParseResult<Expr> {
        let line = self.line(&pair);
        let inner = next_pair(&mut pair.into_inner(), "statement")?;
        match inner.as_rule() {
            Rule::assignment => {
                let mut parts = inner.into_inner();
                let name = next_pair(&mut parts, "assignment target")?.as_str().to_string();
                let value = self.expr(next_pair(&mut parts, "assigned value")?)?;
                Ok(Expr::new(
                    ExprKind::Assign {
                        name,
                        value: Box::new(value),
                    },
                    line,
                ))
            }
            Rule::expr => self.expr(inner),
            other => Err(unexpected(other, &inner, self.line_offset)),
        }
    }

    fn expr(&self, pair: Pair<Rule>) -> ParseResult<Expr> {
        let comparison = next_pair(&mut pair.into_inner(), "expression")?;
        self.binary_chain(comparison, Builder::additive)
    }

    fn additive(&self, pair: Pair<Rule>) -> ParseResult<Expr> {
        self.binary_chain(pair, Builder::multiplicative)
    }

    fn multiplicative(&self, pair: Pair<Rule>) -> ParseResult<Expr> {
        self.binary_chain(pair, Builder::unary)
    }

    /// Left fold of `operand (op operand)*`
    fn binary_chain(&self, pair: Pair<Rule>, operand: BuildFn) -> ParseResult<Expr> {
        let mut inner = pair.into_inner();
        let mut lhs = operand(self, next_pair(&mut inner, "operand")?)?;
        while let Some(op_pair) = inner.next() {
            let op = match op_pair.as_str() {
                "+" => BinaryOp::Add,
                "-" => BinaryOp::Sub,
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                "==" => BinaryOp::Eq,
                "!=" => BinaryOp::Ne,
                "<" => BinaryOp::Lt,
                "<=" => BinaryOp::Le,
                ">" => BinaryOp::Gt,
                ">=" => BinaryOp::Ge,
                other => {
                    return Err(ParseError::BuildError(
                        format!("Unknown operator: {}", other),
                        Some(self.line(&op_pair)),
                    ))
                }
            };
            let rhs = operand(self, next_pair(&mut inner, "operand")?)?;
            let line = lhs.line;
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            );
        }
        Ok(lhs)
    }

    fn unary(&self, pair: Pair<Rule>) -> ParseResult<Expr> {
        let line = self.line(&pair);
        let mut negations = 0;
        let mut operand = None;
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::neg => negations += 1,
                Rule::postfix => operand = Some(self.postfix(inner)?),
                other => return Err(unexpected(other, &inner, self.line_offset)),
            }
        }
        let mut expr = operand
            .ok_or_else(|| ParseError::BuildError("Missing operand".to_string(), Some(line)))?;
        for _ in 0..negations {
            expr = Expr::new(ExprKind::Neg(Box::new(expr)), line);
        }
        Ok(expr)
    }

    fn postfix(&self, pair: Pair<Rule>) -> ParseResult<Expr> {
        let mut inner = pair.into_inner();
        let mut expr = self.primary(next_pair(&mut inner, "primary")?)?;
        for suffix in inner {
            let line = expr.line;
            expr = match suffix.as_rule() {
                Rule::index2 => {
                    let index = self.expr(next_pair(&mut suffix.into_inner(), "index")?)?;
                    Expr::new(
                        ExprKind::Index2 {
                            target: Box::new(expr),
                            index: Box::new(index),
                        },
                        line,
                    )
                }
                Rule::dollar => {
                    let name = next_pair(&mut suffix.into_inner(), "member name")?;
                    Expr::new(
                        ExprKind::Dollar {
                            target: Box::new(expr),
                            name: name.as_str().to_string(),
                        },
                        line,
                    )
                }
                Rule::call_args => {
                    let args = suffix
                        .into_inner()
                        .map(|arg| self.arg(arg))
                        .collect::<ParseResult<Vec<_>>>()?;
                    Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        line,
                    )
                }
                other => return Err(unexpected(other, &suffix, self.line_offset)),
            };
        }
        Ok(expr)
    }

    fn arg(&self, pair: Pair<Rule>) -> ParseResult<Arg> {
        let inner = next_pair(&mut pair.into_inner(), "argument")?;
        match inner.as_rule() {
            Rule::named_arg => {
                let mut parts = inner.into_inner();
                let name = next_pair(&mut parts, "argument name")?.as_str().to_string();
                let value = self.expr(next_pair(&mut parts, "argument value")?)?;
                Ok(Arg {
                    name: Some(name),
                    value,
                })
            }
            _ => Ok(Arg {
                name: None,
                value: self.expr(inner)?,
            }),
        }
    }

    fn primary(&self, pair: Pair<Rule>) -> ParseResult<Expr> {
        let line = self.line(&pair);
        let kind = match pair.as_rule() {
            Rule::number => {
                let value = pair.as_str().parse::<f64>().map_err(|e| {
                    ParseError::BuildError(format!("Invalid number: {}", e), Some(line))
                })?;
                ExprKind::Num(value)
            }
            Rule::string => {
                let raw = next_pair(&mut pair.into_inner(), "string body")?;
                ExprKind::Str(unescape(raw.as_str()))
            }
            Rule::true_lit => ExprKind::Bool(true),
            Rule::false_lit => ExprKind::Bool(false),
            Rule::null_lit => ExprKind::Null,
            Rule::ident => ExprKind::Ident(pair.as_str().to_string()),
            Rule::expr => return self.expr(pair),
            Rule::block => ExprKind::Block(self.statements(next_pair(
                &mut pair.into_inner(),
                "block body",
            )?)?),
            Rule::if_expr => {
                let mut parts = pair.into_inner();
                let cond = self.expr(next_pair(&mut parts, "condition")?)?;
                let then = self.expr(next_pair(&mut parts, "if branch")?)?;
                let otherwise = match parts.next() {
                    Some(other) => Some(Box::new(self.expr(other)?)),
                    None => None,
                };
                ExprKind::If {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    otherwise,
                }
            }
            Rule::function_def => {
                let mut parts = pair.into_inner();
                let params = next_pair(&mut parts, "parameters")?
                    .into_inner()
                    .map(|p| p.as_str().to_string())
                    .collect();
                let body = self.expr(next_pair(&mut parts, "function body")?)?;
                ExprKind::Function {
                    params,
                    body: Rc::new(body),
                }
            }
            other => return Err(unexpected(other, &pair, self.line_offset)),
        };
        Ok(Expr::new(kind, line))
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
