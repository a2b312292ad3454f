// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Recursive-descent parser producing the expression tree.
//!
//! Symbol resolution, type checking and prerequisite attachment happen
//! here; the output of a successful parse is ready for simplification.
//! Address-set and port-group names are reported through
//! [`ParseResult`] even when parsing fails later in the string, so that
//! the caller can register the dependency and reprocess the flow once
//! the missing object appears.

use crate::ast::{AddrSets, Cmp, CmpValue, Condition, Const, ConstSet, Expr, FieldRef, PortGroups,
                 Relop};
use crate::lex::{Lexer, Token};
use crate::symtab::{Symbol, SymbolKind, Symtab};
use crate::ExprError;
use ahash::RandomState;
use oflow::AsInfo;
use std::collections::{HashMap, HashSet};

/// Output of [`parse_match`]: the tree plus the external names the
/// expression referenced. The reference sets are valid even on error.
pub struct ParseResult {
    pub result: Result<Expr, ExprError>,
    /// Address set name → number of occurrences in the match.
    pub addr_sets_ref: HashMap<String, usize, RandomState>,
    pub port_groups_ref: HashSet<String, RandomState>,
}

/// Parse a match string against the symbol table and the current
/// address-set and port-group maps.
#[must_use]
pub fn parse_match(
    input: &str,
    symtab: &Symtab,
    addr_sets: &AddrSets<'_>,
    port_groups: &PortGroups,
) -> ParseResult {
    let mut parser = Parser {
        lexer: Lexer::new(input),
        lookahead: None,
        symtab,
        addr_sets: Some(addr_sets),
        port_groups: Some(port_groups),
        addr_sets_ref: HashMap::with_hasher(RandomState::with_seed(0)),
        port_groups_ref: HashSet::with_hasher(RandomState::with_seed(0)),
    };
    let result = parser.parse_full();
    ParseResult {
        result,
        addr_sets_ref: parser.addr_sets_ref,
        port_groups_ref: parser.port_groups_ref,
    }
}

/// Parse an internal expression (symbol prerequisites, predicate
/// expansions, action prerequisites): no sets, no groups.
pub fn parse_internal(input: &str, symtab: &Symtab) -> Result<Expr, ExprError> {
    let mut parser = Parser {
        lexer: Lexer::new(input),
        lookahead: None,
        symtab,
        addr_sets: None,
        port_groups: None,
        addr_sets_ref: HashMap::with_hasher(RandomState::with_seed(0)),
        port_groups_ref: HashSet::with_hasher(RandomState::with_seed(0)),
    };
    parser.parse_full()
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    lookahead: Option<Token>,
    symtab: &'a Symtab,
    addr_sets: Option<&'a AddrSets<'a>>,
    port_groups: Option<&'a PortGroups>,
    addr_sets_ref: HashMap<String, usize, RandomState>,
    port_groups_ref: HashSet<String, RandomState>,
}

/// One element of a comparison's right-hand side.
enum Rhs {
    Const(Const, Option<AsInfo>),
    Str(String),
}

impl Parser<'_> {
    fn peek(&mut self) -> Result<&Token, ExprError> {
        if self.lookahead.is_none() {
            self.lookahead = Some(self.lexer.next_token()?);
        }
        Ok(self.lookahead.get_or_insert(Token::End))
    }

    fn bump(&mut self) -> Result<Token, ExprError> {
        self.peek()?;
        Ok(self.lookahead.take().unwrap_or(Token::End))
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ExprError> {
        let t = self.bump()?;
        if &t == token {
            Ok(())
        } else {
            Err(ExprError::Syntax(format!("expected {what}, found {t:?}")))
        }
    }

    fn parse_full(&mut self) -> Result<Expr, ExprError> {
        if *self.peek()? == Token::End {
            return Ok(Expr::Bool(true));
        }
        let expr = self.parse_or()?;
        match self.bump()? {
            Token::End => Ok(expr),
            t => Err(ExprError::Syntax(format!("trailing input at {t:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut subs = vec![self.parse_and()?];
        while *self.peek()? == Token::OrOr {
            self.bump()?;
            subs.push(self.parse_and()?);
        }
        Ok(if subs.len() == 1 {
            subs.pop().unwrap_or(Expr::Bool(false))
        } else {
            Expr::Or(subs)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut subs = vec![self.parse_unary()?];
        while *self.peek()? == Token::AndAnd {
            self.bump()?;
            subs.push(self.parse_unary()?);
        }
        Ok(if subs.len() == 1 {
            subs.pop().unwrap_or(Expr::Bool(true))
        } else {
            Expr::And(subs)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if *self.peek()? == Token::Not {
            self.bump()?;
            let sub = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(sub)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.bump()? {
            Token::LParen => {
                let expr = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(expr)
            }
            Token::Const(c) => match (c.value, c.mask) {
                (0, None) => Ok(Expr::Bool(false)),
                (1, None) => Ok(Expr::Bool(true)),
                _ => Err(ExprError::Syntax("constant is not an expression".into())),
            },
            Token::Id(name) if name == "is_chassis_resident" => {
                self.expect(&Token::LParen, "'('")?;
                let port = match self.bump()? {
                    Token::Str(s) => s,
                    t => {
                        return Err(ExprError::Syntax(format!(
                            "is_chassis_resident expects a port name, found {t:?}"
                        )))
                    }
                };
                self.expect(&Token::RParen, "')'")?;
                Ok(Expr::Condition(Condition::ChassisResident(port)))
            }
            Token::Id(name) => self.parse_symbol_expr(&name),
            t => Err(ExprError::Syntax(format!("unexpected {t:?}"))),
        }
    }

    fn parse_symbol_expr(&mut self, name: &str) -> Result<Expr, ExprError> {
        let symbol = *self
            .symtab
            .get(name)
            .ok_or_else(|| ExprError::UnknownSymbol(name.to_string()))?;
        let relop = match self.peek()? {
            Token::Eq => Some(Relop::Eq),
            Token::Ne => Some(Relop::Ne),
            Token::Lt => Some(Relop::Lt),
            Token::Le => Some(Relop::Le),
            Token::Gt => Some(Relop::Gt),
            Token::Ge => Some(Relop::Ge),
            _ => None,
        };
        let expr = match relop {
            Some(relop) => {
                self.bump()?;
                let rhs = self.parse_rhs_list()?;
                self.build_cmp(name, &symbol, relop, rhs)?
            }
            None => self.build_boolean(name, &symbol)?,
        };
        Ok(match symbol.prereq {
            Some(prereq) => {
                let prereq_expr = parse_internal(prereq, self.symtab)?;
                Expr::And(vec![expr, prereq_expr])
            }
            None => expr,
        })
    }

    /// A bare symbol used as a boolean.
    fn build_boolean(&mut self, name: &str, symbol: &Symbol) -> Result<Expr, ExprError> {
        match symbol.kind {
            SymbolKind::Predicate { expansion } => parse_internal(expansion, self.symtab),
            SymbolKind::Subfield { ofs, n_bits, mff } => Ok(Expr::Cmp(Cmp {
                field: FieldRef { mff, ofs, n_bits },
                relop: Relop::Eq,
                value: CmpValue::Int { value: 1, mask: 1 },
                as_tag: None,
            })),
            SymbolKind::Field { mff, .. } => Ok(Expr::Cmp(Cmp {
                field: FieldRef {
                    mff,
                    ofs: 0,
                    n_bits: mff.n_bits(),
                },
                relop: Relop::Ne,
                value: CmpValue::Int {
                    value: 0,
                    mask: mff.full_mask(),
                },
                as_tag: None,
            })),
            SymbolKind::StringField { .. } => Err(ExprError::BadRelop("boolean use", name.into())),
        }
    }

    /// The right-hand side of a comparison: one element or a braced list.
    fn parse_rhs_list(&mut self) -> Result<Vec<Rhs>, ExprError> {
        let mut out = Vec::new();
        if *self.peek()? == Token::LBrace {
            self.bump()?;
            loop {
                self.parse_rhs_element(&mut out)?;
                match self.bump()? {
                    Token::Comma => {
                        // Trailing comma before the closing brace.
                        if *self.peek()? == Token::RBrace {
                            self.bump()?;
                            break;
                        }
                    }
                    Token::RBrace => break,
                    t => return Err(ExprError::Syntax(format!("expected ',' or '}}', found {t:?}"))),
                }
            }
        } else {
            self.parse_rhs_element(&mut out)?;
        }
        Ok(out)
    }

    fn parse_rhs_element(&mut self, out: &mut Vec<Rhs>) -> Result<(), ExprError> {
        match self.bump()? {
            Token::Const(c) => {
                out.push(Rhs::Const(c, None));
                Ok(())
            }
            Token::Str(s) => {
                out.push(Rhs::Str(s));
                Ok(())
            }
            Token::AddrSet(name) => {
                // Record the reference before resolving, so the flow is
                // reprocessed once a missing set appears.
                *self.addr_sets_ref.entry(name.clone()).or_insert(0) += 1;
                let set: &ConstSet = self
                    .addr_sets
                    .and_then(|s| s.get(&name))
                    .ok_or_else(|| ExprError::UnknownAddrSet(name.clone()))?;
                for member in &set.0 {
                    let tag = member.as_tag_mask().map(|mask| AsInfo {
                        name: name.clone(),
                        ip: member.value,
                        mask,
                    });
                    out.push(Rhs::Const(*member, tag));
                }
                Ok(())
            }
            Token::PortGroup(name) => {
                self.port_groups_ref.insert(name.clone());
                let members = self
                    .port_groups
                    .and_then(|pg| pg.get(&name))
                    .ok_or(ExprError::UnknownPortGroup(name))?;
                for port in members {
                    out.push(Rhs::Str(port.clone()));
                }
                Ok(())
            }
            t => Err(ExprError::Syntax(format!("expected a constant, found {t:?}"))),
        }
    }

    fn build_cmp(
        &mut self,
        name: &str,
        symbol: &Symbol,
        relop: Relop,
        rhs: Vec<Rhs>,
    ) -> Result<Expr, ExprError> {
        if rhs.is_empty() {
            // An empty address set: nothing can match with ==; with !=
            // everything does.
            return Ok(Expr::Bool(relop == Relop::Ne));
        }
        let mut cmps = Vec::with_capacity(rhs.len());
        for element in rhs {
            cmps.push(self.build_one_cmp(name, symbol, relop, element)?);
        }
        Ok(match (cmps.len(), relop) {
            (1, _) => cmps.pop().unwrap_or(Expr::Bool(false)),
            // field == {a, b} is a disjunction, field != {a, b} excludes
            // every member.
            (_, Relop::Ne) => Expr::And(cmps),
            _ => Expr::Or(cmps),
        })
    }

    fn build_one_cmp(
        &mut self,
        name: &str,
        symbol: &Symbol,
        relop: Relop,
        element: Rhs,
    ) -> Result<Expr, ExprError> {
        match (symbol.kind, element) {
            (SymbolKind::StringField { mff }, Rhs::Str(s)) => {
                if relop != Relop::Eq && relop != Relop::Ne {
                    return Err(ExprError::BadRelop("relational operator", name.into()));
                }
                Ok(Expr::Cmp(Cmp {
                    field: FieldRef {
                        mff,
                        ofs: 0,
                        n_bits: mff.n_bits(),
                    },
                    relop,
                    value: CmpValue::Str(s),
                    as_tag: None,
                }))
            }
            (SymbolKind::StringField { .. }, Rhs::Const(..)) => {
                Err(ExprError::BadConstant(format!("field '{name}' takes port names")))
            }
            (SymbolKind::Field { .. } | SymbolKind::Subfield { .. }, Rhs::Str(_)) => {
                Err(ExprError::BadConstant(format!("field '{name}' takes integers")))
            }
            (SymbolKind::Predicate { .. }, _) => {
                Err(ExprError::BadRelop("comparison", name.into()))
            }
            (SymbolKind::Field { mff, maskable }, Rhs::Const(c, tag)) => {
                let field = FieldRef {
                    mff,
                    ofs: 0,
                    n_bits: mff.n_bits(),
                };
                if let Some(bits) = c.format_bits() {
                    if bits != field.n_bits {
                        return Err(ExprError::ConstantTooWide(c.value, name.into()));
                    }
                }
                self.check_int(name, &field, relop, &c, maskable)?;
                let mask = match c.mask {
                    Some(m) => m,
                    None => field.width_mask(),
                };
                Ok(Expr::Cmp(Cmp {
                    field,
                    relop,
                    value: CmpValue::Int {
                        value: c.value & mask,
                        mask,
                    },
                    as_tag: if relop == Relop::Eq { tag } else { None },
                }))
            }
            (SymbolKind::Subfield { mff, ofs, n_bits }, Rhs::Const(c, _)) => {
                let field = FieldRef { mff, ofs, n_bits };
                self.check_int(name, &field, relop, &c, false)?;
                Ok(Expr::Cmp(Cmp {
                    field,
                    relop,
                    value: CmpValue::Int {
                        value: c.value,
                        mask: field.width_mask(),
                    },
                    as_tag: None,
                }))
            }
        }
    }

    fn check_int(
        &self,
        name: &str,
        field: &FieldRef,
        relop: Relop,
        c: &Const,
        maskable: bool,
    ) -> Result<(), ExprError> {
        if c.value & !field.width_mask() != 0 {
            return Err(ExprError::ConstantTooWide(c.value, name.into()));
        }
        if c.mask.is_some() {
            if !maskable {
                return Err(ExprError::BadRelop("mask", name.into()));
            }
            if relop != Relop::Eq && relop != Relop::Ne {
                return Err(ExprError::BadRelop("relational operator on mask", name.into()));
            }
        }
        Ok(())
    }
}
