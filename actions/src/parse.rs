// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Parsing action strings into the typed action buffer.

use crate::ActionError;
use ahash::RandomState;
use expr::lex::{Lexer, Token};
use expr::symtab::{SymbolKind, Symtab};
use expr::{Const, ConstFormat, Expr, FieldRef};
use oflow::{Mff, Pipeline};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// DHCP option name → option code.
pub type DhcpOptsMap = HashMap<String, u8, RandomState>;

/// One parsed logical action.
#[derive(Debug, Clone, PartialEq)]
pub enum LogAction {
    /// Advance to a logical table (the next one unless given).
    Next { ltable: u8 },
    /// Hand the packet to the output stage.
    Output,
    /// Store a constant into (part of) a field.
    SetField { field: FieldRef, value: u128 },
    /// Store a logical port into a port register.
    SetPort { field: Mff, port: String },
    /// Pass the packet through conntrack and continue in the next table.
    CtNext,
    /// Commit the connection in the datapath's conntrack zone.
    CtCommit,
    /// Destination NAT, optionally to a given address.
    CtDnat { addr: Option<IpAddr> },
    /// Source NAT, optionally to a given address.
    CtSnat { addr: Option<IpAddr> },
    /// Reply to a DHCP request with the given options.
    PutDhcpOpts { v6: bool, opts: Vec<(u8, u128)> },
}

/// Result of a successful parse: the buffer plus the match refinements
/// the actions require.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedActions {
    pub actions: Vec<LogAction>,
    pub prereqs: Option<Expr>,
}

/// Parse-time environment.
pub struct ParseParams<'a> {
    pub symtab: &'a Symtab,
    pub dhcp_opts: &'a DhcpOptsMap,
    pub dhcpv6_opts: &'a DhcpOptsMap,
    pub pipeline: Pipeline,
    /// Number of tables in the logical pipeline.
    pub n_tables: u8,
    /// The logical table this flow lives in.
    pub cur_ltable: u8,
}

/// Parse an action string.
pub fn parse_actions(input: &str, pp: &ParseParams<'_>) -> Result<ParsedActions, ActionError> {
    let mut parser = Parser {
        lexer: Lexer::new(input),
        lookahead: None,
        pp,
        prereqs: Vec::new(),
    };
    let actions = parser.parse_all()?;
    let prereqs = match parser.prereqs.len() {
        0 => None,
        1 => parser.prereqs.pop(),
        _ => Some(Expr::And(parser.prereqs)),
    };
    Ok(ParsedActions { actions, prereqs })
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    lookahead: Option<Token>,
    pp: &'a ParseParams<'a>,
    prereqs: Vec<Expr>,
}

impl Parser<'_> {
    fn peek(&mut self) -> Result<&Token, ActionError> {
        if self.lookahead.is_none() {
            self.lookahead = Some(self.lexer.next_token()?);
        }
        Ok(self.lookahead.get_or_insert(Token::End))
    }

    fn bump(&mut self) -> Result<Token, ActionError> {
        self.peek()?;
        Ok(self.lookahead.take().unwrap_or(Token::End))
    }

    fn expect_semi(&mut self) -> Result<(), ActionError> {
        match self.bump()? {
            Token::Semi => Ok(()),
            t => Err(ActionError::Syntax(format!("expected ';', found {t:?}"))),
        }
    }

    fn add_prereq(&mut self, text: &str) -> Result<(), ActionError> {
        let e = expr::parse::parse_internal(text, self.pp.symtab)?;
        self.prereqs.push(e);
        Ok(())
    }

    fn parse_all(&mut self) -> Result<Vec<LogAction>, ActionError> {
        let mut out = Vec::new();
        let mut saw_drop = false;
        loop {
            if *self.peek()? == Token::End {
                break;
            }
            let name = match self.bump()? {
                Token::Id(name) => name,
                t => return Err(ActionError::Syntax(format!("expected an action, found {t:?}"))),
            };
            if saw_drop {
                return Err(ActionError::DropNotAlone);
            }
            match name.as_str() {
                "drop" => {
                    if !out.is_empty() {
                        return Err(ActionError::DropNotAlone);
                    }
                    saw_drop = true;
                    self.expect_semi()?;
                }
                "next" => {
                    let ltable = self.parse_next_args()?;
                    out.push(LogAction::Next { ltable });
                    self.expect_semi()?;
                }
                "output" => {
                    out.push(LogAction::Output);
                    self.expect_semi()?;
                }
                "ct_next" => {
                    self.add_prereq("ip")?;
                    out.push(LogAction::CtNext);
                    self.expect_semi()?;
                }
                "ct_commit" => {
                    self.add_prereq("ip")?;
                    out.push(LogAction::CtCommit);
                    self.expect_semi()?;
                }
                "ct_dnat" => {
                    self.add_prereq("ip")?;
                    let addr = self.parse_nat_arg()?;
                    out.push(LogAction::CtDnat { addr });
                    self.expect_semi()?;
                }
                "ct_snat" => {
                    self.add_prereq("ip")?;
                    let addr = self.parse_nat_arg()?;
                    out.push(LogAction::CtSnat { addr });
                    self.expect_semi()?;
                }
                "put_dhcp_opts" => {
                    let opts = self.parse_dhcp_args(self.pp.dhcp_opts)?;
                    out.push(LogAction::PutDhcpOpts { v6: false, opts });
                    self.expect_semi()?;
                }
                "put_dhcpv6_opts" => {
                    let opts = self.parse_dhcp_args(self.pp.dhcpv6_opts)?;
                    out.push(LogAction::PutDhcpOpts { v6: true, opts });
                    self.expect_semi()?;
                }
                field => {
                    let action = self.parse_assignment(field)?;
                    out.push(action);
                    self.expect_semi()?;
                }
            }
        }
        Ok(out)
    }

    fn parse_next_args(&mut self) -> Result<u8, ActionError> {
        let target = if *self.peek()? == Token::LParen {
            self.bump()?;
            let table = match self.bump()? {
                Token::Const(Const {
                    value,
                    mask: None,
                    format: ConstFormat::Decimal,
                }) => value as u8,
                t => return Err(ActionError::BadArgument(format!("{t:?}"))),
            };
            match self.bump()? {
                Token::RParen => {}
                t => return Err(ActionError::Syntax(format!("expected ')', found {t:?}"))),
            }
            table
        } else {
            self.pp.cur_ltable + 1
        };
        if target >= self.pp.n_tables {
            return Err(ActionError::NextPastEnd);
        }
        Ok(target)
    }

    fn parse_nat_arg(&mut self) -> Result<Option<IpAddr>, ActionError> {
        if *self.peek()? != Token::LParen {
            return Ok(None);
        }
        self.bump()?;
        let addr = match self.bump()? {
            Token::Const(Const {
                value,
                mask: None,
                format: ConstFormat::Ipv4,
            }) => IpAddr::V4(Ipv4Addr::from(value as u32)),
            Token::Const(Const {
                value,
                mask: None,
                format: ConstFormat::Ipv6,
            }) => IpAddr::V6(Ipv6Addr::from(value)),
            t => return Err(ActionError::BadArgument(format!("{t:?}"))),
        };
        match self.bump()? {
            Token::RParen => Ok(Some(addr)),
            t => Err(ActionError::Syntax(format!("expected ')', found {t:?}"))),
        }
    }

    fn parse_dhcp_args(
        &mut self,
        opts_map: &DhcpOptsMap,
    ) -> Result<Vec<(u8, u128)>, ActionError> {
        match self.bump()? {
            Token::LParen => {}
            t => return Err(ActionError::Syntax(format!("expected '(', found {t:?}"))),
        }
        let mut opts = Vec::new();
        loop {
            let name = match self.bump()? {
                Token::Id(name) => name,
                Token::RParen if opts.is_empty() => break,
                t => return Err(ActionError::Syntax(format!("expected option name, found {t:?}"))),
            };
            let code = *opts_map
                .get(&name)
                .ok_or(ActionError::UnknownDhcpOption(name))?;
            // Option values are written with '=', which the expression
            // lexer does not produce on its own.
            if !self.eat_assign()? {
                return Err(ActionError::Syntax("expected '=' after option name".into()));
            }
            let value = match self.bump()? {
                Token::Const(c) => c.value,
                t => return Err(ActionError::BadArgument(format!("{t:?}"))),
            };
            opts.push((code, value));
            match self.bump()? {
                Token::Comma => {}
                Token::RParen => break,
                t => return Err(ActionError::Syntax(format!("expected ',' or ')', found {t:?}"))),
            }
        }
        Ok(opts)
    }

    fn eat_assign(&mut self) -> Result<bool, ActionError> {
        debug_assert!(self.lookahead.is_none());
        Ok(self.lexer.eat_assign())
    }

    fn parse_assignment(&mut self, name: &str) -> Result<LogAction, ActionError> {
        let symbol = *self
            .pp
            .symtab
            .get(name)
            .ok_or_else(|| ActionError::UnknownField(name.to_string()))?;
        if !self.eat_assign()? {
            return Err(ActionError::Syntax(format!("expected '=' after '{name}'")));
        }
        if let Some(prereq) = symbol.prereq {
            self.add_prereq(prereq)?;
        }
        match symbol.kind {
            SymbolKind::StringField { mff } => {
                let port = match self.bump()? {
                    Token::Str(s) => s,
                    t => return Err(ActionError::BadArgument(format!("{t:?}"))),
                };
                Ok(LogAction::SetPort { field: mff, port })
            }
            SymbolKind::Field { mff, .. } => {
                let value = self.parse_int_value(name)?;
                if value & !mff.full_mask() != 0 {
                    return Err(ActionError::BadArgument(format!("{value:#x}")));
                }
                Ok(LogAction::SetField {
                    field: FieldRef {
                        mff,
                        ofs: 0,
                        n_bits: mff.n_bits(),
                    },
                    value,
                })
            }
            SymbolKind::Subfield { mff, ofs, n_bits } => {
                let value = self.parse_int_value(name)?;
                let field = FieldRef { mff, ofs, n_bits };
                if value & !field.width_mask() != 0 {
                    return Err(ActionError::BadArgument(format!("{value:#x}")));
                }
                Ok(LogAction::SetField { field, value })
            }
            SymbolKind::Predicate { .. } => {
                Err(ActionError::NotAssignable(name.to_string()))
            }
        }
    }

    fn parse_int_value(&mut self, name: &str) -> Result<u128, ActionError> {
        match self.bump()? {
            Token::Const(Const { value, mask: None, .. }) => Ok(value),
            _ => Err(ActionError::BadArgument(format!("value for '{name}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params<'a>(symtab: &'a Symtab, dhcp: &'a DhcpOptsMap) -> ParseParams<'a> {
        ParseParams {
            symtab,
            dhcp_opts: dhcp,
            dhcpv6_opts: dhcp,
            pipeline: Pipeline::Ingress,
            n_tables: 24,
            cur_ltable: 3,
        }
    }

    fn empty_dhcp() -> DhcpOptsMap {
        DhcpOptsMap::with_hasher(RandomState::with_seed(0))
    }

    #[test]
    fn next_defaults_to_following_table() {
        let symtab = Symtab::new();
        let dhcp = empty_dhcp();
        let parsed = parse_actions("next;", &params(&symtab, &dhcp)).expect("parse");
        assert_eq!(parsed.actions, vec![LogAction::Next { ltable: 4 }]);
        assert!(parsed.prereqs.is_none());
    }

    #[test]
    fn explicit_next_table() {
        let symtab = Symtab::new();
        let dhcp = empty_dhcp();
        let parsed = parse_actions("next(7);", &params(&symtab, &dhcp)).expect("parse");
        assert_eq!(parsed.actions, vec![LogAction::Next { ltable: 7 }]);
        assert!(parse_actions("next(99);", &params(&symtab, &dhcp)).is_err());
    }

    #[test]
    fn drop_must_be_alone() {
        let symtab = Symtab::new();
        let dhcp = empty_dhcp();
        let parsed = parse_actions("drop;", &params(&symtab, &dhcp)).expect("parse");
        assert!(parsed.actions.is_empty());
        assert!(parse_actions("drop; next;", &params(&symtab, &dhcp)).is_err());
        assert!(parse_actions("next; drop;", &params(&symtab, &dhcp)).is_err());
    }

    #[test]
    fn ct_next_adds_ip_prereq() {
        let symtab = Symtab::new();
        let dhcp = empty_dhcp();
        let parsed = parse_actions("ct_next;", &params(&symtab, &dhcp)).expect("parse");
        assert_eq!(parsed.actions, vec![LogAction::CtNext]);
        assert!(parsed.prereqs.is_some());
    }

    #[test]
    fn assignment_to_port_register() {
        let symtab = Symtab::new();
        let dhcp = empty_dhcp();
        let parsed =
            parse_actions(r#"outport = "lp2"; output;"#, &params(&symtab, &dhcp)).expect("parse");
        assert_eq!(
            parsed.actions,
            vec![
                LogAction::SetPort {
                    field: Mff::LOG_OUTPORT,
                    port: "lp2".into()
                },
                LogAction::Output,
            ]
        );
    }

    #[test]
    fn assignment_to_numeric_field() {
        let symtab = Symtab::new();
        let dhcp = empty_dhcp();
        let parsed = parse_actions("reg0 = 0x10;", &params(&symtab, &dhcp)).expect("parse");
        assert_eq!(
            parsed.actions,
            vec![LogAction::SetField {
                field: FieldRef { mff: Mff::Reg0, ofs: 0, n_bits: 32 },
                value: 0x10
            }]
        );
    }

    #[test]
    fn dhcp_option_names_are_validated() {
        let symtab = Symtab::new();
        let mut dhcp = empty_dhcp();
        dhcp.insert("router".into(), 3);
        let parsed = parse_actions(
            "put_dhcp_opts(router = 10.0.0.1);",
            &params(&symtab, &dhcp),
        )
        .expect("parse");
        assert_eq!(
            parsed.actions,
            vec![LogAction::PutDhcpOpts { v6: false, opts: vec![(3, 0x0a000001)] }]
        );
        assert!(parse_actions(
            "put_dhcp_opts(bogus = 1);",
            &params(&symtab, &dhcp)
        )
        .is_err());
    }

    #[test]
    fn ct_snat_with_address() {
        let symtab = Symtab::new();
        let dhcp = empty_dhcp();
        let parsed = parse_actions("ct_snat(10.0.0.100);", &params(&symtab, &dhcp)).expect("parse");
        assert_eq!(
            parsed.actions,
            vec![LogAction::CtSnat { addr: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 100))) }]
        );
    }

    #[test]
    fn garbage_is_rejected() {
        let symtab = Symtab::new();
        let dhcp = empty_dhcp();
        assert!(parse_actions("fly_to_the_moon;", &params(&symtab, &dhcp)).is_err());
        assert!(parse_actions("next", &params(&symtab, &dhcp)).is_err());
    }
}
