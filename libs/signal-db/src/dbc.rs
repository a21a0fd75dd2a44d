//! DBC text parser
//!
//! Understands the sections a bench tool needs: `VERSION`, `BU_`, `BO_`,
//! `SG_` (with multiplexer markers), `CM_`, `VAL_`, `BA_` (`GenMsgCycleTime`,
//! `GenSigStartValue`) and `SIG_VALTYPE_`. Other known sections are skipped;
//! anything else is a parse error carrying the 1-based line number.

use std::collections::{BTreeMap, HashMap};

use errors::{CanError, Result};
use tracing::{debug, warn};

use crate::model::{ByteOrder, Database, Message, Multiplex, Signal, ValueType};

/// Bit 31 of a DBC message id marks an extended frame
const EXTENDED_FLAG: u32 = 0x8000_0000;
/// Pseudo message holding signals that belong to no frame
const INDEPENDENT_SIGNALS_ID: u32 = 0xC000_0000;

/// Sections that carry nothing the bench tool uses
const SKIPPED_SECTIONS: &[&str] = &[
    "BA_DEF_",
    "BA_DEF_DEF_",
    "BA_DEF_SGTYPE_",
    "BA_SGTYPE_",
    "BA_DEF_REL_",
    "BA_DEF_DEF_REL_",
    "BA_REL_",
    "BU_SG_REL_",
    "BU_EV_REL_",
    "BU_BO_REL_",
    "VAL_TABLE_",
    "EV_",
    "ENVVAR_DATA_",
    "SGTYPE_",
    "SGTYPE_VAL_",
    "SIG_TYPE_REF_",
    "SIG_GROUP_",
    "SG_MUL_VAL_",
    "BO_TX_BU_",
    "CAT_DEF_",
    "CAT_",
    "FILTER",
];

/// Keywords that end an `NS_` block
const AFTER_NS: &[&str] = &["BS_", "BU_", "BO_"];

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Number(String),
    Str(String),
    Punct(char),
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.char_indices().peekable(),
            line: 1,
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(&(_, c)) = self.chars.peek() {
            let line = self.line;
            match c {
                '\n' => {
                    self.line += 1;
                    self.chars.next();
                },
                c if c.is_whitespace() => {
                    self.chars.next();
                },
                '/' => {
                    self.chars.next();
                    if self.chars.peek().map(|&(_, c)| c) != Some('/') {
                        return Err(error_at(line, "unexpected '/'"));
                    }
                    while let Some(&(_, c)) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.chars.next();
                    }
                },
                '"' => {
                    self.chars.next();
                    let text = self.string(line)?;
                    tokens.push(Token {
                        kind: TokenKind::Str(text),
                        line,
                    });
                },
                c if c.is_ascii_digit() || c == '.' => {
                    let number = self.number(String::new());
                    tokens.push(Token {
                        kind: TokenKind::Number(number),
                        line,
                    });
                },
                '-' | '+' => {
                    self.chars.next();
                    let next = self.chars.peek().map(|&(_, c)| c);
                    let kind = if next.is_some_and(|n| n.is_ascii_digit() || n == '.') {
                        TokenKind::Number(self.number(c.to_string()))
                    } else {
                        TokenKind::Punct(c)
                    };
                    tokens.push(Token { kind, line });
                },
                c if c.is_alphabetic() || c == '_' => {
                    let mut ident = String::new();
                    while let Some(&(_, c)) = self.chars.peek() {
                        if c.is_alphanumeric() || c == '_' {
                            ident.push(c);
                            self.chars.next();
                        } else {
                            break;
                        }
                    }
                    tokens.push(Token {
                        kind: TokenKind::Ident(ident),
                        line,
                    });
                },
                ':' | ';' | '|' | '@' | '(' | ')' | '[' | ']' | ',' => {
                    self.chars.next();
                    tokens.push(Token {
                        kind: TokenKind::Punct(c),
                        line,
                    });
                },
                other => {
                    return Err(error_at(line, format!("unexpected character '{}'", other)));
                },
            }
        }
        Ok(tokens)
    }

    fn number(&mut self, mut text: String) -> String {
        let mut prev = ' ';
        while let Some(&(_, c)) = self.chars.peek() {
            let exponent_sign = (c == '-' || c == '+') && (prev == 'e' || prev == 'E');
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || exponent_sign {
                text.push(c);
                prev = c;
                self.chars.next();
            } else {
                break;
            }
        }
        text
    }

    fn string(&mut self, start_line: usize) -> Result<String> {
        let mut text = String::new();
        while let Some((_, c)) = self.chars.next() {
            match c {
                '"' => return Ok(text),
                '\\' => match self.chars.next() {
                    Some((_, escaped)) => {
                        if escaped == '\n' {
                            self.line += 1;
                        }
                        text.push(escaped);
                    },
                    None => break,
                },
                '\n' => {
                    self.line += 1;
                    text.push('\n');
                },
                '\r' => {},
                c => text.push(c),
            }
        }
        Err(error_at(start_line, "unterminated string"))
    }
}

fn error_at(line: usize, message: impl std::fmt::Display) -> CanError {
    CanError::parse(format!("line {}: {}", line, message))
}

/// Parsed statements that refer back to messages by raw DBC id
#[derive(Default)]
struct Pending {
    message_comments: Vec<(u32, String)>,
    signal_comments: Vec<(u32, String, String)>,
    value_tables: Vec<(u32, String, BTreeMap<i64, String>)>,
    value_types: Vec<(u32, String, u32, usize)>,
    cycle_times: Vec<(u32, f64)>,
    start_values: Vec<(u32, String, f64)>,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    version: String,
    nodes: Vec<String>,
    /// Messages with their raw DBC ids, in source order
    messages: Vec<(u32, Message)>,
    pending: Pending,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            version: String::new(),
            nodes: Vec::new(),
            messages: Vec::new(),
            pending: Pending::default(),
        }
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn current_line(&self) -> usize {
        self.peek()
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| error_at(self.current_line(), "unexpected end of input"))?;
        self.pos += 1;
        Ok(token)
    }

    fn peek_ident(&self) -> Option<&str> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Ident(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    fn peek_is_punct(&self, c: char) -> bool {
        matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Punct(p)) if *p == c)
    }

    fn expect_punct(&mut self, c: char) -> Result<()> {
        let token = self.next()?;
        match token.kind {
            TokenKind::Punct(p) if p == c => Ok(()),
            other => Err(error_at(
                token.line,
                format!("expected '{}', found {}", c, describe(&other)),
            )),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        let token = self.next()?;
        match token.kind {
            TokenKind::Ident(s) => Ok(s),
            other => Err(error_at(
                token.line,
                format!("expected identifier, found {}", describe(&other)),
            )),
        }
    }

    fn expect_string(&mut self) -> Result<String> {
        let token = self.next()?;
        match token.kind {
            TokenKind::Str(s) => Ok(s),
            other => Err(error_at(
                token.line,
                format!("expected string, found {}", describe(&other)),
            )),
        }
    }

    fn expect_number(&mut self) -> Result<(String, usize)> {
        let token = self.next()?;
        match token.kind {
            TokenKind::Number(n) => Ok((n, token.line)),
            other => Err(error_at(
                token.line,
                format!("expected number, found {}", describe(&other)),
            )),
        }
    }

    fn expect_f64(&mut self) -> Result<f64> {
        let (text, line) = self.expect_number()?;
        text.parse::<f64>()
            .map_err(|_| error_at(line, format!("invalid number '{}'", text)))
    }

    fn expect_u32(&mut self) -> Result<u32> {
        let (text, line) = self.expect_number()?;
        text.parse::<u32>()
            .map_err(|_| error_at(line, format!("expected unsigned integer, found '{}'", text)))
    }

    fn expect_i64(&mut self) -> Result<i64> {
        let (text, line) = self.expect_number()?;
        text.parse::<i64>()
            .or_else(|_| {
                // some writers emit "1.0" or "1e3" for integer values
                text.parse::<f64>()
                    .ok()
                    .filter(|v| v.fract() == 0.0 && v.abs() < 9.0e18)
                    .map(|v| v as i64)
                    .ok_or(())
            })
            .map_err(|_| error_at(line, format!("expected integer, found '{}'", text)))
    }

    /// Skip tokens through the next `;`
    fn skip_statement(&mut self) -> Result<()> {
        loop {
            let token = self.next()?;
            if token.kind == TokenKind::Punct(';') {
                return Ok(());
            }
        }
    }

    /// Skip the remaining tokens on `line`
    fn skip_line(&mut self, line: usize) {
        while self.peek().is_some_and(|t| t.line == line) {
            self.pos += 1;
        }
    }

    // ------------------------------------------------------------------
    // Sections
    // ------------------------------------------------------------------

    fn parse(mut self) -> Result<Database> {
        while let Some(token) = self.peek().cloned() {
            let keyword = match &token.kind {
                TokenKind::Ident(s) => s.clone(),
                other => {
                    return Err(error_at(
                        token.line,
                        format!("unexpected {}", describe(other)),
                    ))
                },
            };
            self.pos += 1;

            match keyword.as_str() {
                "VERSION" => self.version = self.expect_string()?,
                "NS_" => self.parse_new_symbols()?,
                "BS_" => {
                    self.expect_punct(':')?;
                    self.skip_line(token.line);
                },
                "BU_" => self.parse_nodes(token.line)?,
                "BO_" => self.parse_message()?,
                "SG_" => {
                    return Err(error_at(token.line, "signal outside of a message"));
                },
                "CM_" => self.parse_comment()?,
                "VAL_" => self.parse_value_table()?,
                "BA_" => self.parse_attribute()?,
                "SIG_VALTYPE_" => self.parse_value_type()?,
                k if SKIPPED_SECTIONS.contains(&k) => {
                    debug!("Skipping {} at line {}", k, token.line);
                    self.skip_statement()?;
                },
                other => {
                    return Err(error_at(
                        token.line,
                        format!("unknown keyword '{}'", other),
                    ));
                },
            }
        }

        self.finish()
    }

    fn parse_new_symbols(&mut self) -> Result<()> {
        self.expect_punct(':')?;
        while let Some(ident) = self.peek_ident() {
            if AFTER_NS.contains(&ident) {
                break;
            }
            self.pos += 1;
        }
        Ok(())
    }

    fn parse_nodes(&mut self, line: usize) -> Result<()> {
        self.expect_punct(':')?;
        while self.peek().is_some_and(|t| t.line == line) {
            let node = self.expect_ident()?;
            self.nodes.push(node);
        }
        Ok(())
    }

    fn parse_message(&mut self) -> Result<()> {
        let raw_id = self.expect_u32()?;
        let name = self.expect_ident()?;
        self.expect_punct(':')?;
        let byte_length = self.expect_u32()? as usize;
        let sender = self.expect_ident()?;

        let frame_id = if raw_id & EXTENDED_FLAG != 0 {
            raw_id & !EXTENDED_FLAG
        } else {
            raw_id
        };

        let mut message = Message::new(name, frame_id, byte_length);
        if sender != "Vector__XXX" {
            message.sender = Some(sender);
        }

        while self.peek_ident() == Some("SG_") {
            self.pos += 1;
            let signal = self.parse_signal()?;
            message.signals.push(signal);
        }

        if raw_id == INDEPENDENT_SIGNALS_ID {
            debug!("Skipping {} pseudo message", message.name);
            return Ok(());
        }

        self.messages.push((raw_id, message));
        Ok(())
    }

    fn parse_signal(&mut self) -> Result<Signal> {
        let name_line = self.current_line();
        let name = self.expect_ident()?;

        let multiplex = match self.peek_ident() {
            Some(marker) => {
                let marker = marker.to_string();
                self.pos += 1;
                parse_mux_marker(&marker).ok_or_else(|| {
                    error_at(name_line, format!("invalid multiplexer marker '{}'", marker))
                })?
            },
            None => Multiplex::Plain,
        };

        self.expect_punct(':')?;
        let start_bit = self.expect_u32()?;
        self.expect_punct('|')?;
        let bit_length = self.expect_u32()?;
        self.expect_punct('@')?;

        let order_line = self.current_line();
        let byte_order = match self.expect_u32()? {
            0 => ByteOrder::BigEndian,
            1 => ByteOrder::LittleEndian,
            other => return Err(error_at(order_line, format!("invalid byte order {}", other))),
        };

        let value_type = match self.next()?.kind {
            TokenKind::Punct('+') => ValueType::Unsigned,
            TokenKind::Punct('-') => ValueType::Signed,
            other => {
                return Err(error_at(
                    order_line,
                    format!("expected '+' or '-', found {}", describe(&other)),
                ))
            },
        };

        self.expect_punct('(')?;
        let scale = self.expect_f64()?;
        self.expect_punct(',')?;
        let offset = self.expect_f64()?;
        self.expect_punct(')')?;
        self.expect_punct('[')?;
        let minimum = self.expect_f64()?;
        self.expect_punct('|')?;
        let maximum = self.expect_f64()?;
        self.expect_punct(']')?;
        let receivers_line = self.current_line();
        let unit = self.expect_string()?;

        let mut receivers = Vec::new();
        while self.peek().is_some_and(|t| t.line == receivers_line) {
            if self.peek_is_punct(',') {
                self.pos += 1;
                continue;
            }
            match self.peek_ident() {
                Some("SG_") | None => break,
                Some(_) => {
                    let receiver = self.expect_ident()?;
                    if receiver != "Vector__XXX" {
                        receivers.push(receiver);
                    }
                },
            }
        }

        if start_bit > u32::from(u16::MAX) || bit_length > u32::from(u8::MAX) {
            return Err(error_at(
                name_line,
                format!("signal {} position {}|{} out of range", name, start_bit, bit_length),
            ));
        }

        let mut signal = Signal::new(name, start_bit as u16, bit_length as u8)
            .with_byte_order(byte_order)
            .with_value_type(value_type)
            .with_scaling(scale, offset)
            .with_unit(unit);
        // [0|0] means no declared range
        if minimum != 0.0 || maximum != 0.0 {
            signal.minimum = Some(minimum);
            signal.maximum = Some(maximum);
        }
        signal.receivers = receivers;
        signal.multiplex = multiplex;
        Ok(signal)
    }

    fn parse_comment(&mut self) -> Result<()> {
        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Str(_)) => {
                // database comment
                self.pos += 1;
            },
            Some(TokenKind::Ident(kind)) => {
                self.pos += 1;
                match kind.as_str() {
                    "BO_" => {
                        let id = self.expect_u32()?;
                        let text = self.expect_string()?;
                        self.pending.message_comments.push((id, text));
                    },
                    "SG_" => {
                        let id = self.expect_u32()?;
                        let signal = self.expect_ident()?;
                        let text = self.expect_string()?;
                        self.pending.signal_comments.push((id, signal, text));
                    },
                    "BU_" | "EV_" => {
                        self.expect_ident()?;
                        self.expect_string()?;
                    },
                    other => {
                        return Err(error_at(
                            self.current_line(),
                            format!("unknown comment target '{}'", other),
                        ))
                    },
                }
            },
            _ => return Err(error_at(self.current_line(), "malformed comment")),
        }
        self.expect_punct(';')
    }

    fn parse_value_table(&mut self) -> Result<()> {
        // VAL_ on environment variables starts with a name, not an id
        if self.peek_ident().is_some() {
            return self.skip_statement();
        }

        let id = self.expect_u32()?;
        let signal = self.expect_ident()?;
        let mut labels = BTreeMap::new();
        while !self.peek_is_punct(';') {
            let raw = self.expect_i64()?;
            let label = self.expect_string()?;
            labels.insert(raw, label);
        }
        self.expect_punct(';')?;
        self.pending.value_tables.push((id, signal, labels));
        Ok(())
    }

    fn parse_attribute(&mut self) -> Result<()> {
        let name = self.expect_string()?;

        let target = match self.peek_ident() {
            Some("BO_") => {
                self.pos += 1;
                Some((self.expect_u32()?, None))
            },
            Some("SG_") => {
                self.pos += 1;
                let id = self.expect_u32()?;
                Some((id, Some(self.expect_ident()?)))
            },
            Some("BU_") | Some("EV_") => {
                self.pos += 1;
                self.expect_ident()?;
                None
            },
            _ => None,
        };

        // only numeric values are interpreted; strings and enums are skipped
        let token = self.next()?;
        let value = match token.kind {
            TokenKind::Number(n) => Some(
                n.parse::<f64>()
                    .map_err(|_| error_at(token.line, format!("invalid number '{}'", n)))?,
            ),
            TokenKind::Str(_) => None,
            other => {
                return Err(error_at(
                    token.line,
                    format!("expected attribute value, found {}", describe(&other)),
                ))
            },
        };
        self.expect_punct(';')?;

        match (name.as_str(), target, value) {
            ("GenMsgCycleTime", Some((id, None)), Some(ms)) => {
                self.pending.cycle_times.push((id, ms));
            },
            ("GenSigStartValue", Some((id, Some(signal))), Some(raw)) => {
                self.pending.start_values.push((id, signal, raw));
            },
            _ => {},
        }
        Ok(())
    }

    fn parse_value_type(&mut self) -> Result<()> {
        let id = self.expect_u32()?;
        let signal = self.expect_ident()?;
        if self.peek_is_punct(':') {
            self.pos += 1;
        }
        let line = self.current_line();
        let kind = self.expect_u32()?;
        self.expect_punct(';')?;
        self.pending.value_types.push((id, signal, kind, line));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    fn finish(self) -> Result<Database> {
        let Parser {
            version,
            nodes,
            messages,
            pending,
            ..
        } = self;

        let index: HashMap<u32, usize> = messages
            .iter()
            .enumerate()
            .map(|(i, (raw_id, _))| (*raw_id, i))
            .collect();
        let mut messages: Vec<Message> = messages.into_iter().map(|(_, m)| m).collect();

        for (id, text) in pending.message_comments {
            if let Some(message) = lookup(&index, &mut messages, id) {
                message.comment = Some(text);
            }
        }

        for (id, ms) in pending.cycle_times {
            if let Some(message) = lookup(&index, &mut messages, id) {
                if ms > 0.0 {
                    message.cycle_time = Some(ms as u32);
                }
            }
        }

        for (id, name, text) in pending.signal_comments {
            if let Some(signal) = lookup_signal(&index, &mut messages, id, &name) {
                signal.comment = Some(text);
            }
        }

        for (id, name, labels) in pending.value_tables {
            if let Some(signal) = lookup_signal(&index, &mut messages, id, &name) {
                signal.enumeration = labels;
            }
        }

        for (id, name, kind, line) in pending.value_types {
            if let Some(signal) = lookup_signal(&index, &mut messages, id, &name) {
                match kind {
                    0 => {},
                    1 | 2 => {
                        let expected = if kind == 1 { 32 } else { 64 };
                        if signal.bit_length != expected {
                            return Err(error_at(
                                line,
                                format!(
                                    "signal {} is {} bits but declared as {}-bit float",
                                    name, signal.bit_length, expected
                                ),
                            ));
                        }
                        signal.value_type = ValueType::Float;
                    },
                    other => {
                        return Err(error_at(line, format!("invalid value type {}", other)))
                    },
                }
            }
        }

        // raw start values need the final value type
        for (id, name, raw) in pending.start_values {
            if let Some(signal) = lookup_signal(&index, &mut messages, id, &name) {
                signal.initial = Some(if signal.is_float() {
                    raw
                } else {
                    raw * signal.scale + signal.offset
                });
            }
        }

        Database::new(version, nodes, messages)
    }
}

fn lookup<'a>(
    index: &HashMap<u32, usize>,
    messages: &'a mut [Message],
    raw_id: u32,
) -> Option<&'a mut Message> {
    match index.get(&raw_id) {
        Some(&i) => messages.get_mut(i),
        None => {
            if raw_id != INDEPENDENT_SIGNALS_ID {
                warn!("Reference to unknown message id {}", raw_id);
            }
            None
        },
    }
}

fn lookup_signal<'a>(
    index: &HashMap<u32, usize>,
    messages: &'a mut [Message],
    raw_id: u32,
    name: &str,
) -> Option<&'a mut Signal> {
    let message = lookup(index, messages, raw_id)?;
    let found = message.signals.iter_mut().find(|s| s.name == name);
    if found.is_none() {
        warn!("Reference to unknown signal {} in message id {}", name, raw_id);
    }
    found
}

fn parse_mux_marker(marker: &str) -> Option<Multiplex> {
    if marker == "M" {
        return Some(Multiplex::Multiplexor);
    }
    let rest = marker.strip_prefix('m')?;
    // "m3M" (extended multiplexing) is treated as multiplexed by 3
    let digits = rest.strip_suffix('M').unwrap_or(rest);
    digits.parse::<u64>().ok().map(Multiplex::Multiplexed)
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(s) => format!("'{}'", s),
        TokenKind::Number(n) => format!("number {}", n),
        TokenKind::Str(_) => "string".to_string(),
        TokenKind::Punct(c) => format!("'{}'", c),
    }
}

/// Parse DBC text into a validated [`Database`]
pub fn parse(text: &str) -> Result<Database> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let tokens = Lexer::new(text).tokenize()?;
    Parser::new(tokens).parse()
}
