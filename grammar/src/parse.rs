//! BNF/EBNF grammar loader.
//!
//! Hand-written lexer and LL parser for the conventional notation:
//!
//! ```text
//! # comment
//! Expr ::= Term ('+' Term)* ;
//! Term ::= number | ident ;
//! number ::= [0-9] [0-9]* ;
//! ```
//!
//! Identifiers may be wrapped in angle brackets (`<Expr>`). `x+` is
//! shorthand for `x x*`, `x?` for `(x | )`. Character classes like
//! `[a-zA-Z_]` expand to a choice of single-character literals. String and
//! character literals interpret the usual backslash escapes.

use crate::item::{Grammar, ItemId};
use crate::GrammarError;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    /// String or char literal, escapes already interpreted.
    Literal(String),
    /// Character class body, brackets stripped, escapes interpreted.
    CharClass(String),
    Produces,
    Merge,
    Terminator,
    Disjunct,
    Kleene,
    KleenePlus,
    Optional,
    LParen,
    RParen,
    End,
}

fn err(line: usize, msg: impl Into<String>) -> GrammarError {
    GrammarError::Parse {
        line,
        msg: msg.into(),
    }
}

/// Interpret backslash escapes in a literal body.
fn unescape(s: &str, line: usize) -> Result<String, GrammarError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(']') => out.push(']'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let code = u8::from_str_radix(&hex, 16)
                    .map_err(|_| err(line, format!("bad hex escape '\\x{hex}'")))?;
                out.push(code as char);
            }
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let code = u32::from_str_radix(&hex, 16)
                    .map_err(|_| err(line, format!("bad unicode escape '\\u{hex}'")))?;
                let ch = char::from_u32(code)
                    .ok_or_else(|| err(line, format!("'\\u{hex}' is not a character")))?;
                out.push(ch);
            }
            Some(other) => out.push(other),
            None => return Err(err(line, "dangling backslash in literal")),
        }
    }
    Ok(out)
}

struct Lexer<'a> {
    src: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.chars().peekable(),
            line: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.src.next();
        if c == Some('\n') {
            self.line += 1;
        }
        c
    }

    /// Consume until `stop`, erroring at end of input. `stop` is consumed
    /// and not included in the result. A backslash protects the next
    /// character from terminating the scan.
    fn take_until(&mut self, stop: char, what: &str) -> Result<String, GrammarError> {
        let start_line = self.line;
        let mut body = String::new();
        loop {
            match self.bump() {
                Some(c) if c == stop => return Ok(body),
                Some('\\') => {
                    body.push('\\');
                    match self.bump() {
                        Some(c) => body.push(c),
                        None => return Err(err(start_line, format!("unterminated {what}"))),
                    }
                }
                Some(c) => body.push(c),
                None => return Err(err(start_line, format!("unterminated {what}"))),
            }
        }
    }

    fn lex(mut self) -> Result<Vec<(usize, Tok)>, GrammarError> {
        let mut toks = Vec::new();
        while let Some(&c) = self.src.peek() {
            let line = self.line;
            match c {
                ' ' | '\t' | '\r' | '\n' => {
                    self.bump();
                }
                '#' => {
                    while let Some(&c) = self.src.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '/' => {
                    self.bump();
                    if self.src.peek() != Some(&'*') {
                        return Err(err(line, "unexpected '/'"));
                    }
                    self.bump();
                    let mut prev = '\0';
                    loop {
                        match self.bump() {
                            Some('/') if prev == '*' => break,
                            Some(c) => prev = c,
                            None => return Err(err(line, "unterminated comment")),
                        }
                    }
                }
                '"' => {
                    self.bump();
                    let body = self.take_until('"', "string literal")?;
                    toks.push((line, Tok::Literal(unescape(&body, line)?)));
                }
                '\'' => {
                    self.bump();
                    let body = self.take_until('\'', "character literal")?;
                    toks.push((line, Tok::Literal(unescape(&body, line)?)));
                }
                '[' => {
                    self.bump();
                    let body = self.take_until(']', "character class")?;
                    toks.push((line, Tok::CharClass(unescape(&body, line)?)));
                }
                '<' => {
                    self.bump();
                    let mut name = String::from("<");
                    loop {
                        match self.bump() {
                            Some('>') => break,
                            Some(c) if c.is_alphanumeric() || c == '_' => name.push(c),
                            Some(c) => {
                                return Err(err(line, format!("bad character '{c}' in symbol name")))
                            }
                            None => return Err(err(line, "unterminated symbol name")),
                        }
                    }
                    name.push('>');
                    toks.push((line, Tok::Ident(name)));
                }
                ':' => {
                    self.bump();
                    if self.src.peek() == Some(&':') {
                        self.bump();
                        if self.src.peek() == Some(&':') {
                            self.bump();
                            toks.push((line, Tok::Merge));
                        } else if self.src.peek() == Some(&'=') {
                            self.bump();
                            toks.push((line, Tok::Produces));
                        } else {
                            return Err(err(line, "expected '::=' or ':::'"));
                        }
                    } else {
                        // yacc/antlr style production
                        toks.push((line, Tok::Produces));
                    }
                }
                ';' => {
                    self.bump();
                    toks.push((line, Tok::Terminator));
                }
                '|' => {
                    self.bump();
                    toks.push((line, Tok::Disjunct));
                }
                '*' => {
                    self.bump();
                    toks.push((line, Tok::Kleene));
                }
                '+' => {
                    self.bump();
                    toks.push((line, Tok::KleenePlus));
                }
                '?' => {
                    self.bump();
                    toks.push((line, Tok::Optional));
                }
                '(' => {
                    self.bump();
                    toks.push((line, Tok::LParen));
                }
                ')' => {
                    self.bump();
                    toks.push((line, Tok::RParen));
                }
                c if c.is_alphabetic() || c == '_' => {
                    let mut name = String::new();
                    while let Some(&c) = self.src.peek() {
                        if c.is_alphanumeric() || c == '_' {
                            name.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    toks.push((line, Tok::Ident(name)));
                }
                c => return Err(err(line, format!("unrecognized character '{c}'"))),
            }
        }
        toks.push((self.line, Tok::End));
        Ok(toks)
    }
}

struct Parser {
    toks: Vec<(usize, Tok)>,
    pos: usize,
    gram: Grammar,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos].1
    }

    fn line(&self) -> usize {
        self.toks[self.pos].0
    }

    fn take(&mut self) -> Tok {
        let tok = self.toks[self.pos].1.clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: Tok, desc: &str) -> Result<(), GrammarError> {
        if *self.peek() == want {
            self.take();
            Ok(())
        } else {
            Err(err(self.line(), format!("expected {desc}")))
        }
    }

    fn grammar(mut self) -> Result<Grammar, GrammarError> {
        while matches!(self.peek(), Tok::Ident(_)) {
            self.statement()?;
        }
        if *self.peek() != Tok::End {
            return Err(err(self.line(), "expected a production"));
        }
        Ok(self.gram)
    }

    /// `IDENT '::=' rhs ';'`
    fn statement(&mut self) -> Result<(), GrammarError> {
        let name = match self.take() {
            Tok::Ident(name) => name,
            _ => return Err(err(self.line(), "statement should begin with a symbol")),
        };
        match self.take() {
            Tok::Produces => {}
            Tok::Merge => {
                return Err(err(self.line(), "symbol merges (':::') are not supported"));
            }
            _ => return Err(err(self.line(), "expected '::=' after symbol")),
        }
        let lhs = self.gram.symbol(name);
        let rhs = self.rhs()?;
        self.gram.add_production(lhs, rhs);
        self.expect(Tok::Terminator, "';' after production")
    }

    /// `seq ('|' seq)*`
    fn rhs(&mut self) -> Result<ItemId, GrammarError> {
        let first = self.seq()?;
        if *self.peek() != Tok::Disjunct {
            return Ok(first);
        }
        let mut alts = vec![first];
        while *self.peek() == Tok::Disjunct {
            self.take();
            alts.push(self.seq()?);
        }
        Ok(self.gram.alt(alts))
    }

    fn starts_symbol(tok: &Tok) -> bool {
        matches!(
            tok,
            Tok::Ident(_) | Tok::Literal(_) | Tok::CharClass(_) | Tok::LParen
        )
    }

    /// `primary*` (possibly empty)
    fn seq(&mut self) -> Result<ItemId, GrammarError> {
        if !Self::starts_symbol(self.peek()) {
            return Ok(self.gram.empty());
        }
        let first = self.primary()?;
        if !Self::starts_symbol(self.peek()) {
            return Ok(first);
        }
        let mut items = vec![first];
        while Self::starts_symbol(self.peek()) {
            items.push(self.primary()?);
        }
        Ok(self.gram.seq(items))
    }

    /// `symbol ('*' | '+' | '?')?`
    fn primary(&mut self) -> Result<ItemId, GrammarError> {
        let item = self.symbol()?;
        match self.peek() {
            Tok::Kleene => {
                self.take();
                Ok(self.gram.star(item))
            }
            Tok::KleenePlus => {
                self.take();
                // x+ == x x*
                let star = self.gram.star(item);
                Ok(self.gram.seq(vec![item, star]))
            }
            Tok::Optional => {
                self.take();
                // x? == (x | empty)
                let empty = self.gram.empty();
                Ok(self.gram.alt(vec![item, empty]))
            }
            _ => Ok(item),
        }
    }

    fn symbol(&mut self) -> Result<ItemId, GrammarError> {
        let line = self.line();
        match self.take() {
            Tok::LParen => {
                let inner = self.rhs()?;
                self.expect(Tok::RParen, "closing ')'")?;
                Ok(inner)
            }
            Tok::Ident(name) => Ok(self.gram.symbol(name)),
            Tok::Literal(text) => Ok(self.gram.literal(text)),
            Tok::CharClass(body) => self.char_class(&body, line),
            _ => Err(err(line, "expected a symbol, literal, or group")),
        }
    }

    /// Expand `a-dKM-Or` into a choice of single-character literals.
    fn char_class(&mut self, body: &str, line: usize) -> Result<ItemId, GrammarError> {
        let chars: Vec<char> = body.chars().collect();
        let mut alts = Vec::new();
        let mut pos = 0;
        while pos < chars.len() {
            if pos + 2 < chars.len() && chars[pos + 1] == '-' {
                let (lo, hi) = (chars[pos] as u32, chars[pos + 2] as u32);
                if lo > hi {
                    return Err(err(
                        line,
                        format!("empty range '{}-{}'", chars[pos], chars[pos + 2]),
                    ));
                }
                for code in lo..=hi {
                    if let Some(c) = char::from_u32(code) {
                        let lit = self.gram.literal(c.to_string());
                        alts.push(lit);
                    }
                }
                pos += 3;
            } else {
                let lit = self.gram.literal(chars[pos].to_string());
                alts.push(lit);
                pos += 1;
            }
        }
        if alts.is_empty() {
            return Err(err(line, "empty character class"));
        }
        Ok(self.gram.alt(alts))
    }
}

/// Parse BNF text into a finalized [`Grammar`].
pub fn parse_bnf(
    src: &str,
    name: impl Into<String>,
    len_based_cost: bool,
) -> Result<Grammar, GrammarError> {
    let toks = Lexer::new(src).lex()?;
    let parser = Parser {
        toks,
        pos: 0,
        gram: Grammar::new(name, len_based_cost),
    };
    let mut gram = parser.grammar()?;
    gram.finalize()?;
    Ok(gram)
}
