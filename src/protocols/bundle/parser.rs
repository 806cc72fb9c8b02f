//! Literal syntax of the settings bundle payload.
//!
//! The payload is built from a small, closed set of literal forms:
//!
//! - strings in double or single quotes with backslash escapes
//!   (`\\ \" \' \n \r \t \0 \u{hex}`)
//! - integers (`i64`) and floats (decimal or exponent form, `inf`, `nan`)
//! - `None`
//! - lists `[a, b]` and tuples `(a, b)`, trailing comma allowed
//! - records `Tag(field=value, ...)`
//!
//! Nothing is evaluated: an identifier other than `None`, `inf`, `nan` or a
//! record tag is a syntax error.

use std::fmt;
use std::fmt::Write;

/// Deepest nesting of lists, tuples and records accepted.
pub const MAX_DEPTH: usize = 32;

/// A payload that does not follow the bundle format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedPayload {
    /// Byte offset into the payload where the problem was found.
    pub position: usize,
    pub reason: String,
}

impl MalformedPayload {
    pub fn new(position: usize, reason: impl Into<String>) -> Self {
        Self {
            position,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for MalformedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "malformed payload at byte {}: {}",
            self.position, self.reason
        )
    }
}

impl std::error::Error for MalformedPayload {}

/// A parsed literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Str(String),
    Int(i64),
    Float(f64),
    List(Vec<Node>),
    Tuple(Vec<Node>),
    Record { tag: String, fields: Vec<Field> },
}

impl Literal {
    /// Short description used in error messages.
    pub fn describe(&self) -> &'static str {
        match self {
            Literal::None => "None",
            Literal::Str(_) => "a string",
            Literal::Int(_) => "an integer",
            Literal::Float(_) => "a float",
            Literal::List(_) => "a list",
            Literal::Tuple(_) => "a tuple",
            Literal::Record { .. } => "a record",
        }
    }
}

/// A literal and where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub offset: usize,
    pub literal: Literal,
}

/// One `name=value` entry of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub offset: usize,
    pub name: String,
    pub value: Node,
}

/// Parse a complete payload into a single literal.
pub fn parse(text: &str) -> Result<Node, MalformedPayload> {
    let mut parser = Parser { src: text, pos: 0 };
    let node = parser.value(0)?;
    parser.skip_whitespace();
    if parser.pos != text.len() {
        return Err(parser.error("trailing characters after payload"));
    }
    Ok(node)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn error(&self, reason: impl Into<String>) -> MalformedPayload {
        MalformedPayload::new(self.pos, reason)
    }

    fn enter(&self, depth: usize) -> Result<usize, MalformedPayload> {
        if depth >= MAX_DEPTH {
            return Err(self.error(format!("nesting deeper than {} levels", MAX_DEPTH)));
        }
        Ok(depth + 1)
    }

    fn value(&mut self, depth: usize) -> Result<Node, MalformedPayload> {
        self.skip_whitespace();
        let offset = self.pos;
        let literal = match self.peek() {
            None => return Err(self.error("unexpected end of payload")),
            Some(quote @ ('"' | '\'')) => Literal::Str(self.string(quote)?),
            Some('[') => Literal::List(self.sequence(']', depth)?),
            Some('(') => Literal::Tuple(self.sequence(')', depth)?),
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => self.number()?,
            Some(c) if c.is_ascii_alphabetic() || c == '_' => self.word(depth)?,
            Some(c) => return Err(self.error(format!("unexpected character {:?}", c))),
        };
        Ok(Node { offset, literal })
    }

    /// Comma-separated values up to `close`; the opening bracket is current.
    fn sequence(&mut self, close: char, depth: usize) -> Result<Vec<Node>, MalformedPayload> {
        let depth = self.enter(depth)?;
        self.bump();

        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some(close) {
                self.bump();
                return Ok(items);
            }

            items.push(self.value(depth)?);

            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(c) if c == close => {
                    self.bump();
                    return Ok(items);
                }
                Some(c) => {
                    return Err(self.error(format!(
                        "expected ',' or '{}', found {:?}",
                        close, c
                    )))
                }
                None => return Err(self.error(format!("missing closing '{}'", close))),
            }
        }
    }

    fn identifier(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }
            self.pos += 1;
        }
        &self.src[start..self.pos]
    }

    fn word(&mut self, depth: usize) -> Result<Literal, MalformedPayload> {
        let start = self.pos;
        let word = self.identifier();
        match word {
            "None" => return Ok(Literal::None),
            "inf" => return Ok(Literal::Float(f64::INFINITY)),
            "nan" => return Ok(Literal::Float(f64::NAN)),
            _ => {}
        }

        self.skip_whitespace();
        if self.peek() != Some('(') {
            return Err(MalformedPayload::new(
                start,
                format!("unknown identifier `{}`", word),
            ));
        }
        self.record(word.to_string(), depth)
    }

    /// `name=value` pairs of a record; the opening parenthesis is current.
    fn record(&mut self, tag: String, depth: usize) -> Result<Literal, MalformedPayload> {
        let depth = self.enter(depth)?;
        self.bump();

        let mut fields = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some(')') {
                self.bump();
                return Ok(Literal::Record { tag, fields });
            }

            let offset = self.pos;
            let name = self.identifier();
            if name.is_empty() {
                return Err(self.error("expected field name"));
            }
            self.skip_whitespace();
            if self.bump() != Some('=') {
                return Err(MalformedPayload::new(
                    offset,
                    format!("expected '=' after field `{}`", name),
                ));
            }
            let name = name.to_string();
            let value = self.value(depth)?;
            fields.push(Field {
                offset,
                name,
                value,
            });

            self.skip_whitespace();
            match self.bump() {
                Some(',') => {}
                Some(')') => return Ok(Literal::Record { tag, fields }),
                Some(c) => {
                    return Err(MalformedPayload::new(
                        self.pos - c.len_utf8(),
                        format!("expected ',' or ')', found {:?}", c),
                    ))
                }
                None => return Err(self.error("missing closing ')'")),
            }
        }
    }

    fn number(&mut self) -> Result<Literal, MalformedPayload> {
        let start = self.pos;
        let negative = self.peek() == Some('-');
        if matches!(self.peek(), Some('-' | '+')) {
            self.bump();
        }

        if self.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
            return match self.identifier() {
                "inf" if negative => Ok(Literal::Float(f64::NEG_INFINITY)),
                "inf" => Ok(Literal::Float(f64::INFINITY)),
                "nan" => Ok(Literal::Float(f64::NAN)),
                _ => Err(MalformedPayload::new(start, "invalid number")),
            };
        }

        let mut digits = self.digits();
        let mut is_float = false;
        if self.peek() == Some('.') {
            self.bump();
            is_float = true;
            digits += self.digits();
        }
        if digits == 0 {
            return Err(MalformedPayload::new(start, "invalid number"));
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.bump();
            is_float = true;
            if matches!(self.peek(), Some('-' | '+')) {
                self.bump();
            }
            if self.digits() == 0 {
                return Err(MalformedPayload::new(start, "invalid exponent"));
            }
        }

        let text = &self.src[start..self.pos];
        if is_float {
            text.parse::<f64>()
                .map(Literal::Float)
                .map_err(|_| MalformedPayload::new(start, "invalid float"))
        } else {
            text.parse::<i64>()
                .map(Literal::Int)
                .map_err(|_| MalformedPayload::new(start, "integer out of range"))
        }
    }

    fn digits(&mut self) -> usize {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        self.pos - start
    }

    /// A quoted string; the opening quote is current.
    fn string(&mut self, quote: char) -> Result<String, MalformedPayload> {
        let start = self.pos;
        self.bump();

        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(MalformedPayload::new(start, "unterminated string")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => out.push(self.escape()?),
                Some(c) => out.push(c),
            }
        }
    }

    fn escape(&mut self) -> Result<char, MalformedPayload> {
        let start = self.pos - 1;
        let c = match self.bump() {
            Some('\\') => '\\',
            Some('"') => '"',
            Some('\'') => '\'',
            Some('n') => '\n',
            Some('r') => '\r',
            Some('t') => '\t',
            Some('0') => '\0',
            Some('u') => {
                if self.bump() != Some('{') {
                    return Err(MalformedPayload::new(start, "expected '{' in unicode escape"));
                }
                let hex_start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                    self.pos += 1;
                }
                let hex = &self.src[hex_start..self.pos];
                if self.bump() != Some('}') || hex.is_empty() || hex.len() > 6 {
                    return Err(MalformedPayload::new(start, "invalid unicode escape"));
                }
                u32::from_str_radix(hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| MalformedPayload::new(start, "invalid unicode scalar"))?
            }
            Some(c) => {
                return Err(MalformedPayload::new(
                    start,
                    format!("unknown escape '\\{}'", c),
                ))
            }
            None => return Err(MalformedPayload::new(start, "unterminated string")),
        };
        Ok(c)
    }
}

/// Append `s` as a double-quoted string literal.
///
/// Control characters are escaped, so the output never contains a line
/// terminator.
pub fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{{{:x}}}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Append a float literal that parses back to the same value.
pub fn write_float(out: &mut String, x: f64) {
    if x.is_nan() {
        out.push_str("nan");
    } else if x.is_infinite() {
        out.push_str(if x > 0.0 { "inf" } else { "-inf" });
    } else {
        // Debug output is the shortest exact form and always has a '.' or 'e'
        let _ = write!(out, "{:?}", x);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal(text: &str) -> Literal {
        parse(text).unwrap().literal
    }

    fn items(text: &str) -> Vec<Literal> {
        match literal(text) {
            Literal::List(nodes) | Literal::Tuple(nodes) => {
                nodes.into_iter().map(|n| n.literal).collect()
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_scalars() {
        assert_eq!(literal("None"), Literal::None);
        assert_eq!(literal("42"), Literal::Int(42));
        assert_eq!(literal("-7"), Literal::Int(-7));
        assert_eq!(literal("+7"), Literal::Int(7));
        assert_eq!(literal("1.5"), Literal::Float(1.5));
        assert_eq!(literal("2e3"), Literal::Float(2000.0));
        assert_eq!(literal("-1.25E-2"), Literal::Float(-0.0125));
        assert_eq!(literal(".5"), Literal::Float(0.5));
        assert_eq!(literal("inf"), Literal::Float(f64::INFINITY));
        assert_eq!(literal("-inf"), Literal::Float(f64::NEG_INFINITY));
        match literal("nan") {
            Literal::Float(x) => assert!(x.is_nan()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_integer_limits() {
        assert_eq!(
            literal("-9223372036854775808"),
            Literal::Int(i64::MIN)
        );
        let err = parse("9223372036854775808").unwrap_err();
        assert_eq!(err.reason, "integer out of range");
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(literal(r#""plain""#), Literal::Str("plain".into()));
        assert_eq!(literal(r#"'single'"#), Literal::Str("single".into()));
        assert_eq!(
            literal(r#""a\"b\\c\nd\te\0f\u{2603}""#),
            Literal::Str("a\"b\\c\nd\te\0f\u{2603}".into())
        );
        assert_eq!(literal(r#"'it\'s'"#), Literal::Str("it's".into()));
        assert_eq!(literal(r#""it's""#), Literal::Str("it's".into()));
    }

    #[test]
    fn test_bad_escapes() {
        assert_eq!(parse(r#""\q""#).unwrap_err().reason, "unknown escape '\\q'");
        assert!(parse(r#""\u{110000}""#).is_err());
        assert!(parse(r#""\u{}""#).is_err());
    }

    #[test]
    fn test_containers_and_trailing_commas() {
        assert_eq!(items("[]"), vec![]);
        assert_eq!(items("()"), vec![]);
        assert_eq!(
            items("[1, 'two', None,]"),
            vec![Literal::Int(1), Literal::Str("two".into()), Literal::None]
        );
        assert_eq!(items("( 1 , 2 )"), vec![Literal::Int(1), Literal::Int(2)]);
    }

    #[test]
    fn test_record() {
        match literal("Setting(name='gamma', epsilon=0.01,)") {
            Literal::Record { tag, fields } => {
                assert_eq!(tag, "Setting");
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].name, "name");
                assert_eq!(fields[0].value.literal, Literal::Str("gamma".into()));
                assert_eq!(fields[1].name, "epsilon");
                assert_eq!(fields[1].value.literal, Literal::Float(0.01));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_offsets() {
        let node = parse("(1, \"x\")").unwrap();
        match node.literal {
            Literal::Tuple(nodes) => {
                assert_eq!(nodes[0].offset, 1);
                assert_eq!(nodes[1].offset, 4);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_no_evaluation() {
        let err = parse("__import__('os').system('true')").unwrap_err();
        assert_eq!(err.position, 11);

        let err = parse("[1, os]").unwrap_err();
        assert_eq!(err.position, 4);
        assert!(err.reason.contains("os"));

        assert!(parse("True").is_err());
        assert!(parse("1 + 1").is_err());
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(parse("").unwrap_err().reason, "unexpected end of payload");
        assert_eq!(parse("[1, 2").unwrap_err().reason, "missing closing ']'");
        assert_eq!(parse("'open").unwrap_err().position, 0);
        assert_eq!(parse("[1 2]").unwrap_err().position, 3);
        assert_eq!(parse("[1,,2]").unwrap_err().position, 3);
        assert_eq!(
            parse("None None").unwrap_err().reason,
            "trailing characters after payload"
        );
        assert!(parse("Setting(name)").is_err());
        assert!(parse("Setting(='x')").is_err());
        assert!(parse("1.2.3").is_err());
        assert!(parse("1e").is_err());
        assert!(parse("-").is_err());
    }

    #[test]
    fn test_depth_limit() {
        let ok = format!("{}{}", "[".repeat(MAX_DEPTH), "]".repeat(MAX_DEPTH));
        assert!(parse(&ok).is_ok());

        let deep = format!("{}{}", "[".repeat(MAX_DEPTH + 1), "]".repeat(MAX_DEPTH + 1));
        let err = parse(&deep).unwrap_err();
        assert!(err.reason.contains("nesting"));
        assert_eq!(err.position, MAX_DEPTH);
    }

    #[test]
    fn test_write_string_escapes_control_characters() {
        let mut out = String::new();
        write_string(&mut out, "a\"b\\c\nd\r\t\0\u{7}é");
        assert_eq!(out, r#""a\"b\\c\nd\r\t\0\u{7}é""#);
        assert!(!out.contains('\n'));
        assert_eq!(
            literal(&out),
            Literal::Str("a\"b\\c\nd\r\t\0\u{7}é".into())
        );
    }

    #[test]
    fn test_write_float_forms() {
        let cases = [
            (1.0, "1.0"),
            (0.1, "0.1"),
            (-2.5, "-2.5"),
            (f64::INFINITY, "inf"),
            (f64::NEG_INFINITY, "-inf"),
            (f64::NAN, "nan"),
        ];
        for (x, expected) in cases {
            let mut out = String::new();
            write_float(&mut out, x);
            assert_eq!(out, expected);
        }

        let mut out = String::new();
        write_float(&mut out, 1e300);
        assert_eq!(literal(&out), Literal::Float(1e300));
    }
}
