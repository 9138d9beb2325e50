// Parser for the protobuf text format used by graph configuration files
//
// Supports the subset graph configs use: scalar fields, nested messages with
// `{}` or `<>`, extension field names in brackets, list values, quoted strings
// with escapes, `#` comments and optional `,`/`;` field separators.

use crate::models::graph::{GraphError, GraphResult};

/// Deepest nesting of messages and lists accepted by `parse`
pub const MAX_NESTING_DEPTH: usize = 64;

/// A field value in a parsed message
#[derive(Debug, Clone, PartialEq)]
pub enum TextValue {
    Str(String),
    Int(i64),
    Float(f64),
    /// Bare identifier: enum values, `true`, `false`
    Ident(String),
    Message(TextMessage),
}

impl TextValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TextValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TextValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TextValue::Int(v) => Some(*v as f64),
            TextValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TextValue::Ident(id) if id == "true" || id == "True" || id == "t" => Some(true),
            TextValue::Ident(id) if id == "false" || id == "False" || id == "f" => Some(false),
            TextValue::Int(1) => Some(true),
            TextValue::Int(0) => Some(false),
            _ => None,
        }
    }

    pub fn as_ident(&self) -> Option<&str> {
        match self {
            TextValue::Ident(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&TextMessage> {
        match self {
            TextValue::Message(m) => Some(m),
            _ => None,
        }
    }
}

/// Ordered list of fields; repeated fields appear once per value
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextMessage {
    fields: Vec<(String, TextValue)>,
}

impl TextMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: TextValue) {
        self.fields.push((name.into(), value));
    }

    pub fn fields(&self) -> &[(String, TextValue)] {
        &self.fields
    }

    /// First value of `name`
    pub fn get(&self, name: &str) -> Option<&TextValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TextValue> + 'a {
        self.fields
            .iter()
            .filter(move |(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Append every field of `other`
    pub fn extend(&mut self, other: TextMessage) {
        self.fields.extend(other.fields);
    }
}

/// Parse a complete text-format message
pub fn parse(input: &str) -> GraphResult<TextMessage> {
    let tokens = Lexer::new(input).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    parser.message(None)
}

// ==============================================================================
// Lexer
// ==============================================================================

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Str(String),
    Number(String),
    Colon,
    Comma,
    Semicolon,
    Open(char),
    Close(char),
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: usize,
    column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> GraphError {
        GraphError::Parse {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }

    fn tokenize(mut self) -> GraphResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let (line, column) = (self.line, self.column);
            let Some(&c) = self.chars.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            };

            let kind = match c {
                ':' => self.single(TokenKind::Colon),
                ',' => self.single(TokenKind::Comma),
                ';' => self.single(TokenKind::Semicolon),
                '{' | '<' | '[' => self.single(TokenKind::Open(c)),
                '}' | '>' | ']' => self.single(TokenKind::Close(c)),
                '"' | '\'' => TokenKind::Str(self.string()?),
                c if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                    TokenKind::Number(self.number())
                }
                c if c.is_alphabetic() || c == '_' => TokenKind::Ident(self.ident()),
                other => return Err(self.error(format!("unexpected character {:?}", other))),
            };
            tokens.push(Token { kind, line, column });
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.bump();
        kind
    }

    fn skip_trivia(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c == '#' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn ident(&mut self) -> String {
        let mut ident = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' || c == '.' || c == '/' {
                ident.push(c);
                self.bump();
            } else {
                break;
            }
        }
        ident
    }

    fn number(&mut self) -> String {
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            let exponent_sign =
                (c == '-' || c == '+') && matches!(text.chars().last(), Some('e') | Some('E'));
            let leading_sign = (c == '-' || c == '+') && text.is_empty();
            if c.is_alphanumeric() || c == '.' || exponent_sign || leading_sign {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        text
    }

    fn string(&mut self) -> GraphResult<String> {
        let quote = self.bump().unwrap_or('"');
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(value),
                Some('\\') => value.push(self.escape()?),
                Some(c) => value.push(c),
            }
        }
    }

    fn escape(&mut self) -> GraphResult<char> {
        let c = self.bump().ok_or_else(|| self.error("unterminated escape"))?;
        let escaped = match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'a' => '\x07',
            'b' => '\x08',
            'f' => '\x0c',
            'v' => '\x0b',
            '\\' | '\'' | '"' | '?' => c,
            'x' => {
                let mut code = 0u32;
                let mut digits = 0;
                while digits < 2 {
                    match self.chars.peek().and_then(|c| c.to_digit(16)) {
                        Some(d) => {
                            code = code * 16 + d;
                            digits += 1;
                            self.bump();
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    return Err(self.error("\\x escape without hex digits"));
                }
                char::from_u32(code).ok_or_else(|| self.error("invalid \\x escape"))?
            }
            '0'..='7' => {
                let mut code = c.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match self.chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(d) => {
                            code = code * 8 + d;
                            self.bump();
                        }
                        None => break,
                    }
                }
                char::from_u32(code).ok_or_else(|| self.error("invalid octal escape"))?
            }
            other => return Err(self.error(format!("unknown escape \\{}", other))),
        };
        Ok(escaped)
    }
}

// ==============================================================================
// Parser
// ==============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The token list always ends with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error_at(token: &Token, message: impl Into<String>) -> GraphError {
        GraphError::Parse {
            line: token.line,
            column: token.column,
            message: message.into(),
        }
    }

    /// Parse a message body whose opening bracket `open` was just consumed
    fn nested(&mut self, open: Token) -> GraphResult<TextMessage> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(Self::error_at(
                &open,
                format!("messages nested deeper than {}", MAX_NESTING_DEPTH),
            ));
        }
        let close = match open.kind {
            TokenKind::Open(c) => closing(c),
            _ => '}',
        };
        self.depth += 1;
        let nested = self.message(Some(close));
        self.depth -= 1;
        nested
    }

    /// Parse fields until `close` (or end of input at top level)
    fn message(&mut self, close: Option<char>) -> GraphResult<TextMessage> {
        let mut message = TextMessage::new();
        loop {
            let token = self.next();
            let name = match token.kind {
                TokenKind::Comma | TokenKind::Semicolon => continue,
                TokenKind::Eof if close.is_none() => return Ok(message),
                TokenKind::Close(c) if Some(c) == close => return Ok(message),
                TokenKind::Ident(name) => name,
                TokenKind::Open('[') => self.extension_name()?,
                _ => {
                    let expected = close.map_or("field name".to_string(), |c| {
                        format!("field name or '{}'", c)
                    });
                    return Err(Self::error_at(&token, format!("expected {}", expected)));
                }
            };
            self.field(&mut message, name)?;
        }
    }

    fn extension_name(&mut self) -> GraphResult<String> {
        let token = self.next();
        let name = match token.kind {
            TokenKind::Ident(name) => name,
            _ => return Err(Self::error_at(&token, "expected extension name")),
        };
        let close = self.next();
        if close.kind != TokenKind::Close(']') {
            return Err(Self::error_at(&close, "expected ']' after extension name"));
        }
        Ok(format!("[{}]", name))
    }

    fn field(&mut self, message: &mut TextMessage, name: String) -> GraphResult<()> {
        let has_colon = self.peek().kind == TokenKind::Colon;
        if has_colon {
            self.next();
        }

        match self.peek().kind.clone() {
            TokenKind::Open('{' | '<') => {
                let open = self.next();
                let nested = self.nested(open)?;
                message.push(name, TextValue::Message(nested));
            }
            TokenKind::Open('[') if has_colon => {
                self.next();
                self.list(message, &name)?;
            }
            _ if has_colon => {
                let value = self.scalar()?;
                message.push(name, value);
            }
            _ => {
                let token = self.peek().clone();
                return Err(Self::error_at(
                    &token,
                    format!("expected ':' or '{{' after field {}", name),
                ));
            }
        }
        Ok(())
    }

    fn list(&mut self, message: &mut TextMessage, name: &str) -> GraphResult<()> {
        if self.peek().kind == TokenKind::Close(']') {
            self.next();
            return Ok(());
        }
        loop {
            let value = match self.peek().kind.clone() {
                TokenKind::Open('{' | '<') => {
                    let open = self.next();
                    TextValue::Message(self.nested(open)?)
                }
                _ => self.scalar()?,
            };
            message.push(name, value);

            let token = self.next();
            match token.kind {
                TokenKind::Comma => continue,
                TokenKind::Close(']') => return Ok(()),
                _ => return Err(Self::error_at(&token, "expected ',' or ']' in list")),
            }
        }
    }

    fn scalar(&mut self) -> GraphResult<TextValue> {
        let token = self.next();
        match token.kind {
            TokenKind::Str(first) => {
                // Adjacent string literals concatenate
                let mut value = first;
                while let TokenKind::Str(more) = &self.peek().kind {
                    value.push_str(more);
                    self.next();
                }
                Ok(TextValue::Str(value))
            }
            TokenKind::Ident(ident) => Ok(TextValue::Ident(ident)),
            TokenKind::Number(ref text) => parse_number(text)
                .ok_or_else(|| Self::error_at(&token, format!("invalid number {:?}", text))),
            _ => Err(Self::error_at(&token, "expected a value")),
        }
    }
}

fn closing(open: char) -> char {
    match open {
        '<' => '>',
        '[' => ']',
        _ => '}',
    }
}

fn parse_number(text: &str) -> Option<TextValue> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let lower = digits.to_ascii_lowercase();
    if lower == "inf" || lower == "infinity" {
        return Some(TextValue::Float(if negative { f64::NEG_INFINITY } else { f64::INFINITY }));
    }
    if lower == "nan" {
        return Some(TextValue::Float(f64::NAN));
    }

    let sign = if negative { -1 } else { 1 };
    if let Some(hex) = lower.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16).ok().map(|v| TextValue::Int(sign * v));
    }
    if let Ok(v) = lower.parse::<i64>() {
        return Some(TextValue::Int(sign * v));
    }

    let float_text = lower.strip_suffix('f').unwrap_or(&lower);
    float_text
        .parse::<f64>()
        .ok()
        .map(|v| TextValue::Float(if negative { -v } else { v }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_graph_like_message() {
        let text = r#"
            # Pose tracking
            input_stream: "input_video"
            output_stream: "output_video"

            node {
              calculator: "ImageTransformationCalculator"
              input_stream: "IMAGE:input_video"
              output_stream: "IMAGE:transformed"
              options: {
                [mediapipe.ImageTransformationCalculatorOptions.ext] {
                  rotation_mode: ROTATION_90
                  flip_vertically: true
                  scale: 0.5
                }
              }
            }
        "#;
        let message = parse(text).unwrap();

        assert_eq!(message.get("input_stream").and_then(TextValue::as_str), Some("input_video"));
        let node = message.get("node").and_then(TextValue::as_message).unwrap();
        assert_eq!(node.get_all("input_stream").count(), 1);

        let options = node.get("options").and_then(TextValue::as_message).unwrap();
        let ext = options
            .get("[mediapipe.ImageTransformationCalculatorOptions.ext]")
            .and_then(TextValue::as_message)
            .unwrap();
        assert_eq!(ext.get("rotation_mode").and_then(TextValue::as_ident), Some("ROTATION_90"));
        assert_eq!(ext.get("flip_vertically").and_then(TextValue::as_bool), Some(true));
        assert_eq!(ext.get("scale").and_then(TextValue::as_f64), Some(0.5));
    }

    #[test]
    fn test_lists_numbers_and_strings() {
        let message = parse(
            "ids: [1, -2, 0x10]; ratio: 1e-3f, label: 'it\\'s' \"\\x41\\101\" nested < a: 1 >",
        )
        .unwrap();

        let ids: Vec<i64> = message.get_all("ids").filter_map(TextValue::as_i64).collect();
        assert_eq!(ids, vec![1, -2, 16]);
        assert_eq!(message.get("ratio").and_then(TextValue::as_f64), Some(0.001));
        assert_eq!(message.get("label").and_then(TextValue::as_str), Some("it'sAA"));

        let nested = message.get("nested").and_then(TextValue::as_message).unwrap();
        assert_eq!(nested.get("a").and_then(TextValue::as_i64), Some(1));
    }

    #[test]
    fn test_error_positions() {
        let err = parse("node {\n  calculator \"X\"\n}").unwrap_err();
        assert_eq!(
            err,
            GraphError::Parse {
                line: 2,
                column: 14,
                message: "expected ':' or '{' after field calculator".to_string(),
            }
        );

        assert!(matches!(parse("a: \"open"), Err(GraphError::Parse { line: 1, .. })));
        assert!(matches!(parse("node { a: 1"), Err(GraphError::Parse { .. })));
        assert!(matches!(parse("a: 1 }"), Err(GraphError::Parse { .. })));
        assert!(matches!(parse("a: 12abc"), Err(GraphError::Parse { .. })));
    }

    #[test]
    fn test_nesting_depth_is_capped() {
        let depth_ok = MAX_NESTING_DEPTH;
        let text = format!("{}{}", "a { ".repeat(depth_ok), "} ".repeat(depth_ok));
        assert!(parse(&text).is_ok());

        let too_deep = "a { ".repeat(100_000);
        match parse(&too_deep) {
            Err(GraphError::Parse { message, .. }) => assert!(message.contains("nested deeper")),
            other => panic!("expected a nesting error, got {:?}", other),
        }

        let list = "a: [{ b: [".repeat(MAX_NESTING_DEPTH + 1);
        match parse(&list) {
            Err(GraphError::Parse { message, .. }) => assert!(message.contains("nested deeper")),
            other => panic!("expected a nesting error, got {:?}", other),
        }
    }

    #[test]
    fn test_get_borrows_from_message() {
        let message = parse("name: \"value\"").unwrap();
        // The result outlives the key it was looked up with
        let value = {
            let key = String::from("name");
            message.get(&key)
        };
        assert_eq!(value.and_then(TextValue::as_str), Some("value"));
    }

    #[test]
    fn test_empty_input() {
        assert!(parse("  # only a comment\n").unwrap().is_empty());
    }
}
