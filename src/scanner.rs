// Single-pass scanner: UTF-8 source bytes -> typed tokens with source
// positions.
//
// Lexical errors are recorded rather than thrown, so a single run can
// surface every lex problem in the file instead of stopping at the first.

use crate::token::{Literal, Span, Token, TokenKind, KEYWORDS};

#[derive(Clone, Debug, PartialEq)]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

pub struct Scanner<'a> {
    source: &'a [u8],
    start: usize,
    current: usize,
    line: u32,
    column: u32,
    start_span: Span,
    tokens: Vec<Token>,
    errors: Vec<LexError>,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Scanner<'a> {
        Scanner {
            source: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
            start_span: Span::new(1, 1),
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    // Scans the whole source eagerly into a token vector.
    pub fn scan(mut self) -> (Vec<Token>, Vec<LexError>) {
        while !self.is_at_end() {
            self.start = self.current;
            self.start_span = Span::new(self.line, self.column);
            self.scan_token();
        }
        self.start_span = Span::new(self.line, self.column);
        self.tokens.push(Token::new(TokenKind::Eof, String::new(), None, self.start_span));
        (self.tokens, self.errors)
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.current] as char;
        self.current += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        c
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current] as char
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 >= self.source.len() {
            '\0'
        } else {
            self.source[self.current + 1] as char
        }
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.peek() != expected {
            return false;
        }
        self.advance();
        true
    }

    fn lexeme(&self) -> String {
        String::from_utf8_lossy(&self.source[self.start..self.current]).into_owned()
    }

    fn add(&mut self, kind: TokenKind) {
        self.add_literal(kind, None);
    }

    fn add_literal(&mut self, kind: TokenKind, literal: Option<Literal>) {
        let lexeme = self.lexeme();
        self.tokens.push(Token::new(kind, lexeme, literal, self.start_span));
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(LexError { message: message.into(), span: self.start_span });
    }

    fn scan_token(&mut self) {
        use TokenKind::*;
        let c = self.advance();
        match c {
            '(' => self.add(LeftParen),
            ')' => self.add(RightParen),
            '{' => self.add(LeftBrace),
            '}' => self.add(RightBrace),
            '[' => self.add(LeftBracket),
            ']' => self.add(RightBracket),
            ',' => self.add(Comma),
            '.' => self.add(Dot),
            ';' => self.add(Semicolon),
            '@' => self.add(At),
            '+' => self.add(Plus),
            '-' => self.add(Minus),
            '%' => self.add(Percent),
            '$' => self.add(Dollar),
            ':' => {
                let kind = if self.matches(':') { ColonColon } else { Colon };
                self.add(kind);
            }
            '*' => {
                let kind = if self.matches('*') { StarStar } else { Star };
                self.add(kind);
            }
            '!' => {
                let kind = if self.matches('=') { BangEqual } else { Bang };
                self.add(kind);
            }
            '=' => {
                let kind = if self.matches('=') {
                    EqualEqual
                } else if self.matches('>') {
                    FatArrow
                } else {
                    Equal
                };
                self.add(kind);
            }
            '<' => {
                let kind = if self.matches('=') { LessEqual } else { Less };
                self.add(kind);
            }
            '>' => {
                let kind = if self.matches('=') { GreaterEqual } else { Greater };
                self.add(kind);
            }
            '?' => {
                if self.matches('?') {
                    self.add(QuestionQuestion);
                } else {
                    self.error("unexpected character '?'");
                }
            }
            '&' => {
                if self.matches('&') {
                    self.add(AmpAmp);
                } else {
                    self.error("unexpected character '&'");
                }
            }
            '|' => {
                if self.matches('|') {
                    self.add(PipePipe);
                } else {
                    self.error("unexpected character '|'");
                }
            }
            '/' => {
                if self.matches('/') {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.advance();
                    }
                } else if self.matches('*') {
                    self.block_comment();
                } else {
                    self.add(Slash);
                }
            }
            ' ' | '\r' | '\t' | '\n' => {}
            '"' => self.string(),
            c if c.is_ascii_digit() => self.number(),
            c if c.is_alphabetic() || c == '_' => self.identifier(),
            other => self.error(format!("unexpected character '{}'", other)),
        }
    }

    fn block_comment(&mut self) {
        let mut depth = 1;
        while depth > 0 {
            if self.is_at_end() {
                self.error("unterminated block comment");
                return;
            }
            if self.peek() == '/' && self.peek_next() == '*' {
                self.advance();
                self.advance();
                depth += 1;
            } else if self.peek() == '*' && self.peek_next() == '/' {
                self.advance();
                self.advance();
                depth -= 1;
            } else {
                self.advance();
            }
        }
    }

    fn identifier(&mut self) {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }
        let text = self.lexeme();
        if let Some(&kind) = KEYWORDS.get(text.as_str()) {
            match kind {
                TokenKind::True => self.add_literal(kind, Some(Literal::Bool(true))),
                TokenKind::False => self.add_literal(kind, Some(Literal::Bool(false))),
                TokenKind::Null => self.add_literal(kind, Some(Literal::Null)),
                _ => self.add(kind),
            }
        } else {
            self.add(TokenKind::Identifier);
        }
    }

    fn number(&mut self) {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        if self.peek() == 'e' || self.peek() == 'E' {
            let save = self.current;
            self.advance();
            if self.peek() == '+' || self.peek() == '-' {
                self.advance();
            }
            if self.peek().is_ascii_digit() {
                while self.peek().is_ascii_digit() {
                    self.advance();
                }
            } else {
                self.current = save;
            }
        }
        let text = self.lexeme();
        match text.parse::<f64>() {
            Ok(value) => self.add_literal(TokenKind::Number, Some(Literal::Number(value))),
            Err(_) => self.error(format!("invalid number literal '{}'", text)),
        }
    }

    fn string(&mut self) {
        let mut value = String::new();
        loop {
            if self.is_at_end() {
                self.error("unterminated string");
                return;
            }
            match self.peek() {
                '"' => {
                    self.advance();
                    break;
                }
                '\\' => {
                    self.advance();
                    if self.is_at_end() {
                        self.error("unterminated string");
                        return;
                    }
                    match self.advance() {
                        'n' => value.push('\n'),
                        'r' => value.push('\r'),
                        't' => value.push('\t'),
                        '"' => value.push('"'),
                        '\\' => value.push('\\'),
                        'u' => {
                            if self.peek() != '{' {
                                self.error("expected '{' after \\u");
                                continue;
                            }
                            self.advance();
                            let mut hex = String::new();
                            while self.peek() != '}' && !self.is_at_end() {
                                hex.push(self.advance());
                            }
                            if self.peek() != '}' {
                                self.error("unterminated unicode escape");
                                continue;
                            }
                            self.advance();
                            match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                                Some(ch) => value.push(ch),
                                None => self.error(format!("invalid unicode escape '\\u{{{}}}'", hex)),
                            }
                        }
                        other => self.error(format!("unknown escape sequence '\\{}'", other)),
                    }
                }
                _ => value.push(self.advance()),
            }
        }
        self.add_literal(TokenKind::String, Some(Literal::Str(value)));
    }
}

pub fn scan(source: &str) -> (Vec<Token>, Vec<LexError>) {
    Scanner::new(source).scan()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenKind::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let (tokens, errors) = scan(src);
        assert!(errors.is_empty(), "unexpected lex errors: {:?}", errors);
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_punctuation_and_operators() {
        assert_eq!(kinds("== != <= >= ** ?? && || => ::"), vec![
            EqualEqual, BangEqual, LessEqual, GreaterEqual, StarStar,
            QuestionQuestion, AmpAmp, PipePipe, FatArrow, ColonColon, Eof
        ]);
    }

    #[test]
    fn test_number_literal() {
        let (tokens, _) = scan("42 3.14 1e3 1.5e-2");
        let nums: Vec<f64> = tokens.iter().filter_map(|t| match &t.literal {
            Some(Literal::Number(n)) => Some(*n),
            _ => None,
        }).collect();
        assert_eq!(nums, vec![42.0, 3.14, 1000.0, 0.015]);
    }

    #[test]
    fn test_string_escapes() {
        let (tokens, _) = scan(r#""a\nb\t\"c\"""#);
        match &tokens[0].literal {
            Some(Literal::Str(s)) => assert_eq!(s, "a\nb\t\"c\""),
            other => panic!("expected string literal, got {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_string_reports_error() {
        let (_, errors) = scan("\"oops");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("unterminated string"));
    }

    #[test]
    fn test_nested_block_comments() {
        let (tokens, errors) = scan("/* outer /* inner */ still outer */ 1");
        assert!(errors.is_empty());
        assert_eq!(kinds_of(&tokens), vec![Number, Eof]);
    }

    fn kinds_of(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(kinds("class if else while for in return match import export from true false null this"),
            vec![Class, If, Else, While, For, In, Return, Match, Import, Export, From, True, False, Null, This, Eof]);
        assert_eq!(kinds("foo_bar"), vec![Identifier, Eof]);
    }
}
