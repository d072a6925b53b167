//! Lexer for Lox
//!
//! Produces tokens lazily, one per `next_token` call. The compiler pulls
//! tokens on demand; no token buffer is kept.

use crate::token::{lookup_keyword, Token, TokenKind};

/// The lexer state: a pair of byte offsets into the source plus a line
/// counter. Token boundaries always fall on ASCII bytes, so slicing the
/// source at `start..current` is valid even when string literals contain
/// multi-byte characters.
pub struct Lexer<'a> {
    source: &'a str,
    start: usize,
    current: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer from source code
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    /// Get the next token. After the end of input this keeps returning
    /// `Eof` tokens.
    pub fn next_token(&mut self) -> Token<'a> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();

        if is_alpha(c) {
            return self.identifier();
        }
        if is_digit(c) {
            return self.number();
        }

        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b';' => self.make_token(TokenKind::Semicolon),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'!' => {
                if self.matches(b'=') {
                    self.make_token(TokenKind::BangEqual)
                } else {
                    self.make_token(TokenKind::Bang)
                }
            }
            b'=' => {
                if self.matches(b'=') {
                    self.make_token(TokenKind::EqualEqual)
                } else {
                    self.make_token(TokenKind::Equal)
                }
            }
            b'<' => {
                if self.matches(b'=') {
                    self.make_token(TokenKind::LessEqual)
                } else {
                    self.make_token(TokenKind::Less)
                }
            }
            b'>' => {
                if self.matches(b'=') {
                    self.make_token(TokenKind::GreaterEqual)
                } else {
                    self.make_token(TokenKind::Greater)
                }
            }
            b'"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let c = self.source.as_bytes()[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> u8 {
        self.source.as_bytes().get(self.current).copied().unwrap_or(0)
    }

    fn peek_next(&self) -> u8 {
        self.source
            .as_bytes()
            .get(self.current + 1)
            .copied()
            .unwrap_or(0)
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.peek() != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make_token(&self, kind: TokenKind) -> Token<'a> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'a> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }

    /// Skip whitespace and `//` comments
    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.current += 1;
                }
                b'\n' => {
                    self.line += 1;
                    self.current += 1;
                }
                b'/' => {
                    if self.peek_next() != b'/' {
                        return;
                    }
                    while self.peek() != b'\n' && !self.is_at_end() {
                        self.current += 1;
                    }
                }
                _ => return,
            }
        }
    }

    /// Scan a string literal. Strings may span lines; there are no escape
    /// sequences.
    fn string(&mut self) -> Token<'a> {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.current += 1;
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }

        // Closing quote
        self.current += 1;
        self.make_token(TokenKind::String)
    }

    /// Scan a number literal. Underscores are permitted as digit
    /// separators; a fraction requires at least one digit after the dot
    /// and an exponent requires at least one digit after `e`/`E` and the
    /// optional sign. A literal with a fraction or exponent is a float,
    /// otherwise an int; both compile to the same numeric value.
    fn number(&mut self) -> Token<'a> {
        while is_digit(self.peek()) || self.peek() == b'_' {
            self.current += 1;
        }

        let mut is_float = false;

        if self.peek() == b'.' {
            self.current += 1;
            if !is_digit(self.peek()) {
                return self.error_token("Expect digit after decimal point.");
            }
            is_float = true;
            while is_digit(self.peek()) || self.peek() == b'_' {
                self.current += 1;
            }
        }

        if self.peek() == b'e' || self.peek() == b'E' {
            self.current += 1;
            let c = self.peek();
            if !(is_digit(c) || c == b'+' || c == b'-') {
                return self.error_token("Expect number after exponent.");
            }
            is_float = true;
            if !is_digit(c) {
                // consume the sign; a digit must follow
                self.current += 1;
                if !is_digit(self.peek()) {
                    return self.error_token("Expect number after exponent.");
                }
            }
            while is_digit(self.peek()) || self.peek() == b'_' {
                self.current += 1;
            }
        }

        if is_float {
            self.make_token(TokenKind::Float)
        } else {
            self.make_token(TokenKind::Int)
        }
    }

    /// Scan an identifier or keyword
    fn identifier(&mut self) -> Token<'a> {
        while is_alpha(self.peek()) || is_digit(self.peek()) {
            self.current += 1;
        }

        let text = &self.source[self.start..self.current];
        match lookup_keyword(text) {
            Some(keyword) => self.make_token(keyword),
            None => self.make_token(TokenKind::Identifier),
        }
    }
}

fn is_digit(c: u8) -> bool {
    c.is_ascii_digit()
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(source: &str) -> Vec<(TokenKind, String)> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token();
            if token.kind == TokenKind::Eof {
                break;
            }
            tokens.push((token.kind, token.lexeme.to_string()));
        }
        tokens
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            kinds("and break class else false for fun if nil or return super this true var while"),
            vec![
                TokenKind::And,
                TokenKind::Break,
                TokenKind::Class,
                TokenKind::Else,
                TokenKind::False,
                TokenKind::For,
                TokenKind::Fun,
                TokenKind::If,
                TokenKind::Nil,
                TokenKind::Or,
                TokenKind::Return,
                TokenKind::Super,
                TokenKind::This,
                TokenKind::True,
                TokenKind::Var,
                TokenKind::While,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("( ) { } , . - + ; / * ! != = == > >= < <="),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Semicolon,
                TokenKind::Slash,
                TokenKind::Star,
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("42 3.14 0 1e5 2.5e-3 1_000_000 1_0.5_0"),
            vec![
                TokenKind::Int,
                TokenKind::Float,
                TokenKind::Int,
                TokenKind::Float,
                TokenKind::Float,
                TokenKind::Int,
                TokenKind::Float,
            ]
        );
    }

    #[test]
    fn test_number_errors() {
        let tokens = tokenize("1.");
        assert_eq!(tokens[0].0, TokenKind::Error);
        assert_eq!(tokens[0].1, "Expect digit after decimal point.");

        let tokens = tokenize("1e");
        assert_eq!(tokens[0].0, TokenKind::Error);
        assert_eq!(tokens[0].1, "Expect number after exponent.");

        let tokens = tokenize("1e+");
        assert_eq!(tokens[0].0, TokenKind::Error);
    }

    #[test]
    fn test_strings() {
        let tokens = tokenize(r#""hello" "with spaces""#);
        assert_eq!(tokens[0], (TokenKind::String, "\"hello\"".to_string()));
        assert_eq!(
            tokens[1],
            (TokenKind::String, "\"with spaces\"".to_string())
        );
    }

    #[test]
    fn test_multiline_string_counts_lines() {
        let mut lexer = Lexer::new("\"a\nb\" x");
        let s = lexer.next_token();
        assert_eq!(s.kind, TokenKind::String);
        assert_eq!(s.line, 2);
        let x = lexer.next_token();
        assert_eq!(x.kind, TokenKind::Identifier);
        assert_eq!(x.line, 2);
    }

    #[test]
    fn test_unterminated_string() {
        let tokens = tokenize("\"oops");
        assert_eq!(tokens[0].0, TokenKind::Error);
        assert_eq!(tokens[0].1, "Unterminated string.");
    }

    #[test]
    fn test_identifiers() {
        let tokens = tokenize("foo bar_baz x1 _private");
        assert!(tokens.iter().all(|(k, _)| *k == TokenKind::Identifier));
    }

    #[test]
    fn test_comments_and_eof() {
        let mut lexer = Lexer::new("x // the rest is ignored\n");
        assert_eq!(lexer.next_token().kind, TokenKind::Identifier);
        assert_eq!(lexer.next_token().kind, TokenKind::Eof);
        // EOF repeats on every subsequent call
        assert_eq!(lexer.next_token().kind, TokenKind::Eof);
    }

    #[test]
    fn test_unexpected_character() {
        let tokens = tokenize("@");
        assert_eq!(tokens[0].0, TokenKind::Error);
        assert_eq!(tokens[0].1, "Unexpected character.");
    }
}
