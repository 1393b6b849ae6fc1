//! Tokenizer for the embedded script language.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

/// A lexing or parsing failure, positioned by line.
#[derive(Debug)]
pub struct SyntaxError {
    pub line: u32,
    pub message: String,
}

impl SyntaxError {
    pub fn new(
        line: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Number(f64),
    Str(String),
    // keywords
    And,
    Break,
    Do,
    Else,
    Elseif,
    End,
    False,
    For,
    Function,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Return,
    Then,
    True,
    While,
    // symbols
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Hash,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Comma,
    Dot,
    Concat,
    Ellipsis,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Name(n) => format!("'{}'", n),
            TokenKind::Number(n) => format!("'{}'", n),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Eof => "<eof>".to_string(),
            other => format!("{:?}", other).to_lowercase(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut lexer = Lexer {
        chars: source.chars().peekable(),
        line: 1,
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: u32,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn run(&mut self) -> Result<(), SyntaxError> {
        while let Some(&c) = self.chars.peek() {
            match c {
                '\n' => {
                    self.line += 1;
                    self.chars.next();
                }
                ' ' | '\t' | '\r' => {
                    self.chars.next();
                }
                '-' => {
                    self.chars.next();
                    if self.chars.peek() == Some(&'-') {
                        self.chars.next();
                        self.skip_line_comment();
                    } else {
                        self.push(TokenKind::Minus);
                    }
                }
                '0'..='9' => self.number()?,
                '"' | '\'' => self.string(c)?,
                _ if c.is_alphabetic() || c == '_' => self.name(),
                _ => self.symbol(c)?,
            }
        }
        self.push(TokenKind::Eof);
        Ok(())
    }

    fn push(
        &mut self,
        kind: TokenKind,
    ) {
        self.tokens.push(Token {
            kind,
            line: self.line,
        });
    }

    fn skip_line_comment(&mut self) {
        for c in self.chars.by_ref() {
            if c == '\n' {
                self.line += 1;
                break;
            }
        }
    }

    fn number(&mut self) -> Result<(), SyntaxError> {
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' {
                // '..' is the concat operator, not part of a number
                if c == '.' && text.ends_with('.') {
                    break;
                }
                text.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        if text.ends_with('.') && self.chars.peek() == Some(&'.') {
            // backtrack is not possible; treat "1.." as number then concat
            text.pop();
            let value = text
                .parse::<f64>()
                .map_err(|_| SyntaxError::new(self.line, format!("malformed number '{}'", text)))?;
            self.push(TokenKind::Number(value));
            self.chars.next();
            self.push(TokenKind::Concat);
            return Ok(());
        }
        let value = text
            .parse::<f64>()
            .map_err(|_| SyntaxError::new(self.line, format!("malformed number '{}'", text)))?;
        self.push(TokenKind::Number(value));
        Ok(())
    }

    fn string(
        &mut self,
        quote: char,
    ) -> Result<(), SyntaxError> {
        self.chars.next();
        let mut text = String::new();
        loop {
            let Some(c) = self.chars.next() else {
                return Err(SyntaxError::new(self.line, "unterminated string"));
            };
            match c {
                '\n' => return Err(SyntaxError::new(self.line, "unterminated string")),
                '\\' => {
                    let Some(esc) = self.chars.next() else {
                        return Err(SyntaxError::new(self.line, "unterminated string"));
                    };
                    match esc {
                        'n' => text.push('\n'),
                        't' => text.push('\t'),
                        'r' => text.push('\r'),
                        '\\' => text.push('\\'),
                        '"' => text.push('"'),
                        '\'' => text.push('\''),
                        '0' => text.push('\0'),
                        other => {
                            return Err(SyntaxError::new(
                                self.line,
                                format!("invalid escape sequence '\\{}'", other),
                            ))
                        }
                    }
                }
                _ if c == quote => break,
                _ => text.push(c),
            }
        }
        self.push(TokenKind::Str(text));
        Ok(())
    }

    fn name(&mut self) {
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        let kind = match text.as_str() {
            "and" => TokenKind::And,
            "break" => TokenKind::Break,
            "do" => TokenKind::Do,
            "else" => TokenKind::Else,
            "elseif" => TokenKind::Elseif,
            "end" => TokenKind::End,
            "false" => TokenKind::False,
            "for" => TokenKind::For,
            "function" => TokenKind::Function,
            "if" => TokenKind::If,
            "in" => TokenKind::In,
            "local" => TokenKind::Local,
            "nil" => TokenKind::Nil,
            "not" => TokenKind::Not,
            "or" => TokenKind::Or,
            "return" => TokenKind::Return,
            "then" => TokenKind::Then,
            "true" => TokenKind::True,
            "while" => TokenKind::While,
            _ => TokenKind::Name(text),
        };
        self.push(kind);
    }

    fn symbol(
        &mut self,
        c: char,
    ) -> Result<(), SyntaxError> {
        self.chars.next();
        let kind = match c {
            '+' => TokenKind::Plus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '#' => TokenKind::Hash,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ';' => TokenKind::Semi,
            ',' => TokenKind::Comma,
            '=' => {
                if self.chars.peek() == Some(&'=') {
                    self.chars.next();
                    TokenKind::EqEq
                } else {
                    TokenKind::Assign
                }
            }
            '~' => {
                if self.chars.peek() == Some(&'=') {
                    self.chars.next();
                    TokenKind::NotEq
                } else {
                    return Err(SyntaxError::new(self.line, "unexpected character '~'"));
                }
            }
            '<' => {
                if self.chars.peek() == Some(&'=') {
                    self.chars.next();
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.chars.peek() == Some(&'=') {
                    self.chars.next();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '.' => {
                if self.chars.peek() == Some(&'.') {
                    self.chars.next();
                    if self.chars.peek() == Some(&'.') {
                        self.chars.next();
                        TokenKind::Ellipsis
                    } else {
                        TokenKind::Concat
                    }
                } else {
                    TokenKind::Dot
                }
            }
            other => {
                return Err(SyntaxError::new(
                    self.line,
                    format!("unexpected character '{}'", other),
                ))
            }
        };
        self.push(kind);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .expect("tokenize")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lexes_basic_statement() {
        let toks = kinds("local x = 1 + 2");
        assert_eq!(
            toks,
            vec![
                TokenKind::Local,
                TokenKind::Name("x".into()),
                TokenKind::Assign,
                TokenKind::Number(1.0),
                TokenKind::Plus,
                TokenKind::Number(2.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_strings_with_escapes() {
        let toks = kinds(r#"print("a\tb")"#);
        assert!(toks.contains(&TokenKind::Str("a\tb".into())));
    }

    #[test]
    fn distinguishes_concat_from_dots() {
        assert_eq!(
            kinds("a .. b"),
            vec![
                TokenKind::Name("a".into()),
                TokenKind::Concat,
                TokenKind::Name("b".into()),
                TokenKind::Eof,
            ]
        );
        assert!(kinds("f(...)").contains(&TokenKind::Ellipsis));
    }

    #[test]
    fn comments_are_skipped_and_lines_tracked() {
        let toks = tokenize("-- header\nx = 2").expect("tokenize");
        assert_eq!(toks[0].kind, TokenKind::Name("x".into()));
        assert_eq!(toks[0].line, 2);
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(tokenize("\"abc").is_err());
    }
}
