//! Lexical analysis (tokenization) of a single command line.
//!
//! The lexer is a cursor over the input that hands out one [`Token`] per call to
//! [`Lexer::next_token`]. Tokens are never collected up front: the parser pulls them
//! lazily with one token of lookahead. Once the input is exhausted every further call
//! yields [`TokenKind::EndOfInput`].

use std::fmt;

/// Classification of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// A plain word: command name, argument or redirection target.
    Word,
    /// A word of the form `NAME=value`.
    AssignmentWord,
    /// Digits immediately followed by `<` or `>`, e.g. the `2` in `2>err`.
    IoNumber,
    /// One of `|`, `||`, `&&`, `;`, `<`, `>`, `>>`.
    Operator,
    /// The input is exhausted.
    EndOfInput,
    /// An unrecognized character. The lexer stops producing tokens after this one.
    Error,
}

/// A token together with its source position (1-based line and column).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    /// Returns true if this is an operator token with the given text.
    pub fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.text == op
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::EndOfInput => write!(f, "end of input"),
            _ => write!(f, "`{}`", self.text),
        }
    }
}

/// Characters that may appear in a word.
pub fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '@' | '+')
}

/// Characters that start an operator.
pub fn is_operator_char(c: char) -> bool {
    matches!(c, '|' | '>' | '<' | '&' | ';')
}

fn is_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r')
}

/// Stateful cursor over one input line.
pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    has_error: bool,
}

impl Lexer {
    /// Creates a lexer positioned at the start of `input`.
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            has_error: false,
        }
    }

    /// True once an unrecognized character has been seen. Sticky for the rest of the line.
    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// Produces the next token.
    pub fn next_token(&mut self) -> Token {
        if self.has_error {
            return self.token(TokenKind::EndOfInput, String::new(), self.line, self.column);
        }

        while self.peek_char().is_some_and(is_whitespace) {
            self.read_char();
        }

        let (line, column) = (self.line, self.column);
        let Some(c) = self.peek_char() else {
            return self.token(TokenKind::EndOfInput, String::new(), line, column);
        };

        if c.is_ascii_digit() {
            if let Some(digits) = self.try_io_number() {
                return self.token(TokenKind::IoNumber, digits, line, column);
            }
        }

        if is_word_char(c) {
            return self.read_word(line, column);
        }

        if is_operator_char(c) {
            return self.read_operator(line, column);
        }

        self.read_char();
        self.has_error = true;
        self.token(TokenKind::Error, c.to_string(), line, column)
    }

    fn token(&self, kind: TokenKind, text: String, line: usize, column: usize) -> Token {
        let token = Token {
            kind,
            text,
            line,
            column,
        };
        tracing::trace!(?token, "lexed");
        token
    }

    fn peek_char(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn read_char(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    /// Consumes a run of digits if it is directly followed by `<` or `>`.
    /// Otherwise the cursor is put back where it was.
    fn try_io_number(&mut self) -> Option<String> {
        let saved = (self.pos, self.line, self.column);
        let mut digits = String::new();
        while let Some(c) = self.peek_char().filter(char::is_ascii_digit) {
            digits.push(c);
            self.read_char();
        }
        if matches!(self.peek_char(), Some('<' | '>')) {
            return Some(digits);
        }
        (self.pos, self.line, self.column) = saved;
        None
    }

    fn read_word(&mut self, line: usize, column: usize) -> Token {
        let mut text = String::new();
        let mut kind = TokenKind::Word;

        while let Some(c) = self.peek_char() {
            if is_word_char(c) {
                text.push(c);
            } else if c == '=' && (kind == TokenKind::AssignmentWord || !text.is_empty()) {
                kind = TokenKind::AssignmentWord;
                text.push(c);
            } else {
                break;
            }
            self.read_char();
        }

        self.token(kind, text, line, column)
    }

    fn read_operator(&mut self, line: usize, column: usize) -> Token {
        let first = self.peek_char().unwrap_or_default();
        let second = self.input.get(self.pos + 1).copied();

        let text = match (first, second) {
            ('>', Some('>')) => ">>",
            ('&', Some('&')) => "&&",
            ('|', Some('|')) => "||",
            ('|', _) => "|",
            ('>', _) => ">",
            ('<', _) => "<",
            (';', _) => ";",
            _ => {
                // a lone `&`: background jobs are not part of the grammar
                self.read_char();
                self.has_error = true;
                return self.token(TokenKind::Error, first.to_string(), line, column);
            }
        };

        for _ in 0..text.len() {
            self.read_char();
        }
        self.token(TokenKind::Operator, text.to_string(), line, column)
    }
}

/// Iterates over the tokens of a line, stopping after [`TokenKind::EndOfInput`] or
/// [`TokenKind::Error`] (neither of which is yielded for end of input).
impl Iterator for Lexer {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if self.has_error {
            return None;
        }
        let token = self.next_token();
        (token.kind != TokenKind::EndOfInput).then_some(token)
    }
}
