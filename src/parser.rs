use crate::lexer::{Lexer, Token, TokenKind};
use std::fmt;
use thiserror::Error;

/// Kind of redirection
///
/// Defines the specific operation mode for an I/O redirection (`<`, `>`, `>>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOp {
    /// Input redirection (`<`): reads from a file that must already exist.
    Input,
    /// Output redirection (`>`): creates the file or truncates it.
    Output,
    /// Output redirection with append (`>>`): creates the file or appends to it.
    Append,
}

impl RedirectOp {
    fn from_operator(op: &str) -> Option<Self> {
        match op {
            "<" => Some(RedirectOp::Input),
            ">" => Some(RedirectOp::Output),
            ">>" => Some(RedirectOp::Append),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RedirectOp::Input => "<",
            RedirectOp::Output => ">",
            RedirectOp::Append => ">>",
        }
    }

    /// Descriptor redirected when no io number is given.
    pub fn default_fd(self) -> i32 {
        match self {
            RedirectOp::Input => 0,
            RedirectOp::Output | RedirectOp::Append => 1,
        }
    }
}

/// An I/O redirection specification, e.g. `2>> log.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    /// Explicit descriptor, if the operator was prefixed by one.
    pub io_number: Option<i32>,
    pub op: RedirectOp,
    /// The file the descriptor is rebound to.
    pub word: String,
}

impl Redirection {
    /// The descriptor this redirection rebinds.
    pub fn target_fd(&self) -> i32 {
        self.io_number.unwrap_or_else(|| self.op.default_fd())
    }
}

/// A **simple command**: the leaf execution unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleCommand {
    /// Command name; `None` for an assignment-only (or redirection-only) line.
    pub name: Option<String>,
    /// Argument vector, `args[0]` is the name when there is one.
    pub args: Vec<String>,
    /// Redirections in source order; later ones win for the same descriptor.
    pub redirections: Vec<Redirection>,
    /// `KEY=VALUE` strings in source order.
    pub assignments: Vec<String>,
}

/// AST node for the shell
///
/// Binary nodes are left-associative chains: `a | b | c` is
/// `Pipeline(Pipeline(a, b), c)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AstNode {
    Command(SimpleCommand),
    /// `left | right`
    Pipeline(Box<AstNode>, Box<AstNode>),
    /// `left && right` or `left || right`
    AndOr {
        left: Box<AstNode>,
        op: AndOrOp,
        right: Box<AstNode>,
    },
    /// `left ; right`
    Sequence(Box<AstNode>, Box<AstNode>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AndOrOp {
    And,
    Or,
}

impl AndOrOp {
    pub fn as_str(self) -> &'static str {
        match self {
            AndOrOp::And => "&&",
            AndOrOp::Or => "||",
        }
    }
}

impl AstNode {
    /// Operator text of a binary node, `None` for a command.
    pub fn operator(&self) -> Option<&'static str> {
        match self {
            AstNode::Command(_) => None,
            AstNode::Pipeline(..) => Some("|"),
            AstNode::AndOr { op, .. } => Some(op.as_str()),
            AstNode::Sequence(..) => Some(";"),
        }
    }
}

/// Renders the tree back as a fully parenthesized line. Handy in logs and tests.
impl fmt::Display for AstNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AstNode::Command(cmd) => {
                let mut parts: Vec<String> = cmd.args.clone();
                parts.extend(cmd.assignments.iter().cloned());
                for redir in &cmd.redirections {
                    let fd = redir.io_number.map(|n| n.to_string()).unwrap_or_default();
                    parts.push(format!("{}{}{}", fd, redir.op.as_str(), redir.word));
                }
                write!(f, "{}", parts.join(" "))
            }
            AstNode::Pipeline(left, right) | AstNode::Sequence(left, right) => {
                write!(f, "({} {} {})", left, self.operator().unwrap_or_default(), right)
            }
            AstNode::AndOr { left, op, right } => write!(f, "({} {} {})", left, op.as_str(), right),
        }
    }
}

/// Errors that can occur during the AST construction (parsing) phase.
///
/// Whatever was already built is dropped; the line contributes nothing to execute.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParsingError {
    /// The lexer hit a character it does not recognize.
    #[error("{line}:{column}: unrecognized character `{text}`")]
    Lex {
        text: String,
        line: usize,
        column: usize,
    },
    /// A redirection operator was not followed by a word.
    #[error("{line}:{column}: expected a file name after `{operator}`, found {found}")]
    MissingRedirectTarget {
        operator: String,
        found: String,
        line: usize,
        column: usize,
    },
    /// The io number does not fit a file descriptor.
    #[error("{line}:{column}: bad file descriptor number `{text}`")]
    BadIoNumber {
        text: String,
        line: usize,
        column: usize,
    },
    /// Tokens remain after a complete command list.
    #[error("{}:{}: syntax error near unexpected token {}", .0.line, .0.column, .0)]
    UnexpectedToken(Token),
}

/// Recursive-descent parser with one token of lookahead.
pub struct Parser {
    lexer: Lexer,
    current: Token,
}

impl Parser {
    pub fn new(mut lexer: Lexer) -> Self {
        let current = lexer.next_token();
        Parser { lexer, current }
    }

    /// Parses a whole line: `list EOF`. An empty line yields `Ok(None)`.
    pub fn parse_input(mut self) -> Result<Option<AstNode>, ParsingError> {
        if self.current.kind == TokenKind::EndOfInput {
            return Ok(None);
        }

        let ast = self.parse_list()?;

        match self.current.kind {
            TokenKind::EndOfInput => Ok(Some(ast)),
            TokenKind::Error => Err(self.lex_error()),
            _ => Err(ParsingError::UnexpectedToken(self.current)),
        }
    }

    fn advance(&mut self) -> Token {
        let next = self.lexer.next_token();
        std::mem::replace(&mut self.current, next)
    }

    fn lex_error(&self) -> ParsingError {
        ParsingError::Lex {
            text: self.current.text.clone(),
            line: self.current.line,
            column: self.current.column,
        }
    }

    /// list := and_or (';' and_or)* [';']
    fn parse_list(&mut self) -> Result<AstNode, ParsingError> {
        let mut left = self.parse_and_or()?;

        while self.current.is_operator(";") {
            self.advance();
            if self.current.kind == TokenKind::EndOfInput {
                break;
            }
            let right = self.parse_and_or()?;
            left = AstNode::Sequence(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    /// and_or := pipeline (('&&' | '||') pipeline)*
    fn parse_and_or(&mut self) -> Result<AstNode, ParsingError> {
        let mut left = self.parse_pipeline()?;

        loop {
            let op = if self.current.is_operator("&&") {
                AndOrOp::And
            } else if self.current.is_operator("||") {
                AndOrOp::Or
            } else {
                break;
            };
            self.advance();
            let right = self.parse_pipeline()?;
            left = AstNode::AndOr {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// pipeline := command ('|' command)*
    fn parse_pipeline(&mut self) -> Result<AstNode, ParsingError> {
        let mut left = self.parse_command()?;

        while self.current.is_operator("|") {
            self.advance();
            let right = self.parse_command()?;
            left = AstNode::Pipeline(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    /// command := (Word Word*)? (AssignmentWord | redirection)*
    fn parse_command(&mut self) -> Result<AstNode, ParsingError> {
        let mut cmd = SimpleCommand::default();

        while self.current.kind == TokenKind::Word {
            let word = self.advance().text;
            if cmd.name.is_none() {
                cmd.name = Some(word.clone());
            }
            cmd.args.push(word);
        }

        loop {
            match self.current.kind {
                TokenKind::AssignmentWord => {
                    cmd.assignments.push(self.advance().text);
                }
                TokenKind::IoNumber => {
                    cmd.redirections.push(self.parse_redirection()?);
                }
                TokenKind::Operator if RedirectOp::from_operator(&self.current.text).is_some() => {
                    cmd.redirections.push(self.parse_redirection()?);
                }
                _ => break,
            }
        }

        Ok(AstNode::Command(cmd))
    }

    /// redirection := IoNumber? ('<' | '>' | '>>') Word
    fn parse_redirection(&mut self) -> Result<Redirection, ParsingError> {
        let io_number = if self.current.kind == TokenKind::IoNumber {
            let token = self.advance();
            let fd = token.text.parse::<i32>().map_err(|_| ParsingError::BadIoNumber {
                text: token.text.clone(),
                line: token.line,
                column: token.column,
            })?;
            Some(fd)
        } else {
            None
        };

        // The lexer only emits an io number right before `<` or `>`.
        let op_token = self.advance();
        let op = match RedirectOp::from_operator(&op_token.text) {
            Some(op) if op_token.kind == TokenKind::Operator => op,
            _ => return Err(ParsingError::UnexpectedToken(op_token)),
        };

        match self.current.kind {
            TokenKind::Word => Ok(Redirection {
                io_number,
                op,
                word: self.advance().text,
            }),
            TokenKind::Error => Err(self.lex_error()),
            _ => Err(ParsingError::MissingRedirectTarget {
                operator: op_token.text,
                found: self.current.to_string(),
                line: self.current.line,
                column: self.current.column,
            }),
        }
    }
}

/// Lexes and parses one line of input.
///
/// Returns `Ok(None)` for a blank line and an error for anything malformed.
pub fn parse_line(line: &str) -> Result<Option<AstNode>, ParsingError> {
    let ast = Parser::new(Lexer::new(line)).parse_input()?;
    if let Some(ast) = &ast {
        tracing::debug!(%ast, "parsed");
    }
    Ok(ast)
}
