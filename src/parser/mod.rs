//! Statement parser - PEST-based tokenizer for workflow lines
//!
//! One statement per non-blank line. The first term selects the kind:
//! `foreach F`, `wait N`, `wait N until F`, otherwise the whole trimmed line
//! names a function to call.

use pest::Parser;
use pest_derive::Parser;

use crate::errors::ParseError;
use crate::types::{Program, Statement, StatementKind};


const KEYWORD_LOOP: &str = "foreach";
const KEYWORD_WAIT: &str = "wait";
const KEYWORD_UNTIL: &str = "until";

/* ===================== PEST Parser ===================== */

#[derive(Parser)]
#[grammar = "parser/fig.pest"]
struct FigParser;

pub type ParseResult<T> = Result<T, ParseError>;

/* ===================== Public API ===================== */

/// Parse a whole workflow file
pub fn parse_program(source: &str) -> ParseResult<Program> {
    parse_lines(source.lines())
}

/// Parse an ordered list of workflow lines
///
/// Blank lines are dropped before step names are assigned, so positions are
/// counted over statements only.
pub fn parse_lines<I, S>(lines: I) -> ParseResult<Program>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut statements = Vec::new();

    for (offset, line) in lines.into_iter().enumerate() {
        let text = line.as_ref().trim();
        if text.is_empty() {
            continue;
        }
        let statement = parse_line(text, offset + 1, statements.len())?;
        statements.push(statement);
    }

    if statements.is_empty() {
        return Err(ParseError::Empty);
    }

    tracing::debug!(statements = statements.len(), "parsed workflow");
    Ok(Program::new(statements))
}

/* ===================== Line Parsing ===================== */

fn parse_line(text: &str, line: usize, index: usize) -> ParseResult<Statement> {
    let terms = tokenize(text, line)?;
    let (command, args) = match terms.split_first() {
        Some((command, args)) => (*command, args),
        None => return Err(syntax(text, line, "empty statement")),
    };

    let kind = match command {
        KEYWORD_LOOP => parse_loop(args, text, line)?,
        KEYWORD_WAIT => parse_wait(args, text, line)?,
        _ => StatementKind::FunctionCall {
            function: text.to_string(),
        },
    };

    Ok(Statement::new(text, line, kind, index))
}

fn tokenize<'a>(text: &'a str, line: usize) -> ParseResult<Vec<&'a str>> {
    let mut pairs = FigParser::parse(Rule::line, text)
        .map_err(|err| syntax(text, line, err.to_string()))?;

    let terms = match pairs.next() {
        Some(pair) => pair
            .into_inner()
            .filter(|term| term.as_rule() == Rule::term)
            .map(|term| term.as_str())
            .collect(),
        None => Vec::new(),
    };

    Ok(terms)
}

fn parse_loop(args: &[&str], text: &str, line: usize) -> ParseResult<StatementKind> {
    match args {
        [function] => Ok(StatementKind::Loop {
            function: function.to_string(),
        }),
        _ => Err(syntax(
            text,
            line,
            "foreach takes exactly one function name",
        )),
    }
}

fn parse_wait(args: &[&str], text: &str, line: usize) -> ParseResult<StatementKind> {
    match args {
        [seconds] => Ok(StatementKind::Wait {
            seconds: parse_seconds(seconds, text, line)?,
        }),
        [seconds, KEYWORD_UNTIL, condition] => Ok(StatementKind::WaitUntil {
            seconds: parse_seconds(seconds, text, line)?,
            condition: condition.to_string(),
        }),
        _ => Err(syntax(
            text,
            line,
            "expected `wait <seconds>` or `wait <seconds> until <function>`",
        )),
    }
}

fn parse_seconds(term: &str, text: &str, line: usize) -> ParseResult<u64> {
    FigParser::parse(Rule::positive_int, term)
        .map_err(|_| syntax(text, line, format!("'{}' is not a positive integer", term)))?;

    term.parse::<u64>()
        .map_err(|_| syntax(text, line, format!("'{}' is out of range", term)))
}

fn syntax(text: &str, line: usize, reason: impl Into<String>) -> ParseError {
    ParseError::Syntax {
        line,
        raw: text.to_string(),
        reason: reason.into(),
    }
}
