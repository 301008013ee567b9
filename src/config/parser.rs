//! Lexer and recursive-descent parser for the block-structured config
//! syntax used by `inn.conf` and `inn-secrets.conf`:
//!
//! ```text
//! group_type [tag] {
//!    key: value;
//!    key: "quoted value with \n escapes";
//!    subgroup { ... }
//! }
//! ```
//!
//! The grammar never needs more than one token of lookahead, so parsing is
//! a plain recursive descent over a token stream produced by a `nom` lexer.
//! There is no error recovery: the first malformed token unwinds the whole
//! parse and reports failure with a line number, matching the original's
//! policy that partial results are not useful to the caller.

use std::collections::HashMap;
use std::fmt;

use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag, take_while, take_while1};
use nom::character::complete::{char as nchar, digit1, one_of};
use nom::combinator::{map, opt, recognize, value};
use nom::multi::many0;
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
    List(Vec<String>),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ConfigValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ConfigValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            ConfigValue::Integer(n) => write!(f, "{}", n),
            ConfigValue::Number(n) => write!(f, "{}", n),
            ConfigValue::String(s) => write!(f, "{:?}", s),
            ConfigValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

/// One `group_type [tag] { ... }` block, or the implicit top-level group
/// that holds bare `key: value;` pairs not wrapped in any block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigGroup {
    pub group_type: String,
    pub tag: Option<String>,
    pub params: HashMap<String, ConfigValue>,
    pub children: Vec<ConfigGroup>,
}

impl ConfigGroup {
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.params.get(key)
    }
}

#[derive(Debug)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parses a whole config file into the implicit top-level group.
pub fn parse_str(input: &str) -> Result<ConfigGroup, ParseError> {
    let mut root = ConfigGroup { group_type: "root".into(), ..Default::default() };
    let mut rest = input;

    loop {
        let (next, _) = skip_trivia(rest).map_err(|_| parse_err(line_of(input, rest), "lexer error"))?;
        rest = next;
        if rest.trim().is_empty() {
            break;
        }
        match parse_statement(rest) {
            Ok((next, Statement::Param(key, value))) => {
                root.params.insert(key, value);
                rest = next;
            }
            Ok((next, Statement::Group(group))) => {
                root.children.push(group);
                rest = next;
            }
            Err(_) => {
                return Err(parse_err(line_of(input, rest), "unexpected token"));
            }
        }
    }

    Ok(root)
}

fn line_of(full: &str, rest: &str) -> usize {
    let consumed = full.len() - rest.len();
    1 + full.as_bytes()[..consumed].iter().filter(|&&b| b == b'\n').count()
}

fn parse_err(line: usize, message: &str) -> ParseError {
    ParseError { line, message: message.to_string() }
}

enum Statement {
    Param(String, ConfigValue),
    Group(ConfigGroup),
}

fn parse_statement(input: &str) -> IResult<&str, Statement> {
    let (input, _) = skip_trivia(input)?;
    let (input, ident) = identifier(input)?;
    let (input, _) = skip_trivia(input)?;

    // `ident { ... }` or `ident tag { ... }` -- a nested group.
    if let Ok((rest, tag)) = opt::<_, _, nom::error::Error<&str>, _>(identifier)(input) {
        let (rest2, _) = skip_trivia(rest)?;
        if let Ok((after_brace, _)) = nchar::<_, nom::error::Error<&str>>('{')(rest2) {
            let (after_body, children_and_params) = parse_group_body(after_brace)?;
            let (after_close, _) = skip_trivia(after_body)?;
            let (after_close, _) = nchar('}')(after_close)?;
            let (params, children) = children_and_params;
            return Ok((
                after_close,
                Statement::Group(ConfigGroup { group_type: ident, tag, params, children }),
            ));
        }
    }

    // `ident { ... }` with no tag.
    let (input, brace) = opt(nchar::<_, nom::error::Error<&str>>('{'))(input)?;
    if brace.is_some() {
        let (after_body, (params, children)) = parse_group_body(input)?;
        let (after_close, _) = skip_trivia(after_body)?;
        let (after_close, _) = nchar('}')(after_close)?;
        return Ok((
            after_close,
            Statement::Group(ConfigGroup { group_type: ident, tag: None, params, children }),
        ));
    }

    // Otherwise `key: value;` or `key: value\n`.
    let (input, _) = skip_trivia(input)?;
    let (input, _) = nchar(':')(input)?;
    let (input, _) = skip_trivia(input)?;
    let (input, value) = parse_value(input)?;
    let (input, _) = skip_trivia(input)?;
    let (input, _) = opt(nchar(';'))(input)?;
    Ok((input, Statement::Param(ident, value)))
}

fn parse_group_body(input: &str) -> IResult<&str, (HashMap<String, ConfigValue>, Vec<ConfigGroup>)> {
    let mut params = HashMap::new();
    let mut children = Vec::new();
    let mut rest = input;
    loop {
        let (next, _) = skip_trivia(rest)?;
        rest = next;
        if rest.starts_with('}') || rest.is_empty() {
            break;
        }
        match parse_statement(rest) {
            Ok((next, Statement::Param(key, value))) => {
                params.insert(key, value);
                rest = next;
            }
            Ok((next, Statement::Group(group))) => {
                children.push(group);
                rest = next;
            }
            Err(e) => return Err(e),
        }
    }
    Ok((rest, (params, children)))
}

fn parse_value(input: &str) -> IResult<&str, ConfigValue> {
    alt((
        map(quoted_string, ConfigValue::String),
        map(bool_literal, ConfigValue::Bool),
        map(number_literal, |n| {
            if n.fract() == 0.0 {
                ConfigValue::Integer(n as i64)
            } else {
                ConfigValue::Number(n)
            }
        }),
        map(bracketed_list, ConfigValue::List),
        map(bare_word, |s| ConfigValue::String(s.to_string())),
    ))(input)
}

fn bool_literal(input: &str) -> IResult<&str, bool> {
    alt((
        value(true, alt((tag("yes"), tag("true"), tag("on")))),
        value(false, alt((tag("no"), tag("false"), tag("off")))),
    ))(input)
}

fn number_literal(input: &str) -> IResult<&str, f64> {
    map(
        recognize(pair(opt(nchar('-')), pair(digit1, opt(pair(nchar('.'), digit1))))),
        |s: &str| s.parse::<f64>().unwrap_or(0.0),
    )(input)
}

fn bare_word(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && c != ';' && c != '}' && c != '{')(input)
}

/// Like [`bare_word`] but also stops at `,` and `]`, so an unquoted list
/// item (`[a, b]`) doesn't swallow its own separator or closing bracket.
fn bare_word_list_item(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && c != ';' && c != '}' && c != '{' && c != ',' && c != ']')(input)
}

fn bracketed_list(input: &str) -> IResult<&str, Vec<String>> {
    delimited(
        pair(nchar('['), skip_trivia),
        map(
            nom::multi::separated_list0(
                delimited(skip_trivia, nchar(','), skip_trivia),
                alt((quoted_string, map(bare_word_list_item, |s| s.to_string()))),
            ),
            |v| v,
        ),
        pair(skip_trivia, nchar(']')),
    )(input)
}

fn quoted_string(input: &str) -> IResult<&str, String> {
    delimited(
        nchar('"'),
        map(
            opt(escaped_transform(
                is_not("\"\\"),
                '\\',
                alt((
                    value("\\", tag("\\")),
                    value("\"", tag("\"")),
                    value("\n", tag("n")),
                    value("\t", tag("t")),
                    value("\n", nchar('\n')),
                )),
            )),
            |s: Option<String>| s.unwrap_or_default(),
        ),
        nchar('"'),
    )(input)
}

fn identifier(input: &str) -> IResult<&str, String> {
    map(
        recognize(pair(
            one_of("abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_"),
            take_while(|c: char| c.is_alphanumeric() || c == '_' || c == '-' || c == '.'),
        )),
        |s: &str| s.to_string(),
    )(input)
}

/// Skips whitespace and `#`-to-end-of-line comments.
fn skip_trivia(input: &str) -> IResult<&str, ()> {
    let (input, _) = many0(alt((
        value((), take_while1(|c: char| c.is_whitespace())),
        value((), pair(nchar('#'), is_not("\n"))),
    )))(input)?;
    Ok((input, ()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_key_values() {
        let g = parse_str("pathhost: news.example.com\nmaxforks: 5\n").unwrap();
        assert_eq!(g.get("pathhost").unwrap().as_str(), Some("news.example.com"));
        assert_eq!(g.get("maxforks").unwrap().as_integer(), Some(5));
    }

    #[test]
    fn parses_nested_group_with_tag() {
        let src = r#"
            cancels {
                canlockadmin: ["secret-one", "secret-two"];
                canlockuser: [];
            }
        "#;
        let g = parse_str(src).unwrap();
        assert_eq!(g.children.len(), 1);
        let cancels = &g.children[0];
        assert_eq!(cancels.group_type, "cancels");
        assert_eq!(
            cancels.get("canlockadmin").unwrap().as_list().unwrap(),
            &["secret-one".to_string(), "secret-two".to_string()]
        );
        assert_eq!(cancels.get("canlockuser").unwrap().as_list().unwrap().len(), 0);
    }

    #[test]
    fn unquoted_list_items_stop_at_comma_and_bracket() {
        let g = parse_str("hosts: [alpha, beta, gamma];").unwrap();
        assert_eq!(
            g.get("hosts").unwrap().as_list().unwrap(),
            &["alpha".to_string(), "beta".to_string(), "gamma".to_string()]
        );
    }

    #[test]
    fn parses_quoted_string_with_escapes() {
        let g = parse_str(r#"note: "line one\nline two";"#).unwrap();
        assert_eq!(g.get("note").unwrap().as_str(), Some("line one\nline two"));
    }

    #[test]
    fn comments_are_ignored() {
        let g = parse_str("# a full-line comment\nenabled: yes # trailing comment\n").unwrap();
        assert_eq!(g.get("enabled").unwrap().as_bool(), Some(true));
    }

    #[test]
    fn round_trip_preserves_structure() {
        let src = "storagebackend: timehash;\nclassrange: 100;\n";
        let first = parse_str(src).unwrap();
        let printed = format!(
            "storagebackend: {};\nclassrange: {};\n",
            first.get("storagebackend").unwrap(),
            first.get("classrange").unwrap()
        );
        let second = parse_str(&printed).unwrap();
        assert_eq!(first.params.len(), second.params.len());
        assert_eq!(first.get("classrange"), second.get("classrange"));
    }
}
