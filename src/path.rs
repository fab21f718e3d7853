use jsonptr::{PointerBuf, Token};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;

/// The document root
pub const ROOT: &str = "$";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("expression '{0}' must start at the document root '$'")]
    MissingRoot(String),

    #[error("expression '{expr}' has an empty member name at position {pos}")]
    EmptyMember { expr: String, pos: usize },

    #[error("expression '{0}' has an unclosed bracket")]
    UnclosedBracket(String),

    #[error("expression '{expr}' has an invalid bracket step '[{content}]'")]
    InvalidBracket { expr: String, content: String },

    #[error("expression '{expr}' has an unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { expr: String, ch: char, pos: usize },
}

/// A single addressing step of a path expression
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// `.name` or `['name']`
    Member(String),
    /// `[n]`
    Index(usize),
    /// `.*` or `[*]`
    Wildcard,
    /// `..`
    Descendant,
    /// `[?(...)]`, unions and slices
    Filter(String),
}

impl Segment {
    /// Steps that may address more than one value
    pub fn is_prohibited(&self) -> bool {
        matches!(
            self,
            Segment::Wildcard | Segment::Descendant | Segment::Filter(_)
        )
    }

    fn to_token(&self) -> Option<Token<'static>> {
        match self {
            Segment::Member(name) => Some(Token::new(name.clone())),
            Segment::Index(i) => Some(Token::new(i.to_string())),
            _ => None,
        }
    }
}

/// A path expression rooted at `$`, e.g. `$.order.items[0]`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathExpression {
    expression: String,
    segments: Vec<Segment>,
}

impl PathExpression {
    pub fn parse(expression: impl Into<String>) -> Result<Self, PathError> {
        let expression = expression.into();
        let segments = parse_segments(&expression)?;
        Ok(Self {
            expression,
            segments,
        })
    }

    pub fn root() -> Self {
        Self {
            expression: ROOT.to_string(),
            segments: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.expression
    }

    /// The first step that may address more than one value
    pub fn prohibited_segment(&self) -> Option<&Segment> {
        self.segments.iter().find(|s| s.is_prohibited())
    }

    /// Convert the expression to a JSON pointer
    ///
    /// Returns `None` if the expression uses any prohibited step.
    pub fn to_pointer(&self) -> Option<PointerBuf> {
        let mut pointer = PointerBuf::new();
        for segment in self.segments.iter() {
            pointer.push_back(segment.to_token()?);
        }
        Some(pointer)
    }
}

impl Display for PathExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

impl FromStr for PathExpression {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PathExpression {
    type Error = PathError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<PathExpression> for String {
    fn from(path: PathExpression) -> String {
        path.expression
    }
}

fn is_delimiter(c: char) -> bool {
    c == '.' || c == '['
}

fn parse_segments(expr: &str) -> Result<Vec<Segment>, PathError> {
    let rest = expr
        .strip_prefix(ROOT)
        .ok_or_else(|| PathError::MissingRoot(expr.to_string()))?;

    let chars: Vec<char> = rest.chars().collect();
    // positions are reported relative to the full expression
    let offset = ROOT.len();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                i += 1;
                if chars.get(i) == Some(&'.') {
                    segments.push(Segment::Descendant);
                    i += 1;
                    // `$..[0]` and `$..name` both continue after the descent
                    if chars.get(i) == Some(&'[') {
                        continue;
                    }
                }
                let start = i;
                while i < chars.len() && !is_delimiter(chars[i]) {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                match name.as_str() {
                    "" => {
                        return Err(PathError::EmptyMember {
                            expr: expr.to_string(),
                            pos: offset + start,
                        })
                    }
                    "*" => segments.push(Segment::Wildcard),
                    _ => segments.push(Segment::Member(name)),
                }
            }
            '[' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| start + p)
                    .ok_or_else(|| PathError::UnclosedBracket(expr.to_string()))?;
                let content: String = chars[start..end].iter().collect();
                segments.push(parse_bracket(expr, content)?);
                i = end + 1;
            }
            ch => {
                return Err(PathError::UnexpectedChar {
                    expr: expr.to_string(),
                    ch,
                    pos: offset + i,
                })
            }
        }
    }

    Ok(segments)
}

fn parse_bracket(expr: &str, content: String) -> Result<Segment, PathError> {
    let trimmed = content.trim();
    if trimmed == "*" {
        return Ok(Segment::Wildcard);
    }

    for quote in ['\'', '"'] {
        if let Some(name) = trimmed
            .strip_prefix(quote)
            .and_then(|s| s.strip_suffix(quote))
        {
            if name.is_empty() {
                break;
            }
            return Ok(Segment::Member(name.to_string()));
        }
    }

    if let Ok(index) = trimmed.parse::<usize>() {
        return Ok(Segment::Index(index));
    }

    if trimmed.starts_with('?') || trimmed.contains(',') || trimmed.contains(':') {
        return Ok(Segment::Filter(content));
    }

    Err(PathError::InvalidBracket {
        expr: expr.to_string(),
        content,
    })
}
