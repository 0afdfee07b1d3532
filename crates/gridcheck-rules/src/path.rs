//! Property-path splitting and segment classification.
//!
//! A path like `Breakers.Where(State,Equals,'open').Count()` addresses into
//! a payload object graph. Dots delimit segments except inside a function
//! call's argument list, where nested calls and quoted strings may contain
//! dots of their own.

use crate::error::{Result, RuleError};

/// One classified path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Plain property access, matched case-insensitively.
    Property(String),
    /// Keyed or positional access: `prop['key']` or `prop[2]`.
    Indexer { name: String, key: IndexKey },
    /// Function or macro call with raw trimmed arguments.
    Call { name: String, args: Vec<String> },
}

/// Indexer key shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKey {
    Str(String),
    Num(usize),
}

/// Splits and classifies property paths.
pub struct PathResolver;

impl PathResolver {
    /// Split a path on `.`, treating dots inside balanced parenthesis
    /// groups (and quoted strings) as part of the enclosing segment.
    pub fn split(path: &str) -> Result<Vec<String>> {
        let malformed = |reason: &str| RuleError::MalformedPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        if path.trim().is_empty() {
            return Err(malformed("empty path"));
        }

        let mut segments = Vec::new();
        let mut current = String::new();
        let mut depth = 0usize;
        let mut in_quote = false;

        for ch in path.chars() {
            match ch {
                '\'' => {
                    in_quote = !in_quote;
                    current.push(ch);
                }
                '(' if !in_quote => {
                    // A group must be attributed to a preceding function
                    // name token within the current segment.
                    if depth == 0 {
                        let owner_ok = current
                            .chars()
                            .next_back()
                            .map(|c| c.is_alphanumeric() || c == '_')
                            .unwrap_or(false);
                        if !owner_ok {
                            return Err(malformed("parenthesis group has no function name"));
                        }
                    }
                    depth += 1;
                    current.push(ch);
                }
                ')' if !in_quote => {
                    if depth == 0 {
                        return Err(malformed("unbalanced ')'"));
                    }
                    depth -= 1;
                    current.push(ch);
                }
                '.' if depth == 0 && !in_quote => {
                    if current.is_empty() {
                        return Err(malformed("empty segment"));
                    }
                    segments.push(std::mem::take(&mut current));
                }
                _ => current.push(ch),
            }
        }

        if in_quote {
            return Err(malformed("unterminated quote"));
        }
        if depth != 0 {
            return Err(malformed("unbalanced '('"));
        }
        if current.is_empty() {
            return Err(malformed("trailing '.'"));
        }
        segments.push(current);

        Ok(segments)
    }

    /// Classify one split segment.
    pub fn classify(segment: &str) -> Result<Segment> {
        let malformed = |reason: String| RuleError::MalformedPath {
            path: segment.to_string(),
            reason,
        };

        let segment = segment.trim();
        if let Some(open) = segment.find('(') {
            if !segment.ends_with(')') {
                return Err(malformed("call segment must end with ')'".to_string()));
            }
            let name = &segment[..open];
            if name.is_empty() || !is_identifier(name) {
                return Err(malformed(format!("invalid function name '{name}'")));
            }
            let inner = &segment[open + 1..segment.len() - 1];
            return Ok(Segment::Call {
                name: name.to_string(),
                args: split_args(inner),
            });
        }

        if let Some(open) = segment.find('[') {
            if !segment.ends_with(']') {
                return Err(malformed("indexer segment must end with ']'".to_string()));
            }
            let name = &segment[..open];
            if name.is_empty() || !is_identifier(name) {
                return Err(malformed(format!("invalid property name '{name}'")));
            }
            let raw_key = &segment[open + 1..segment.len() - 1];
            let key = if let Some(quoted) = unquote(raw_key) {
                IndexKey::Str(quoted.to_string())
            } else {
                let n: usize = raw_key
                    .trim()
                    .parse()
                    .map_err(|_| malformed(format!("invalid indexer key '{raw_key}'")))?;
                IndexKey::Num(n)
            };
            return Ok(Segment::Indexer {
                name: name.to_string(),
                key,
            });
        }

        if !is_identifier(segment) {
            return Err(malformed(format!("invalid property name '{segment}'")));
        }
        Ok(Segment::Property(segment.to_string()))
    }

    /// Split and classify a whole path.
    pub fn parse(path: &str) -> Result<Vec<Segment>> {
        Self::split(path)?
            .iter()
            .map(|s| Self::classify(s))
            .collect()
    }
}

/// Split a call argument list at top-level commas, trimming each argument.
/// Commas inside nested calls or quoted strings are preserved.
pub fn split_args(inner: &str) -> Vec<String> {
    if inner.trim().is_empty() {
        return Vec::new();
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_quote = false;

    for ch in inner.chars() {
        match ch {
            '\'' => {
                in_quote = !in_quote;
                current.push(ch);
            }
            '(' if !in_quote => {
                depth += 1;
                current.push(ch);
            }
            ')' if !in_quote => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 && !in_quote => {
                args.push(std::mem::take(&mut current).trim().to_string());
            }
            _ => current.push(ch),
        }
    }
    args.push(current.trim().to_string());
    args
}

/// Strip a single level of surrounding single quotes, if present.
pub fn unquote(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        Some(&trimmed[1..trimmed.len() - 1])
    } else {
        None
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_')
        && !s.chars().next().unwrap().is_numeric()
}
