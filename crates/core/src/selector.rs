//! Kubernetes label selector syntax, evaluated against cached objects.
//!
//! Supported requirements (comma separated, all must hold):
//! - `key=value`, `key==value`, `key!=value`
//! - `key`, `!key`
//! - `key in (a,b)`, `key notin (a,b)`

use std::fmt;

use crate::error::FleetError;
use crate::CachedObject;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, obj: &CachedObject) -> bool {
        match self {
            Requirement::Equals(k, v) => obj.label(k) == Some(v.as_str()),
            // `!=` also matches objects without the key, like the API server does.
            Requirement::NotEquals(k, v) => obj.label(k) != Some(v.as_str()),
            Requirement::In(k, vs) => obj.label(k).map(|l| vs.iter().any(|v| v == l)).unwrap_or(false),
            Requirement::NotIn(k, vs) => obj.label(k).map(|l| !vs.iter().any(|v| v == l)).unwrap_or(true),
            Requirement::Exists(k) => obj.label(k).is_some(),
            Requirement::DoesNotExist(k) => obj.label(k).is_none(),
        }
    }
}

/// Parsed selector. The empty selector matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Result<Self, FleetError> {
        let mut requirements = Vec::new();
        for part in split_top_level(input)? {
            let part = part.trim();
            if part.is_empty() {
                if input.trim().is_empty() {
                    continue;
                }
                return Err(FleetError::InvalidSelector(format!("empty requirement in '{}'", input)));
            }
            requirements.push(parse_requirement(part)?);
        }
        Ok(Self { requirements })
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, obj: &CachedObject) -> bool {
        self.requirements.iter().all(|r| r.matches(obj))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|r| match r {
                Requirement::Equals(k, v) => format!("{}={}", k, v),
                Requirement::NotEquals(k, v) => format!("{}!={}", k, v),
                Requirement::In(k, vs) => format!("{} in ({})", k, vs.join(",")),
                Requirement::NotIn(k, vs) => format!("{} notin ({})", k, vs.join(",")),
                Requirement::Exists(k) => k.clone(),
                Requirement::DoesNotExist(k) => format!("!{}", k),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

fn split_top_level(input: &str) -> Result<Vec<&str>, FleetError> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(FleetError::InvalidSelector(format!("unbalanced ')' in '{}'", input)));
                }
            }
            ',' if depth == 0 => {
                out.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(FleetError::InvalidSelector(format!("unbalanced '(' in '{}'", input)));
    }
    out.push(&input[start..]);
    Ok(out)
}

fn parse_requirement(part: &str) -> Result<Requirement, FleetError> {
    if let Some(key) = part.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(key_of(key)?));
    }
    if let Some((key, values)) = part.split_once(" notin ") {
        return Ok(Requirement::NotIn(key_of(key)?, values_of(values)?));
    }
    if let Some((key, values)) = part.split_once(" in ") {
        return Ok(Requirement::In(key_of(key)?, values_of(values)?));
    }
    if let Some((key, value)) = part.split_once("!=") {
        return Ok(Requirement::NotEquals(key_of(key)?, value_of(value)?));
    }
    if let Some((key, value)) = part.split_once("==") {
        return Ok(Requirement::Equals(key_of(key)?, value_of(value)?));
    }
    if let Some((key, value)) = part.split_once('=') {
        return Ok(Requirement::Equals(key_of(key)?, value_of(value)?));
    }
    Ok(Requirement::Exists(key_of(part)?))
}

fn key_of(raw: &str) -> Result<String, FleetError> {
    let key = raw.trim();
    let valid = !key.is_empty()
        && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(key.to_string())
    } else {
        Err(FleetError::InvalidSelector(format!("invalid label key '{}'", raw)))
    }
}

fn value_of(raw: &str) -> Result<String, FleetError> {
    let value = raw.trim();
    if value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        Ok(value.to_string())
    } else {
        Err(FleetError::InvalidSelector(format!("invalid label value '{}'", raw)))
    }
}

fn values_of(raw: &str) -> Result<Vec<String>, FleetError> {
    let inner = raw
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| FleetError::InvalidSelector(format!("expected '(v1,v2)', got '{}'", raw)))?;
    inner.split(',').map(value_of).collect()
}
