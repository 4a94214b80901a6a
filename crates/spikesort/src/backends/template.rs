//! `{name}` placeholder substitution for generated control scripts.
//!
//! `{{` and `}}` produce literal braces. Every placeholder must have a value;
//! all missing names are reported together before anything is written.

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template placeholders without a value: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("malformed template at byte {position}: {message}")]
    Malformed { position: usize, message: String },
}

pub type Result<T> = std::result::Result<T, TemplateError>;

/// Values keyed by placeholder name.
#[derive(Debug, Default, Clone)]
pub struct Values(BTreeMap<&'static str, String>);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &'static str, value: impl ToString) -> &mut Self {
        self.0.insert(name, value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

enum Piece<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

fn parse(template: &str) -> Result<Vec<Piece<'_>>> {
    let bytes = template.as_bytes();
    let mut pieces = Vec::new();
    let mut text_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                pieces.push(Piece::Text(&template[text_start..=i]));
                i += 2;
                text_start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                pieces.push(Piece::Text(&template[text_start..=i]));
                i += 2;
                text_start = i;
            }
            b'{' => {
                let Some(len) = template[i + 1..].find('}') else {
                    return Err(TemplateError::Malformed {
                        position: i,
                        message: "unclosed '{'".to_string(),
                    });
                };
                let name = &template[i + 1..i + 1 + len];
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(TemplateError::Malformed {
                        position: i,
                        message: format!("invalid placeholder name '{name}'"),
                    });
                }
                pieces.push(Piece::Text(&template[text_start..i]));
                pieces.push(Piece::Placeholder(name));
                i += len + 2;
                text_start = i;
            }
            b'}' => {
                return Err(TemplateError::Malformed {
                    position: i,
                    message: "unmatched '}'".to_string(),
                });
            }
            _ => i += 1,
        }
    }
    pieces.push(Piece::Text(&template[text_start..]));
    Ok(pieces)
}

/// Placeholder names used by `template`, deduplicated.
pub fn placeholders(template: &str) -> Result<BTreeSet<String>> {
    Ok(parse(template)?
        .into_iter()
        .filter_map(|p| match p {
            Piece::Placeholder(name) => Some(name.to_string()),
            Piece::Text(_) => None,
        })
        .collect())
}

pub fn fill(template: &str, values: &Values) -> Result<String> {
    let pieces = parse(template)?;
    let missing: BTreeSet<String> = pieces
        .iter()
        .filter_map(|p| match p {
            Piece::Placeholder(name) if values.get(name).is_none() => Some((*name).to_string()),
            _ => None,
        })
        .collect();
    if !missing.is_empty() {
        return Err(TemplateError::Missing(missing.into_iter().collect()));
    }

    let mut out = String::with_capacity(template.len());
    for piece in pieces {
        match piece {
            Piece::Text(text) => out.push_str(text),
            Piece::Placeholder(name) => out.push_str(values.get(name).unwrap_or_default()),
        }
    }
    Ok(out)
}

/// MATLAB row vector literal, e.g. `[1 2.5 3]`.
pub fn matlab_vector<T: std::fmt::Display>(values: &[T]) -> String {
    let items: Vec<String> = values.iter().map(ToString::to_string).collect();
    format!("[{}]", items.join(" "))
}

/// MATLAB logical literal.
pub fn matlab_bool(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}
