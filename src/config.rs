//! Directive-tree configuration parser.
//!
//! Parses the `<name arg>\n  key value\n</name>` block format. No serde
//! deserializer here — unlike JSON/TOML/YAML this format isn't a default
//! serde shape, so the tree is built with a small recursive-descent parser
//! instead.

use std::time::Duration;

use crate::error::ConfigError;

/// One parsed directive, e.g. `<match app.**> @type stdout </match>` becomes
/// `Element { name: "match", arg: Some("app.**"), params: [], children: [] }`
/// with `@type stdout` captured as a `params` entry since it has no body.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub arg: Option<String>,
    pub params: Vec<(String, String)>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_required(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    pub fn get_usize(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: format!("{raw:?} is not an integer"),
                }),
        }
    }

    /// Parses Fluentd-style byte sizes: a bare number of bytes, or a number
    /// followed by `k`/`m`/`g` (case-insensitive) for KiB/MiB/GiB.
    pub fn get_bytesize(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        parse_bytesize(raw)
            .map(Some)
            .map_err(|reason| ConfigError::InvalidValue {
                key: key.to_string(),
                reason,
            })
    }

    /// Parses Fluentd-style durations: a bare number of seconds, or a number
    /// followed by `s`/`m`/`h` (case-insensitive).
    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        parse_duration(raw)
            .map(Some)
            .map_err(|reason| ConfigError::InvalidValue {
                key: key.to_string(),
                reason,
            })
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn parse_bytesize(raw: &str) -> Result<usize, String> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&raw[..raw.len() - 1], 1024),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&raw[..raw.len() - 1], 1024 * 1024),
        Some(c) if c.eq_ignore_ascii_case(&'g') => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };
    digits
        .trim()
        .parse::<usize>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("{raw:?} is not a valid byte size"))
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'s') => (&raw[..raw.len() - 1], 1),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&raw[..raw.len() - 1], 60),
        Some(c) if c.eq_ignore_ascii_case(&'h') => (&raw[..raw.len() - 1], 3600),
        _ => (raw, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| Duration::from_secs(n * multiplier))
        .map_err(|_| format!("{raw:?} is not a valid duration"))
}

/// Parses a whole config source into a synthetic root `Element` whose
/// children are the top-level directives.
pub fn parse(source: &str) -> Result<Element, ConfigError> {
    let total_lines = source.lines().count();
    let mut lines = source.lines().enumerate().peekable();
    let mut root = Element {
        name: "ROOT".to_string(),
        arg: None,
        params: Vec::new(),
        children: Vec::new(),
    };
    parse_children(&mut lines, &mut root, None, total_lines)?;
    Ok(root)
}

type Lines<'a> = std::iter::Peekable<std::iter::Enumerate<std::str::Lines<'a>>>;

fn parse_children(
    lines: &mut Lines<'_>,
    parent: &mut Element,
    closing: Option<&str>,
    total_lines: usize,
) -> Result<(), ConfigError> {
    loop {
        let Some(&(lineno, raw)) = lines.peek() else {
            return match closing {
                None => Ok(()),
                Some(_) => Err(ConfigError::UnexpectedEof(total_lines)),
            };
        };
        let line = raw.trim();
        lines.next();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(close_name) = line.strip_prefix("</").and_then(|s| s.strip_suffix('>')) {
            match closing {
                Some(expected) if expected == close_name => return Ok(()),
                Some(expected) => {
                    return Err(ConfigError::MismatchedClose {
                        expected: expected.to_string(),
                        found: close_name.to_string(),
                        line: lineno + 1,
                    })
                }
                None => {
                    return Err(ConfigError::Malformed {
                        line: lineno + 1,
                        reason: format!("unexpected closing tag </{close_name}>"),
                    })
                }
            }
        }

        if let Some(open) = line.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
            let mut parts = open.splitn(2, char::is_whitespace);
            let name = parts
                .next()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| ConfigError::Malformed {
                    line: lineno + 1,
                    reason: "empty directive name".to_string(),
                })?
                .to_string();
            let arg = parts.next().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
            let mut child = Element {
                name: name.clone(),
                arg,
                params: Vec::new(),
                children: Vec::new(),
            };
            parse_children(lines, &mut child, Some(&name), total_lines)?;
            parent.children.push(child);
            continue;
        }

        // plain `key value` parameter line
        let mut parts = line.splitn(2, char::is_whitespace);
        let key = parts.next().unwrap_or_default().to_string();
        let value = parts.next().unwrap_or_default().trim().to_string();
        if key.is_empty() {
            return Err(ConfigError::Malformed {
                line: lineno + 1,
                reason: "expected a directive or key/value line".to_string(),
            });
        }
        parent.params.push((key, value));
    }
}
