//! Management object names and name patterns
//!
//! A facility is registered under a name of the form
//! `domain:key=value[,key=value...]`. The same syntax with wildcards is used
//! as a query pattern:
//! - `*` and `?` in the domain and in property values
//! - a trailing `*` entry (`domain:type=Threading,*`) allows extra properties

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FacilityName {
    domain: String,
    properties: BTreeMap<String, String>,
    property_wildcard: bool,
}

impl FacilityName {
    /// Parse a name or pattern
    pub fn parse(text: &str) -> Result<Self> {
        let (domain, rest) = text
            .split_once(':')
            .ok_or_else(|| Error::malformed(text, "missing ':' between domain and properties"))?;

        if domain.is_empty() {
            return Err(Error::malformed(text, "empty domain"));
        }
        if domain.contains([',', '=', '\n']) {
            return Err(Error::malformed(text, "invalid character in domain"));
        }

        let mut properties = BTreeMap::new();
        let mut property_wildcard = false;

        if !rest.is_empty() {
            for entry in rest.split(',') {
                if entry == "*" {
                    if property_wildcard {
                        return Err(Error::malformed(text, "repeated property wildcard"));
                    }
                    property_wildcard = true;
                    continue;
                }

                let (key, value) = entry.split_once('=').ok_or_else(|| {
                    Error::malformed(text, format!("property `{}` has no value", entry))
                })?;

                if key.is_empty() {
                    return Err(Error::malformed(text, "empty property key"));
                }
                if key.contains(['*', '?']) {
                    return Err(Error::malformed(
                        text,
                        format!("wildcard in property key `{}`", key),
                    ));
                }
                if key.contains([':', '\n']) {
                    return Err(Error::malformed(
                        text,
                        format!("invalid character in property key `{}`", key),
                    ));
                }
                if value.is_empty() {
                    return Err(Error::malformed(
                        text,
                        format!("empty value for property `{}`", key),
                    ));
                }
                if value.contains([':', '=', '\n']) {
                    return Err(Error::malformed(
                        text,
                        format!("invalid character in value of property `{}`", key),
                    ));
                }
                if properties.insert(key.to_string(), value.to_string()).is_some() {
                    return Err(Error::malformed(
                        text,
                        format!("duplicate property key `{}`", key),
                    ));
                }
            }
        }

        if properties.is_empty() && !property_wildcard {
            return Err(Error::malformed(text, "no key properties"));
        }

        Ok(Self {
            domain: domain.to_string(),
            properties,
            property_wildcard,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Does this name contain any wildcard
    pub fn is_pattern(&self) -> bool {
        self.property_wildcard
            || has_wildcard(&self.domain)
            || self.properties.values().any(|v| has_wildcard(v))
    }

    /// Match a concrete name against this pattern
    pub fn matches(&self, candidate: &FacilityName) -> bool {
        if !glob_match(&self.domain, &candidate.domain) {
            return false;
        }

        for (key, pattern) in &self.properties {
            match candidate.properties.get(key) {
                Some(value) if glob_match(pattern, value) => {}
                _ => return false,
            }
        }

        self.property_wildcard || candidate.properties.len() == self.properties.len()
    }

    /// Canonical text form: properties ordered by key
    pub fn canonical(&self) -> String {
        let mut out = String::with_capacity(self.domain.len() + 16);
        out.push_str(&self.domain);
        out.push(':');
        let mut first = true;
        for (key, value) in &self.properties {
            if !first {
                out.push(',');
            }
            first = false;
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        if self.property_wildcard {
            if !first {
                out.push(',');
            }
            out.push('*');
        }
        out
    }
}

impl fmt::Display for FacilityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl FromStr for FacilityName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?'])
}

/// Wildcard match: `*` any run of characters, `?` exactly one
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_text = 0;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_text = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            star_text += 1;
            t = star_text;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// Extra filter applied on top of a name pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryFilter {
    HasKey(String),
    KeyEquals(String, String),
    Not(Box<QueryFilter>),
    All(Vec<QueryFilter>),
}

impl QueryFilter {
    pub fn key_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        QueryFilter::KeyEquals(key.into(), value.into())
    }

    pub fn has_key(key: impl Into<String>) -> Self {
        QueryFilter::HasKey(key.into())
    }

    pub fn negate(self) -> Self {
        QueryFilter::Not(Box::new(self))
    }

    pub fn accepts(&self, name: &FacilityName) -> bool {
        match self {
            QueryFilter::HasKey(key) => name.property(key).is_some(),
            QueryFilter::KeyEquals(key, value) => name.property(key) == Some(value.as_str()),
            QueryFilter::Not(inner) => !inner.accepts(name),
            QueryFilter::All(filters) => filters.iter().all(|f| f.accepts(name)),
        }
    }
}

/// Apply pattern and optional filter to one registered name
pub fn selects(pattern: &FacilityName, filter: Option<&QueryFilter>, name: &FacilityName) -> bool {
    pattern.matches(name) && filter.map_or(true, |f| f.accepts(name))
}
