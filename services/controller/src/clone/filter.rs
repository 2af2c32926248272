//! Label and annotation filters.
//!
//! A filter list holds glob patterns; entries prefixed with `!` exclude.
//! A key is kept when it matches at least one positive pattern and no
//! negative one. An empty list keeps everything.

use std::collections::BTreeMap;

use glob::Pattern;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid filter {filter:?}: {reason}")]
pub struct FilterError {
    pub filter: String,
    pub reason: String,
}

/// Compiled filter list.
#[derive(Debug, Clone)]
pub struct KeyFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl KeyFilter {
    pub fn parse(filters: &[String]) -> Result<Self, FilterError> {
        if filters.is_empty() {
            return Self::parse(&["*".to_string()]);
        }

        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for filter in filters {
            let (negated, raw) = match filter.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, filter.as_str()),
            };
            if raw.is_empty() {
                return Err(FilterError {
                    filter: filter.clone(),
                    reason: "empty pattern".to_string(),
                });
            }
            let pattern = Pattern::new(raw).map_err(|e| FilterError {
                filter: filter.clone(),
                reason: e.msg.to_string(),
            })?;
            if negated {
                exclude.push(pattern);
            } else {
                include.push(pattern);
            }
        }

        Ok(Self { include, exclude })
    }

    pub fn includes(&self, key: &str) -> bool {
        self.include.iter().any(|p| p.matches(key)) && !self.exclude.iter().any(|p| p.matches(key))
    }

    /// Keys of `map` this filter drops, in key order.
    pub fn excluded_keys<'a>(&self, map: &'a BTreeMap<String, String>) -> Vec<&'a str> {
        map.keys()
            .map(String::as_str)
            .filter(|k| !self.includes(k))
            .collect()
    }

    /// The subset of `map` this filter keeps.
    pub fn apply(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .filter(|(k, _)| self.includes(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
