//! Name filters matched against parametrized component names.

use ob_types::{ConfigError, PluginKind};
use regex::{Regex, RegexBuilder};

/// One user pattern such as `gd`, `sgd*momentum` or `gd[step=0.1]`.
///
/// Matching is a case-insensitive substring search where `*` matches any
/// run of characters. Every other character is literal.
#[derive(Debug, Clone)]
pub struct NameFilter {
    pattern: String,
    regex: Regex,
    parameter_keys: Vec<String>,
}

impl NameFilter {
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        let regex = RegexBuilder::new(&body)
            .case_insensitive(true)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("invalid pattern `{pattern}`: {e}")))?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            parameter_keys: parameter_keys(pattern),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Parameter names spelled in the pattern's `[k=v,...]` block.
    pub fn parameter_keys(&self) -> &[String] {
        &self.parameter_keys
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

/// Keys of a trailing `[k1=v1,k2=v2]` block. Segments without `=` belong to
/// the previous value (list values contain commas).
fn parameter_keys(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('[') else {
        return Vec::new();
    };
    let inner = pattern[open + 1..].trim_end_matches(']');

    inner
        .split(',')
        .filter_map(|segment| segment.split_once('='))
        .map(|(key, _)| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .collect()
}

/// The filters given for one component kind.
#[derive(Debug, Clone)]
pub struct FilterSet {
    kind: PluginKind,
    filters: Vec<NameFilter>,
}

impl FilterSet {
    pub fn new(kind: PluginKind, patterns: &[String]) -> Result<Self, ConfigError> {
        let filters = patterns
            .iter()
            .map(|p| NameFilter::parse(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { kind, filters })
    }

    pub fn empty(kind: PluginKind) -> Self {
        Self {
            kind,
            filters: Vec::new(),
        }
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// True when any filter matches. An empty set matches everything.
    pub fn is_match(&self, name: &str) -> bool {
        self.filters.is_empty() || self.matches_any(name)
    }

    /// True when any filter matches. An empty set matches nothing.
    pub fn matches_any(&self, name: &str) -> bool {
        self.filters.iter().any(|f| f.is_match(name))
    }

    /// Check every pattern against the available names before anything runs.
    ///
    /// `parameter_names` lists every parameter declared by a component of
    /// this kind; keys in a pattern's `[...]` block must be among them.
    pub fn validate(
        &self,
        available: &[String],
        parameter_names: &[String],
    ) -> Result<(), ConfigError> {
        for filter in &self.filters {
            if let Some(unknown) = filter
                .parameter_keys()
                .iter()
                .find(|key| !parameter_names.contains(key))
            {
                return Err(ConfigError::UnknownParameter {
                    kind: self.kind,
                    pattern: filter.pattern().to_string(),
                    parameter: unknown.clone(),
                    suggestions: suggestions(unknown, parameter_names),
                });
            }
        }

        let unmatched: Vec<String> = self
            .filters
            .iter()
            .filter(|f| !available.iter().any(|name| f.is_match(name)))
            .map(|f| f.pattern().to_string())
            .collect();

        if unmatched.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::UnmatchedPattern {
                kind: self.kind,
                patterns: unmatched,
                available: available.to_vec(),
            })
        }
    }
}

/// Valid names closest to `unknown` first: those sharing its first letter,
/// then the rest.
fn suggestions(unknown: &str, valid: &[String]) -> Vec<String> {
    let first = unknown.chars().next().map(|c| c.to_ascii_lowercase());
    let mut ranked: Vec<&String> = valid.iter().collect();
    ranked.sort_by_key(|name| {
        let shares_first = name.chars().next().map(|c| c.to_ascii_lowercase()) == first;
        (!shares_first, name.as_str())
    });
    ranked.into_iter().cloned().collect()
}
