//! npm-style version ranges on top of `semver::VersionReq`.
//!
//! The `semver` crate speaks Cargo's dialect: a bare `1.2.3` is a caret
//! requirement and comparators are comma-separated. npm treats a bare
//! version as exact, separates comparators with spaces, allows `||`
//! alternatives and hyphen ranges, and resolves dist-tags like `latest`.

use std::collections::BTreeMap;

use semver::{Version, VersionReq};

/// A parsed npm range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NpmRange {
    /// A dist-tag such as `latest` or `next`.
    Tag(String),
    /// Any of the alternatives may match.
    Any(Vec<VersionReq>),
}

impl NpmRange {
    pub fn parse(range: &str) -> Result<Self, String> {
        let range = range.trim();
        if range.is_empty() || range == "*" || range == "latest" {
            return Ok(NpmRange::Tag("latest".to_string()));
        }
        if is_tag(range) {
            return Ok(NpmRange::Tag(range.to_string()));
        }
        let mut alternatives = Vec::new();
        for alt in range.split("||") {
            let translated = translate_set(alt.trim())?;
            let req = VersionReq::parse(&translated)
                .map_err(|e| format!("{alt:?} is not a valid range: {e}"))?;
            alternatives.push(req);
        }
        Ok(NpmRange::Any(alternatives))
    }

    pub fn matches(&self, version: &Version) -> bool {
        match self {
            NpmRange::Tag(_) => false,
            NpmRange::Any(reqs) => reqs.iter().any(|req| req.matches(version)),
        }
    }

    /// Highest version satisfying the range, or the version a tag points at.
    pub fn max_satisfying<'a>(
        &self,
        versions: impl IntoIterator<Item = &'a str>,
        dist_tags: &BTreeMap<String, String>,
    ) -> Option<String> {
        match self {
            NpmRange::Tag(tag) => {
                let tagged = dist_tags.get(tag)?;
                Version::parse(tagged).ok().map(|v| v.to_string())
            }
            NpmRange::Any(_) => versions
                .into_iter()
                .filter_map(|v| Version::parse(v).ok())
                .filter(|v| self.matches(v))
                .max()
                .map(|v| v.to_string()),
        }
    }
}

fn is_tag(range: &str) -> bool {
    range
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() && c != 'x' && c != 'X' && c != 'v')
        && range
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Translate one space-separated comparator set into Cargo syntax.
fn translate_set(set: &str) -> Result<String, String> {
    if set.is_empty() {
        return Ok("*".to_string());
    }
    if let Some((low, high)) = set.split_once(" - ") {
        return Ok(format!(
            ">={}, <={}",
            normalize_version(low.trim()),
            normalize_version(high.trim())
        ));
    }

    let mut comparators = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in set.split_whitespace() {
        if token.chars().all(|c| "<>=~^".contains(c)) {
            pending_op = Some(token);
            continue;
        }
        let token = match pending_op.take() {
            Some(op) => format!("{op}{token}"),
            None => token.to_string(),
        };
        comparators.push(translate_comparator(&token)?);
    }
    if let Some(op) = pending_op {
        return Err(format!("dangling operator {op:?}"));
    }
    Ok(comparators.join(", "))
}

fn translate_comparator(token: &str) -> Result<String, String> {
    let split = token
        .find(|c: char| !"<>=~^".contains(c))
        .ok_or_else(|| format!("{token:?} has no version"))?;
    let (op, version) = token.split_at(split);
    let version = normalize_version(version);
    if version.ends_with('*') {
        if op.is_empty() || op == "=" || version == "*" {
            return Ok(version);
        }
        // `>=1.*` means `>=1`.
        return Ok(format!("{op}{}", version.trim_end_matches(".*")));
    }
    let op = match op {
        // A bare npm version is exact.
        "" => "=",
        "~>" => "~",
        other => other,
    };
    Ok(format!("{op}{version}"))
}

/// Strip a `v` prefix and spell wildcards the way `semver` expects.
fn normalize_version(version: &str) -> String {
    let version = version.strip_prefix('v').unwrap_or(version);
    let parts: Vec<&str> = version
        .split('.')
        .map(|p| if p == "x" || p == "X" { "*" } else { p })
        .collect();
    // `1.*.*` is not accepted; truncate after the first wildcard.
    match parts.iter().position(|p| *p == "*") {
        Some(0) => "*".to_string(),
        Some(i) => parts[..=i].join("."),
        None => parts.join("."),
    }
}
