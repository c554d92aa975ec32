//! Glob-based source host whitelist.

use regex::{Regex, RegexBuilder};
use url::Url;

/// A single compiled glob, matched against a url's host
#[derive(Debug, Clone)]
pub struct WhitelistRule {
    glob: String,
    pattern: Regex,
}

impl WhitelistRule {
    /// Compile a glob (`*` any run, `?` one character, everything else literal)
    pub fn compile(glob: &str) -> Result<Self, regex::Error> {
        let mut expr = String::with_capacity(glob.len() + 8);
        expr.push('^');
        for ch in glob.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
        }
        expr.push('$');

        let pattern = RegexBuilder::new(&expr).case_insensitive(true).build()?;
        Ok(Self {
            glob: glob.to_string(),
            pattern,
        })
    }

    /// Original glob text
    pub fn glob(&self) -> &str {
        &self.glob
    }

    pub fn matches(&self, host: &str) -> bool {
        self.pattern.is_match(host)
    }
}

/// Set of whitelist rules built from a comma-separated glob list
#[derive(Debug, Clone, Default)]
pub struct DomainWhitelist {
    rules: Vec<WhitelistRule>,
}

impl DomainWhitelist {
    /// Build from configuration, e.g. `"*.example.com, cdn.?.net"`.
    ///
    /// Empty entries are dropped. Globs escape every non-wildcard character,
    /// so compilation only fails on pathological input, which is skipped.
    pub fn new(patterns: &str) -> Self {
        let rules = patterns
            .split(',')
            .map(str::trim)
            .filter(|glob| !glob.is_empty())
            .filter_map(|glob| match WhitelistRule::compile(glob) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    tracing::warn!(glob = %glob, error = %e, "Ignoring whitelist entry");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    pub fn rules(&self) -> &[WhitelistRule] {
        &self.rules
    }

    /// Check whether the host of `url` may be fetched.
    ///
    /// An empty rule set or a blank url is always allowed. A url without a
    /// parseable host is refused once rules exist.
    pub fn is_allowed(&self, url: &str) -> bool {
        if self.rules.is_empty() || url.trim().is_empty() {
            return true;
        }
        let host = match Url::parse(url.trim()) {
            Ok(parsed) => match parsed.host_str() {
                Some(host) => host.to_string(),
                None => return false,
            },
            Err(_) => return false,
        };
        self.rules.iter().any(|rule| rule.matches(&host))
    }
}
