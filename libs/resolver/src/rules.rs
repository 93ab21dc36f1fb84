//! Domain rules: which interface answers to a domain should be steered through.
//!
//! A rule maps a label-wise glob pattern to an egress interface. Patterns are
//! matched against the query name and the most specific matching rule wins.

use std::fmt;
use std::str::FromStr;

use dns_types::DomainName;
use serde::{Deserialize, Serialize};

/// A compiled steering rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub pattern: Pattern,
    /// The interface matching destinations should egress through.
    pub via: String,
    /// Floors the steering TTL at 300s irrespective of the DNS TTL.
    pub pin_ttl: bool,
}

/// All rules of one config snapshot, in config order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Returns the most specific rule matching `domain`.
    ///
    /// Specificity is decided by fewest wildcard labels first, longest
    /// literal prefix second and config order as the final tie-break.
    pub fn matching(&self, domain: &DomainName) -> Option<&Rule> {
        let candidate = Candidate::from_domain(domain);

        self.rules
            .iter()
            .filter(|rule| rule.pattern.matches(&candidate))
            .enumerate()
            .min_by_key(|(index, rule)| {
                (
                    rule.pattern.wildcard_labels(),
                    std::cmp::Reverse(rule.pattern.literal_prefix_len()),
                    *index,
                )
            })
            .map(|(_, rule)| rule)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// A domain name pattern, e.g. `*.vpn.test` or `**.corp.example`.
///
/// Each dot-separated label is either a literal, `*` (exactly one label) or
/// `**` (zero or more labels). Wildcards must occupy a whole label.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    labels: Vec<Label>,
    original: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Label {
    Literal(String),
    /// `*`
    One,
    /// `**`
    Many,
}

impl Pattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let normalized = pattern.trim().trim_end_matches('.').to_ascii_lowercase();

        if normalized.is_empty() {
            return Err(PatternError::Empty);
        }

        let labels = normalized
            .split('.')
            .map(|label| match label {
                "" => Err(PatternError::EmptyLabel(pattern.to_owned())),
                "*" => Ok(Label::One),
                "**" => Ok(Label::Many),
                literal if literal.contains('*') => {
                    Err(PatternError::PartialWildcard(pattern.to_owned()))
                }
                literal => {
                    let valid =
                        |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_');

                    if !literal.chars().all(valid) {
                        return Err(PatternError::InvalidLabel(pattern.to_owned()));
                    }

                    Ok(Label::Literal(literal.to_owned()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            labels,
            original: normalized,
        })
    }

    pub fn matches(&self, candidate: &Candidate) -> bool {
        let labels = candidate
            .labels
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>();

        matches_labels(&self.labels, &labels)
    }

    fn wildcard_labels(&self) -> usize {
        self.labels
            .iter()
            .filter(|l| matches!(l, Label::One | Label::Many))
            .count()
    }

    /// Character length of the leading run of literal labels.
    fn literal_prefix_len(&self) -> usize {
        self.labels
            .iter()
            .map_while(|l| match l {
                Label::Literal(lit) => Some(lit.len() + 1),
                Label::One | Label::Many => None,
            })
            .sum()
    }
}

fn matches_labels(pattern: &[Label], labels: &[&str]) -> bool {
    let Some((head, rest)) = pattern.split_first() else {
        return labels.is_empty();
    };

    match head {
        Label::Literal(lit) => labels
            .split_first()
            .is_some_and(|(label, remaining)| label == lit && matches_labels(rest, remaining)),
        Label::One => labels
            .split_first()
            .is_some_and(|(_, remaining)| matches_labels(rest, remaining)),
        Label::Many => {
            (0..=labels.len()).any(|skipped| matches_labels(rest, &labels[skipped..]))
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.original.fmt(f)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.original).finish()
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Pattern {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.original)
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        String::deserialize(deserializer)?
            .parse::<Self>()
            .map_err(D::Error::custom)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,
    #[error("pattern '{0}' contains an empty label")]
    EmptyLabel(String),
    #[error("pattern '{0}' mixes a wildcard into a label; wildcards must span a whole label")]
    PartialWildcard(String),
    #[error("pattern '{0}' contains characters that cannot appear in a domain label")]
    InvalidLabel(String),
}

/// A query name prepared for pattern matching: lowercased, split into labels,
/// trailing dot stripped.
pub struct Candidate {
    labels: Vec<String>,
}

impl Candidate {
    pub fn from_domain(domain: &DomainName) -> Self {
        Self::from_name(&domain.to_string())
    }

    fn from_name(name: &str) -> Self {
        let name = name.trim_end_matches('.').to_ascii_lowercase();

        Self {
            labels: match name.is_empty() {
                true => Vec::new(),
                false => name.split('.').map(str::to_owned).collect(),
            },
        }
    }
}

impl FromStr for Candidate {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("app.example.com", "app.example.com"; "matches literal domain")]
    #[test_case("APP.Example.COM", "app.example.com"; "matching ignores case")]
    #[test_case("*.example.com", "foo.example.com"; "single star matches one label")]
    #[test_case("foo.*.example.com", "foo.bar.example.com"; "single star matches mid-domain")]
    #[test_case("app.*.*.example.com", "app.foo.bar.example.com"; "single star can appear on multiple levels")]
    #[test_case("**.example.com", "example.com"; "double star matches root domain")]
    #[test_case("**.example.com", "foo.example.com"; "double star matches one level")]
    #[test_case("**.example.com", "foo.bar.example.com"; "double star matches two levels")]
    #[test_case("app.**.example.com", "app.bar.foo.example.com"; "double star matches multiple levels within domain")]
    #[test_case("app.**.web.**.example.com", "app.web.example.com"; "multiple double star within domain")]
    fn pattern_matches(pattern: &str, domain: &str) {
        let pattern = Pattern::parse(pattern).unwrap();
        let candidate = domain.parse::<Candidate>().unwrap();

        assert!(pattern.matches(&candidate));
    }

    #[test_case("*.example.com", "example.com"; "single star does not match root domain")]
    #[test_case("*.example.com", "foo.bar.example.com"; "single star does not match two levels")]
    #[test_case("app.example.com", "example.com"; "literal prefix must be present")]
    #[test_case("example.com", "example.org"; "different tld does not match")]
    fn pattern_does_not_match(pattern: &str, domain: &str) {
        let pattern = Pattern::parse(pattern).unwrap();
        let candidate = domain.parse::<Candidate>().unwrap();

        assert!(!pattern.matches(&candidate));
    }

    #[test_case("*ample.com"; "partial wildcard label")]
    #[test_case("app.*oo.test"; "wildcard mixed into label")]
    #[test_case(""; "empty pattern")]
    #[test_case("foo..bar"; "empty label")]
    #[test_case("foo bar.com"; "whitespace in label")]
    fn rejects_invalid_patterns(pattern: &str) {
        assert!(Pattern::parse(pattern).is_err());
    }

    #[test]
    fn most_specific_rule_wins() {
        let rules = RuleSet::new(vec![
            rule("**.example.com", "tun0"),
            rule("*.example.com", "tun1"),
            rule("api.example.com", "tun2"),
        ]);

        let matched = rules.matching(&name("api.example.com")).unwrap();

        assert_eq!(matched.via, "tun2");
    }

    #[test]
    fn longer_literal_prefix_beats_shorter() {
        let rules = RuleSet::new(vec![
            rule("api.*.example.com", "tun0"),
            rule("api.eu.*.com", "tun1"),
        ]);

        let matched = rules.matching(&name("api.eu.example.com")).unwrap();

        assert_eq!(matched.via, "tun1");
    }

    #[test]
    fn config_order_breaks_ties() {
        let rules = RuleSet::new(vec![
            rule("*.example.com", "first"),
            rule("*.example.com", "second"),
        ]);

        let matched = rules.matching(&name("foo.example.com")).unwrap();

        assert_eq!(matched.via, "first");
    }

    #[test]
    fn no_rule_matches_unrelated_domain() {
        let rules = RuleSet::new(vec![rule("*.vpn.test", "tun0")]);

        assert!(rules.matching(&name("example.com")).is_none());
    }

    #[test]
    fn trailing_dot_on_query_name_is_ignored() {
        let rules = RuleSet::new(vec![rule("api.vpn.test", "tun0")]);

        assert!(rules.matching(&name("api.vpn.test.")).is_some());
    }

    fn rule(pattern: &str, via: &str) -> Rule {
        Rule {
            pattern: Pattern::parse(pattern).unwrap(),
            via: via.to_owned(),
            pin_ttl: false,
        }
    }

    fn name(domain: &str) -> DomainName {
        DomainName::vec_from_str(domain).unwrap()
    }
}
