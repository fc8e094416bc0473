//! Stub rule table.

use rand::seq::SliceRandom;
use rand::Rng;

/// Reply sent when no rule matches.
pub const DEFAULT_RESPONSE: &[u8] = b"default response";

const YES_OR_NO: &[&[u8]] = &[b"yes", b"no"];

/// What a matching rule answers with.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Always the same bytes.
    Fixed(&'static [u8]),
    /// One of the choices, picked uniformly per request.
    OneOf(&'static [&'static [u8]]),
}

impl Reply {
    fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> &'static [u8] {
        match self {
            Reply::Fixed(bytes) => *bytes,
            Reply::OneOf(choices) => choices.choose(rng).copied().unwrap_or(DEFAULT_RESPONSE),
        }
    }
}

/// A request that triggers a canned reply.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Lowercase request bytes to match.
    pub request: &'static [u8],
    pub reply: Reply,
}

/// Ordered rule table. The first matching rule wins.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new(vec![
            Rule {
                request: b"hello",
                reply: Reply::Fixed(b"world"),
            },
            Rule {
                request: b"get yes",
                reply: Reply::OneOf(YES_OR_NO),
            },
        ])
    }
}

impl RuleTable {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Pick the reply for a request, comparing ASCII case-insensitively.
    pub fn classify<R: Rng + ?Sized>(&self, request: &[u8], rng: &mut R) -> &'static [u8] {
        self.rules
            .iter()
            .find(|rule| request.eq_ignore_ascii_case(rule.request))
            .map(|rule| rule.reply.pick(rng))
            .unwrap_or(DEFAULT_RESPONSE)
    }
}
