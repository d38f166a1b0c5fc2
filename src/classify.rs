//! Failure classification.
//!
//! Completion handling branches on why a run failed: throttling backs off
//! exponentially, transient faults retry immediately, anything else waits
//! out the error interval. Classification is an ordered matcher chain over
//! the error; the first matcher that recognizes it wins.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Provider pushed back on request volume.
    Throttled,
    /// Infrastructure hiccup likely to clear on its own.
    Transient,
    /// Unclassified failure.
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Throttled => "throttled",
            FailureKind::Transient => "transient",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors originating from an upstream provider can expose a machine
/// readable code that the classifier matches on exactly.
pub trait ProviderError: std::error::Error + Send + Sync + 'static {
    fn error_code(&self) -> &str;
}

type Matcher = Box<dyn Fn(&anyhow::Error) -> Option<FailureKind> + Send + Sync>;

/// Ordered matcher chain mapping errors to a [`FailureKind`].
pub struct FailureClassifier {
    matchers: Vec<Matcher>,
}

impl FailureClassifier {
    /// Classifier with no matchers; everything comes back `Unknown`.
    pub fn empty() -> Self {
        Self { matchers: Vec::new() }
    }

    /// Prepend a matcher. Matchers added later take precedence, so callers
    /// can override the defaults for specific error shapes.
    pub fn with_matcher(
        mut self,
        matcher: impl Fn(&anyhow::Error) -> Option<FailureKind> + Send + Sync + 'static,
    ) -> Self {
        self.matchers.insert(0, Box::new(matcher));
        self
    }

    /// Match a concrete error type in the chain.
    pub fn with_type_matcher<E>(self, kind: FailureKind) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.with_matcher(move |err| err.downcast_ref::<E>().map(|_| kind))
    }

    /// Match a provider error code exactly.
    pub fn with_code_matcher<E>(self, code: &str, kind: FailureKind) -> Self
    where
        E: ProviderError,
    {
        let code = code.to_string();
        self.with_matcher(move |err| {
            err.downcast_ref::<E>()
                .filter(|e| e.error_code() == code)
                .map(|_| kind)
        })
    }

    /// Match a case-insensitive substring of the rendered error chain.
    pub fn with_substring_matcher(self, needle: &str, kind: FailureKind) -> Self {
        let needle = needle.to_lowercase();
        self.with_matcher(move |err| {
            let text = format!("{err:#}").to_lowercase();
            text.contains(&needle).then_some(kind)
        })
    }

    pub fn classify(&self, err: &anyhow::Error) -> FailureKind {
        for matcher in &self.matchers {
            if let Some(kind) = matcher(err) {
                return kind;
            }
        }
        FailureKind::Unknown
    }
}

impl Default for FailureClassifier {
    /// Matchers for the failure shapes seen across providers: rate-limit
    /// wording and resource exhaustion classify as throttling, socket-level
    /// faults and connectivity wording as transient.
    fn default() -> Self {
        Self::empty()
            .with_matcher(|err| {
                err.downcast_ref::<std::io::Error>().map(|_| FailureKind::Transient)
            })
            .with_substring_matcher("connection refused", FailureKind::Transient)
            .with_substring_matcher("connection reset", FailureKind::Transient)
            .with_substring_matcher("broken pipe", FailureKind::Transient)
            .with_substring_matcher("timed out", FailureKind::Transient)
            .with_substring_matcher("temporarily unavailable", FailureKind::Transient)
            .with_substring_matcher("throttl", FailureKind::Throttled)
            .with_substring_matcher("too many requests", FailureKind::Throttled)
            .with_substring_matcher("request limit", FailureKind::Throttled)
            .with_substring_matcher("rate limit", FailureKind::Throttled)
            .with_substring_matcher("slow down", FailureKind::Throttled)
            .with_substring_matcher("resource exhaust", FailureKind::Throttled)
            .with_substring_matcher("quota exceeded", FailureKind::Throttled)
    }
}
