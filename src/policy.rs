//! Which CONNECT targets get decrypted and which are tunnelled untouched.

/// Hosts that are never intercepted, even if an intercept pattern matches them.
///
/// These are the browser's own sign-in and telemetry endpoints; breaking their
/// certificate pinning logs the automated session out.
pub const DEFAULT_PASSTHROUGH_DOMAINS: &[&str] = &[
  "feedback-pa.clients6.google.com",
  "play.google.com",
  "apis.google.com",
  "accounts.google.com",
];

/// Interception decision for a CONNECT target host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainPolicy {
  passthrough: Vec<String>,
  intercept: Vec<String>,
}

impl DomainPolicy {
  /// Build a policy from an exact-match passthrough list and intercept patterns.
  ///
  /// Intercept entries are either exact hostnames or `*.suffix` wildcards.
  pub fn new<P, I>(passthrough: P, intercept: I) -> Self
  where
    P: IntoIterator,
    P::Item: Into<String>,
    I: IntoIterator,
    I::Item: Into<String>,
  {
    Self {
      passthrough: passthrough.into_iter().map(Into::into).collect(),
      intercept: intercept.into_iter().map(Into::into).collect(),
    }
  }

  /// Policy with the built-in passthrough list.
  pub fn with_default_passthrough<I>(intercept: I) -> Self
  where
    I: IntoIterator,
    I::Item: Into<String>,
  {
    Self::new(DEFAULT_PASSTHROUGH_DOMAINS.iter().copied(), intercept)
  }

  /// Passthrough entries, in order.
  pub fn passthrough(&self) -> &[String] {
    &self.passthrough
  }

  /// Intercept patterns, in order.
  pub fn intercept(&self) -> &[String] {
    &self.intercept
  }

  /// Whether the tunnel to `host` should be decrypted.
  ///
  /// Passthrough is checked first and always wins. A `*.example.com` pattern
  /// matches any host ending in `.example.com`, but not `example.com` itself
  /// and not `notexample.com`.
  pub fn should_intercept(&self, host: &str) -> bool {
    if self.passthrough.iter().any(|d| d == host) {
      return false;
    }
    if self.intercept.iter().any(|d| d == host) {
      return true;
    }
    self.intercept.iter().any(|d| {
      d.strip_prefix('*')
        .filter(|suffix| suffix.starts_with('.'))
        .is_some_and(|suffix| host.ends_with(suffix))
    })
  }
}
