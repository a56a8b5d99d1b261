//! Safety rails gating autonomous research.
//!
//! A gap may leave the queue only when every rail passes: recursion depth,
//! domain allowlist, operator approval and the shared token bucket. The
//! concurrency limit is enforced by the research runtime.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use regex::Regex;

use crate::config::{RailConfig, RateLimitConfig};
use crate::error::{RailViolation, ValidationError};
use crate::gap::Gap;

/// Shared research-call budget.
///
/// One atomic counter of available tokens plus the index of the last
/// refill period applied. Each elapsed period adds one token, up to
/// `capacity`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    tokens: AtomicU32,
    period: Duration,
    origin: Instant,
    refilled_through: AtomicU64,
}

impl TokenBucket {
    /// A full bucket. A zero `period` refills instantly.
    #[must_use]
    pub fn new(capacity: u32, period: Duration) -> Self {
        Self::starting_at(capacity, period, Instant::now())
    }

    /// A full bucket whose refill clock starts at `origin`.
    #[must_use]
    pub fn starting_at(capacity: u32, period: Duration, origin: Instant) -> Self {
        Self {
            capacity,
            tokens: AtomicU32::new(capacity),
            period,
            origin,
            refilled_through: AtomicU64::new(0),
        }
    }

    /// A full bucket sized by `config`.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, Duration::from_secs(config.refill_every_secs))
    }

    /// Maximum tokens held.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens currently available, without refilling.
    #[must_use]
    pub fn available(&self) -> u32 {
        self.tokens.load(Ordering::Acquire)
    }

    fn periods_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        let period = self.period.as_nanos().max(1);
        u64::try_from(elapsed.as_nanos() / period).unwrap_or(u64::MAX)
    }

    fn refill(&self, now: Instant) {
        if self.period.is_zero() {
            self.tokens.store(self.capacity, Ordering::Release);
            return;
        }
        let periods = self.periods_at(now);
        let seen = self.refilled_through.load(Ordering::Acquire);
        if periods <= seen {
            return;
        }
        // Only the thread that advances the epoch adds the tokens.
        if self
            .refilled_through
            .compare_exchange(seen, periods, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let add = u32::try_from(periods - seen).unwrap_or(u32::MAX);
        let capacity = self.capacity;
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(t.saturating_add(add).min(capacity))
            });
    }

    /// Takes one token.
    ///
    /// # Errors
    ///
    /// `RateLimitExceeded` with the time until the next refill.
    pub fn try_acquire(&self) -> Result<(), RailViolation> {
        self.try_acquire_at(Instant::now())
    }

    /// Takes one token as of `now`.
    ///
    /// # Errors
    ///
    /// `RateLimitExceeded` with the time until the next refill.
    pub fn try_acquire_at(&self, now: Instant) -> Result<(), RailViolation> {
        self.refill(now);
        match self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_sub(1))
        {
            Ok(_) => Ok(()),
            Err(_) => {
                let next = self.periods_at(now).saturating_add(1);
                let due = self.period.saturating_mul(u32::try_from(next).unwrap_or(u32::MAX));
                let wait = due.saturating_sub(now.saturating_duration_since(self.origin));
                Err(RailViolation::RateLimitExceeded {
                    retry_after_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

fn normalize_domain(domain: &str) -> String {
    let trimmed = domain.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map_or(trimmed, |(_, rest)| rest);
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host = host.rsplit_once('@').map_or(host, |(_, h)| h);
    let host = host.split(':').next().unwrap_or_default();
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn pattern_regex(pattern: &str) -> Result<String, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidDomainPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };
    let p = pattern.trim().to_ascii_lowercase();
    let (wildcard, rest) = match p.strip_prefix("*.") {
        Some(rest) => (true, rest),
        None => (false, p.as_str()),
    };
    if rest.is_empty() {
        return Err(invalid("empty domain"));
    }
    if rest.contains('*') {
        return Err(invalid("wildcard only allowed as a leading '*.'"));
    }
    if !rest
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(invalid("expected a bare host name"));
    }
    let literal = regex::escape(rest);
    Ok(if wildcard {
        format!(r"(?:[a-z0-9-]+\.)+{literal}")
    } else {
        literal
    })
}

/// Domains research may consult.
///
/// Entries are exact host names or `*.suffix` wildcards matching any
/// subdomain. All entries compile into one anchored regex. An empty list
/// permits nothing.
#[derive(Debug, Clone)]
pub struct DomainAllowlist {
    patterns: Vec<String>,
    matcher: Option<Regex>,
}

impl DomainAllowlist {
    /// # Errors
    ///
    /// `InvalidDomainPattern` for a malformed entry.
    pub fn new<I, S>(patterns: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_string())
            .collect();
        if patterns.is_empty() {
            return Ok(Self {
                patterns,
                matcher: None,
            });
        }
        let alternatives = patterns
            .iter()
            .map(|p| pattern_regex(p))
            .collect::<Result<Vec<_>, _>>()?;
        let joined = format!("^(?:{})$", alternatives.join("|"));
        let matcher = Regex::new(&joined).map_err(|e| ValidationError::InvalidDomainPattern {
            pattern: patterns.join(","),
            reason: e.to_string(),
        })?;
        Ok(Self {
            patterns,
            matcher: Some(matcher),
        })
    }

    /// Patterns as configured.
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Accepts bare hosts or URLs.
    #[must_use]
    pub fn permits(&self, domain: &str) -> bool {
        let host = normalize_domain(domain);
        !host.is_empty() && self.matcher.as_ref().is_some_and(|m| m.is_match(&host))
    }

    /// The first of `domains` the allowlist refuses.
    #[must_use]
    pub fn first_denied<'a>(&self, domains: &'a [String]) -> Option<&'a str> {
        domains
            .iter()
            .map(String::as_str)
            .find(|d| !self.permits(d))
    }
}

/// The full rail set for one manager instance.
#[derive(Debug)]
pub struct SafetyRails {
    bucket: TokenBucket,
    allowlist: DomainAllowlist,
    max_depth: u32,
    human_in_the_loop: bool,
}

impl SafetyRails {
    /// Rails with the given limits.
    #[must_use]
    pub const fn new(
        bucket: TokenBucket,
        allowlist: DomainAllowlist,
        max_depth: u32,
        human_in_the_loop: bool,
    ) -> Self {
        Self {
            bucket,
            allowlist,
            max_depth,
            human_in_the_loop,
        }
    }

    /// # Errors
    ///
    /// `InvalidDomainPattern` for a malformed allowlist entry.
    pub fn from_config(config: &RailConfig) -> Result<Self, ValidationError> {
        Ok(Self::new(
            TokenBucket::from_config(&config.rate_limit),
            DomainAllowlist::new(&config.allowlist)?,
            config.max_depth,
            config.human_in_the_loop,
        ))
    }

    /// Deepest gap research may start on.
    #[must_use]
    pub const fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// The research rate limiter.
    #[must_use]
    pub const fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// The research domain allowlist.
    #[must_use]
    pub const fn allowlist(&self) -> &DomainAllowlist {
        &self.allowlist
    }

    /// Checks the rails that do not consume anything: depth, domains,
    /// approval. `domains` are the ones research would consult.
    ///
    /// # Errors
    ///
    /// The first failing rail.
    pub fn check(&self, gap: &Gap, domains: &[String]) -> Result<(), RailViolation> {
        if gap.depth > self.max_depth {
            return Err(RailViolation::DepthExceeded {
                depth: gap.depth,
                ceiling: self.max_depth,
            });
        }
        if let Some(domain) = self.allowlist.first_denied(domains) {
            return Err(RailViolation::DomainNotAllowed {
                domain: domain.to_string(),
            });
        }
        if self.human_in_the_loop && !gap.is_approved() {
            return Err(RailViolation::AwaitingApproval);
        }
        Ok(())
    }

    /// Takes one research-call token.
    ///
    /// # Errors
    ///
    /// `RateLimitExceeded` when the bucket is empty.
    pub fn acquire_token(&self) -> Result<(), RailViolation> {
        self.bucket.try_acquire()
    }
}
