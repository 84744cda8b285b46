//! Typed route classification and rate policies, resolved once at startup.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use crate::store::MAX_WINDOW;

/// Sensitive-operation classes, each with its own rate policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Register,
    Login,
    VerifyToken,
    ResendVerification,
    PasswordReset,
    Api,
}

impl RouteClass {
    pub const ALL: [Self; 6] = [
        Self::Register,
        Self::Login,
        Self::VerifyToken,
        Self::ResendVerification,
        Self::PasswordReset,
        Self::Api,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Login => "login",
            Self::VerifyToken => "verify-token",
            Self::ResendVerification => "resend-verification",
            Self::PasswordReset => "password-reset",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyParseError {
    #[error("unknown route class: {0}")]
    UnknownClass(String),
    #[error("expected <class>=<max>/<window-seconds>, got: {0}")]
    Malformed(String),
    #[error("max requests and window must be greater than zero: {0}")]
    Zero(String),
    #[error("window exceeds the {max} second maximum: {value}")]
    WindowTooLong { value: String, max: u64 },
}

impl FromStr for RouteClass {
    type Err = PolicyParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == value.trim())
            .ok_or_else(|| PolicyParseError::UnknownClass(value.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatePolicy {
    pub window: Duration,
    pub max_requests: u32,
    pub message: String,
}

impl RatePolicy {
    #[must_use]
    pub fn new(max_requests: u32, window: Duration, message: impl Into<String>) -> Self {
        Self {
            window,
            max_requests,
            message: message.into(),
        }
    }
}

const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);

/// Route class to policy mapping. Every class always has a policy.
#[derive(Clone, Debug)]
pub struct PolicyTable {
    policies: HashMap<RouteClass, RatePolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let policies = HashMap::from([
            (
                RouteClass::Register,
                RatePolicy::new(
                    5,
                    FIFTEEN_MINUTES,
                    "Too many registration attempts. Please try again later.",
                ),
            ),
            (
                RouteClass::Login,
                RatePolicy::new(
                    10,
                    FIFTEEN_MINUTES,
                    "Too many login attempts. Please try again later.",
                ),
            ),
            (
                RouteClass::VerifyToken,
                RatePolicy::new(
                    10,
                    FIFTEEN_MINUTES,
                    "Too many verification attempts. Please try again later.",
                ),
            ),
            (
                RouteClass::ResendVerification,
                RatePolicy::new(
                    3,
                    FIFTEEN_MINUTES,
                    "Too many verification emails requested. Please try again later.",
                ),
            ),
            (
                RouteClass::PasswordReset,
                RatePolicy::new(
                    3,
                    FIFTEEN_MINUTES,
                    "Too many password reset requests. Please try again later.",
                ),
            ),
            (
                RouteClass::Api,
                RatePolicy::new(
                    60,
                    Duration::from_secs(60),
                    "Too many requests. Please slow down.",
                ),
            ),
        ]);
        Self { policies }
    }
}

impl PolicyTable {
    /// Policy for a class; falls back to the generic API policy.
    #[must_use]
    pub fn get(&self, class: RouteClass) -> &RatePolicy {
        match self.policies.get(&class) {
            Some(policy) => policy,
            None => &self.policies[&RouteClass::Api],
        }
    }

    #[must_use]
    pub fn with_policy(mut self, class: RouteClass, policy: RatePolicy) -> Self {
        self.policies.insert(class, policy);
        self
    }

    /// Apply an override of the form `login=10/900` (max / window seconds),
    /// keeping the class's message.
    ///
    /// # Errors
    /// Returns `PolicyParseError` for unknown classes, malformed values or a
    /// window longer than `MAX_WINDOW`.
    pub fn with_override(self, value: &str) -> Result<Self, PolicyParseError> {
        let (class, limits) = value
            .split_once('=')
            .ok_or_else(|| PolicyParseError::Malformed(value.to_string()))?;
        let class: RouteClass = class.parse()?;
        let (max, window) = limits
            .split_once('/')
            .ok_or_else(|| PolicyParseError::Malformed(value.to_string()))?;
        let max: u32 = max
            .trim()
            .parse()
            .map_err(|_| PolicyParseError::Malformed(value.to_string()))?;
        let window: u64 = window
            .trim()
            .parse()
            .map_err(|_| PolicyParseError::Malformed(value.to_string()))?;
        if max == 0 || window == 0 {
            return Err(PolicyParseError::Zero(value.to_string()));
        }
        if window > MAX_WINDOW.as_secs() {
            return Err(PolicyParseError::WindowTooLong {
                value: value.to_string(),
                max: MAX_WINDOW.as_secs(),
            });
        }
        let message = self.get(class).message.clone();
        Ok(self.with_policy(
            class,
            RatePolicy::new(max, Duration::from_secs(window), message),
        ))
    }
}

/// Authentication level a route requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Public,
    Authenticated,
    Verified,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteRule {
    pub prefix: String,
    pub class: RouteClass,
    pub access: Access,
}

impl RouteRule {
    #[must_use]
    pub fn new(prefix: impl Into<String>, class: RouteClass, access: Access) -> Self {
        Self {
            prefix: prefix.into(),
            class,
            access,
        }
    }
}

/// Longest-prefix route rules. Unmatched paths are public `api` routes.
#[derive(Clone, Debug)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
    fallback: RouteRule,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::empty()
            .with_rule(RouteRule::new("/v1/", RouteClass::Api, Access::Verified))
            .with_rule(RouteRule::new(
                "/v1/auth/register",
                RouteClass::Register,
                Access::Public,
            ))
            .with_rule(RouteRule::new(
                "/v1/auth/login",
                RouteClass::Login,
                Access::Public,
            ))
            .with_rule(RouteRule::new(
                "/v1/auth/verify-email",
                RouteClass::VerifyToken,
                Access::Public,
            ))
            .with_rule(RouteRule::new(
                "/v1/auth/resend-verification",
                RouteClass::ResendVerification,
                Access::Public,
            ))
            .with_rule(RouteRule::new(
                "/v1/auth/password-reset",
                RouteClass::PasswordReset,
                Access::Public,
            ))
            .with_rule(RouteRule::new(
                "/v1/auth/session",
                RouteClass::Api,
                Access::Public,
            ))
            .with_rule(RouteRule::new(
                "/v1/auth/session/refresh",
                RouteClass::Api,
                Access::Authenticated,
            ))
            .with_rule(RouteRule::new(
                "/v1/auth/logout",
                RouteClass::Api,
                Access::Public,
            ))
            .with_rule(RouteRule::new("/v1/csrf", RouteClass::Api, Access::Public))
            .with_rule(RouteRule::new("/v1/auth/csrf", RouteClass::Api, Access::Public))
    }
}

impl RouteTable {
    /// A table with no rules; every path resolves to the public fallback.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            fallback: RouteRule::new("/", RouteClass::Api, Access::Public),
        }
    }

    #[must_use]
    pub fn with_rule(mut self, rule: RouteRule) -> Self {
        self.rules.retain(|existing| existing.prefix != rule.prefix);
        self.rules.push(rule);
        // Longest prefix first so `find` returns the most specific rule.
        self.rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        self
    }

    #[must_use]
    pub fn classify(&self, path: &str) -> &RouteRule {
        self.rules
            .iter()
            .find(|rule| path.starts_with(rule.prefix.as_str()))
            .unwrap_or(&self.fallback)
    }
}
