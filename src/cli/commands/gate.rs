use clap::{Arg, ArgAction, ArgMatches, Command};
use std::time::Duration;

use super::bounded;
use crate::store::MAX_WINDOW;

pub const ARG_RATE_LIMIT: &str = "rate-limit";
pub const ARG_CSRF_TTL_SECONDS: &str = "csrf-ttl-seconds";
pub const ARG_CSRF_EXCLUDE: &str = "csrf-exclude";
pub const ARG_INSECURE_COOKIES: &str = "insecure-cookies";
pub const ARG_TRUST_PROXY: &str = "trust-proxy";
pub const ARG_STORE_TIMEOUT_MS: &str = "store-timeout-ms";
pub const ARG_SWEEP_INTERVAL_SECONDS: &str = "sweep-interval-seconds";

#[derive(Debug, Clone)]
pub struct Options {
    /// Raw `<class>=<max>/<window-seconds>` overrides, applied in order.
    pub rate_limits: Vec<String>,
    pub csrf_ttl: Duration,
    /// `None` keeps the built-in exclusion list.
    pub csrf_exclude: Option<Vec<String>>,
    pub insecure_cookies: bool,
    pub trust_proxy: bool,
    pub store_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Options {
    /// Parse gate arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a duration is zero or longer than `MAX_WINDOW`.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let max_seconds = MAX_WINDOW.as_secs();
        let max_millis = u64::try_from(MAX_WINDOW.as_millis()).unwrap_or(u64::MAX);

        let strings = |id: &str| -> Option<Vec<String>> {
            matches.get_many::<String>(id).map(|values| {
                values
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect()
            })
        };

        Ok(Self {
            rate_limits: strings(ARG_RATE_LIMIT).unwrap_or_default(),
            csrf_ttl: Duration::from_secs(bounded(matches, ARG_CSRF_TTL_SECONDS, max_seconds)?),
            csrf_exclude: strings(ARG_CSRF_EXCLUDE),
            insecure_cookies: matches.get_flag(ARG_INSECURE_COOKIES),
            trust_proxy: matches.get_flag(ARG_TRUST_PROXY),
            store_timeout: Duration::from_millis(bounded(
                matches,
                ARG_STORE_TIMEOUT_MS,
                max_millis,
            )?),
            sweep_interval: Duration::from_secs(bounded(
                matches,
                ARG_SWEEP_INTERVAL_SECONDS,
                max_seconds,
            )?),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_rate_limit_args(command);
    let command = with_csrf_args(command);
    with_store_args(command)
}

fn with_rate_limit_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RATE_LIMIT)
                .long(ARG_RATE_LIMIT)
                .help("Override a route class limit, example: login=10/900")
                .long_help(
                    "Override a route class limit as <class>=<max>/<window-seconds>. Classes: register, login, verify-token, resend-verification, password-reset, api. May be repeated or comma separated.",
                )
                .env("GATEHOUSE_RATE_LIMITS")
                .action(ArgAction::Append)
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_TRUST_PROXY)
                .long(ARG_TRUST_PROXY)
                .help("Key anonymous clients by x-forwarded-for / x-real-ip")
                .env("GATEHOUSE_TRUST_PROXY")
                .action(ArgAction::SetTrue),
        )
}

fn with_csrf_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_CSRF_TTL_SECONDS)
                .long(ARG_CSRF_TTL_SECONDS)
                .help("CSRF token TTL in seconds")
                .env("GATEHOUSE_CSRF_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_CSRF_EXCLUDE)
                .long(ARG_CSRF_EXCLUDE)
                .help("Path prefix exempt from CSRF checks, replaces the defaults")
                .env("GATEHOUSE_CSRF_EXCLUDE")
                .action(ArgAction::Append)
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_INSECURE_COOKIES)
                .long(ARG_INSECURE_COOKIES)
                .help("Drop the Secure attribute from cookies (local development only)")
                .env("GATEHOUSE_INSECURE_COOKIES")
                .action(ArgAction::SetTrue),
        )
}

fn with_store_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_STORE_TIMEOUT_MS)
                .long(ARG_STORE_TIMEOUT_MS)
                .help("Upper bound for every token store call, in milliseconds")
                .env("GATEHOUSE_STORE_TIMEOUT_MS")
                .default_value("3000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SWEEP_INTERVAL_SECONDS)
                .long(ARG_SWEEP_INTERVAL_SECONDS)
                .help("How often expired tokens and counters are purged")
                .env("GATEHOUSE_SWEEP_INTERVAL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}
