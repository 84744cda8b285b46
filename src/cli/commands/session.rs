use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use std::time::Duration;

use super::bounded;
use crate::store::MAX_WINDOW;

pub const ARG_SESSION_SECRET: &str = "session-secret";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_SESSION_REFRESH_SECONDS: &str = "session-refresh-seconds";

/// Smallest accepted signing key, in bytes.
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug)]
pub struct Options {
    pub secret: SecretString,
    pub ttl: Duration,
    pub refresh_interval: Duration,
}

impl Options {
    /// Parse session arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the signing key is missing or too short, or a
    /// duration is zero or longer than `MAX_WINDOW`.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let secret = matches
            .get_one::<String>(ARG_SESSION_SECRET)
            .filter(|v| !v.trim().is_empty())
            .context("missing required argument: --session-secret")?;
        if secret.len() < MIN_SECRET_LEN {
            anyhow::bail!("--{ARG_SESSION_SECRET} must be at least {MIN_SECRET_LEN} bytes");
        }

        let seconds = |id: &str| bounded(matches, id, MAX_WINDOW.as_secs());

        Ok(Self {
            secret: SecretString::from(secret.clone()),
            ttl: Duration::from_secs(seconds(ARG_SESSION_TTL_SECONDS)?),
            refresh_interval: Duration::from_secs(seconds(ARG_SESSION_REFRESH_SECONDS)?),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_SECRET)
                .long(ARG_SESSION_SECRET)
                .help("HMAC key used to sign session tokens")
                .env("GATEHOUSE_SESSION_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session token TTL in seconds")
                .env("GATEHOUSE_SESSION_TTL_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SESSION_REFRESH_SECONDS)
                .long(ARG_SESSION_REFRESH_SECONDS)
                .help("Re-read the verification flag from the identity store after this many seconds")
                .env("GATEHOUSE_SESSION_REFRESH_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64)),
        )
}
