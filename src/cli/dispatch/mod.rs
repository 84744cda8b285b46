//! Command-line argument dispatch.
//!
//! Maps validated CLI matches to the action to run, currently only the
//! gate server with its full configuration.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{ARG_DSN, ARG_PORT, gate, session};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;

    let session_opts = session::Options::parse(matches)?;
    let gate_opts = gate::Options::parse(matches)?;

    let args = Args {
        port,
        dsn,
        session_secret: session_opts.secret,
        session_ttl: session_opts.ttl,
        session_refresh_interval: session_opts.refresh_interval,
        rate_limits: gate_opts.rate_limits,
        csrf_ttl: gate_opts.csrf_ttl,
        csrf_exclude: gate_opts.csrf_exclude,
        insecure_cookies: gate_opts.insecure_cookies,
        trust_proxy: gate_opts.trust_proxy,
        store_timeout: gate_opts.store_timeout,
        sweep_interval: gate_opts.sweep_interval,
    };

    // Surface bad overrides at startup, before touching the database.
    args.policies()?;

    Ok(Action::Server(args))
}
