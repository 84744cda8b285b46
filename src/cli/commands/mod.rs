pub mod gate;
pub mod logging;
pub mod session;

use anyhow::Context;
use clap::{
    Arg, ArgMatches, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_PORT: &str = "port";
pub const ARG_DSN: &str = "dsn";

/// Read a `u64` argument that must fall within `1..=max`.
///
/// # Errors
/// Returns an error naming the flag when the value is zero or above `max`.
pub(crate) fn bounded(matches: &ArgMatches, id: &str, max: u64) -> anyhow::Result<u64> {
    let value = matches
        .get_one::<u64>(id)
        .copied()
        .with_context(|| format!("missing required argument: --{id}"))?;
    if value == 0 || value > max {
        anyhow::bail!("--{id} must be between 1 and {max}");
    }
    Ok(value)
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("gatehouse")
        .about("Request security gate: CSRF, rate limiting and verified sessions")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("GATEHOUSE_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string")
                .long_help(
                    "Database connection string. Tokens, rate-limit counters and identities are read from this database.",
                )
                .env("GATEHOUSE_DSN")
                .required(true),
        );

    let command = session::with_args(command);
    let command = gate::with_args(command);
    logging::with_args(command)
}
