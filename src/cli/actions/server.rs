use crate::{
    api::{self, ServerConfig},
    cli::telemetry,
    gate::{CsrfConfig, GateConfig, PolicyTable, SessionConfig},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub session_secret: SecretString,
    pub session_ttl: Duration,
    pub session_refresh_interval: Duration,
    pub rate_limits: Vec<String>,
    pub csrf_ttl: Duration,
    pub csrf_exclude: Option<Vec<String>>,
    pub insecure_cookies: bool,
    pub trust_proxy: bool,
    pub store_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Args {
    /// Rate-limit policies with every `--rate-limit` override applied in order.
    ///
    /// # Errors
    /// Returns an error if an override cannot be parsed.
    pub fn policies(&self) -> Result<PolicyTable> {
        let mut policies = PolicyTable::default();
        for value in &self.rate_limits {
            policies = policies
                .with_override(value)
                .with_context(|| format!("invalid --rate-limit value: {value}"))?;
        }
        Ok(policies)
    }

    /// Resolve the server configuration, consuming the signing key.
    ///
    /// # Errors
    /// Returns an error if a rate-limit override cannot be parsed.
    pub fn into_server_config(self) -> Result<ServerConfig> {
        let policies = self.policies()?;

        let mut csrf = CsrfConfig::default()
            .with_ttl(self.csrf_ttl)
            .with_cookie_secure(!self.insecure_cookies);
        if let Some(prefixes) = self.csrf_exclude {
            csrf = csrf.with_excluded_prefixes(prefixes);
        }

        let session = SessionConfig::default()
            .with_ttl(self.session_ttl)
            .with_refresh_interval(self.session_refresh_interval)
            .with_cookie_secure(!self.insecure_cookies);

        let gate = GateConfig::new(self.session_secret)
            .with_csrf(csrf)
            .with_session(session)
            .with_policies(policies)
            .with_trust_proxy(self.trust_proxy)
            .with_store_timeout(self.store_timeout);

        Ok(ServerConfig {
            port: self.port,
            dsn: self.dsn,
            gate,
            sweep_interval: self.sweep_interval,
        })
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the configuration is invalid or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    debug!(
        port = args.port,
        trust_proxy = args.trust_proxy,
        insecure_cookies = args.insecure_cookies,
        "Starting gatehouse"
    );

    let result = api::new(args.into_server_config()?).await;

    telemetry::shutdown_tracer();
    result
}
