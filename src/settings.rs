use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::Cli;
use crate::dns::{self, Forwarder, Handler, UdpUpstream};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("--resolver needs an upstream address as <host:port>")]
    EmptyResolver,
    #[error("cannot resolve upstream resolver {addr:?}: {reason}")]
    UnresolvableResolver { addr: String, reason: String },
    #[error(transparent)]
    Dns(#[from] dns::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen_address: SocketAddr,
    /// Upstream resolver as `<host:port>`; without one queries are answered
    /// locally.
    pub resolver: Option<String>,

    pub upstream_timeout_ms: u64,
    pub upstream_retries: u32,
    pub upstream_backoff_ms: u64,
    pub max_in_flight: usize,

    pub answer_ttl: i32,
    pub answer_address: String,
}

impl Settings {
    /// Loads the settings from the default locations, the optional
    /// `config_file` and `DNS_RELAY_*` environment variables, in that order.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let env = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let mut builder = defaults()?
            .add_source(File::with_name("/etc/dns-relay/config.toml").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false));

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }

        builder
            .add_source(Environment::with_prefix("dns_relay"))
            .build()?
            .try_deserialize()
    }

    /// Built-in defaults overlaid with a single file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        defaults()?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()
    }

    /// Command line flags take precedence over every other source.
    pub fn with_cli(mut self, cli: Cli) -> Self {
        if let Some(resolver) = cli.resolver {
            self.resolver = Some(resolver);
        }
        if let Some(listen) = cli.listen {
            self.listen_address = listen;
        }
        self
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn upstream_backoff(&self) -> Duration {
        Duration::from_millis(self.upstream_backoff_ms)
    }

    /// Picks the mode: forwarding when a resolver is configured, standalone
    /// otherwise. The resolver address is looked up once, here.
    pub async fn handler(&self) -> Result<Handler, Error> {
        let resolver = match self.resolver.as_deref().map(str::trim) {
            None => {
                let addr = dns::parse_address(&self.answer_address)?;
                return Ok(Handler::Standalone {
                    ttl: self.answer_ttl,
                    addr,
                });
            }
            Some("") => return Err(Error::EmptyResolver),
            Some(resolver) => resolver,
        };

        let unresolvable = |reason: String| Error::UnresolvableResolver {
            addr: resolver.to_string(),
            reason,
        };
        let server_addr = tokio::net::lookup_host(resolver)
            .await
            .map_err(|e| unresolvable(e.to_string()))?
            .next()
            .ok_or_else(|| unresolvable("no address found".to_string()))?;

        let upstream = UdpUpstream::new(server_addr, self.upstream_timeout());
        let forwarder = Forwarder::new(Arc::new(upstream))
            .with_retries(self.upstream_retries, self.upstream_backoff());

        Ok(Handler::Forwarding(forwarder))
    }
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("listen_address", "127.0.0.1:2053")?
        .set_default("upstream_timeout_ms", 2000_i64)?
        .set_default("upstream_retries", 0_i64)?
        .set_default("upstream_backoff_ms", 100_i64)?
        .set_default("max_in_flight", 256_i64)?
        .set_default("answer_ttl", 60_i64)?
        .set_default("answer_address", "8.8.8.8")
}
