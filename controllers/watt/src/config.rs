//! Command line configuration.
//!
//! Flags are parsed with clap; `Cli::into_config` validates them into the
//! `WattConfig` the rest of the agent consumes.

use crate::error::ControllerError;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Watch Kubernetes and Consul and publish consolidated snapshots.
#[derive(Debug, Parser)]
#[command(name = "watt", version)]
pub struct Cli {
    /// Namespace to watch (all namespaces when empty)
    #[arg(short = 'n', long, env = "WATCH_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Kind to watch before the first snapshot; repeatable, at least one required
    #[arg(short = 's', long = "source")]
    pub sources: Vec<String>,

    /// Field selector for the initial sources
    #[arg(long, default_value = "")]
    pub fields: String,

    /// Label selector for the initial sources
    #[arg(long, default_value = "")]
    pub labels: String,

    /// Watch hook command; repeatable
    #[arg(short = 'w', long = "watch")]
    pub watches: Vec<String>,

    /// Command notified with each snapshot URL; repeatable
    #[arg(long = "notify")]
    pub notify: Vec<String>,

    /// Port of the snapshot API
    #[arg(short = 'p', long, default_value_t = 7000)]
    pub port: u16,

    /// Address the snapshot API binds to
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub bind: IpAddr,

    /// Minimum interval between snapshots
    #[arg(short = 'i', long, default_value = "250ms", value_parser = parse_duration)]
    pub interval: Duration,

    /// Consul agent to take Connect leadership against
    #[arg(long, env = "CONSUL_CONNECT_ADDRESS")]
    pub consul_connect: Option<String>,

    /// Ambassador id used to name the Connect service and secret
    #[arg(long, env = "_AMBASSADOR_ID", default_value = "")]
    pub ambassador_id: String,

    /// Name of the Connect TLS secret
    #[arg(long, env = "_AMBASSADOR_TLS_SECRET_NAME")]
    pub tls_secret_name: Option<String>,

    /// Namespace of the Connect TLS secret
    #[arg(long, env = "_AMBASSADOR_TLS_SECRET_NAMESPACE")]
    pub tls_secret_namespace: Option<String>,

    /// How long shutdown waits for each group of workers
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub shutdown_grace: Duration,
}

/// Consul Connect leadership settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    pub consul_address: String,
    /// `ambassador` or `ambassador-<id>`
    pub service_name: String,
    pub secret_name: String,
    pub secret_namespace: String,
}

impl ConnectConfig {
    pub fn new(
        consul_address: String,
        ambassador_id: &str,
        secret_name: Option<String>,
        secret_namespace: Option<String>,
    ) -> Self {
        let service_name = if ambassador_id.is_empty() {
            "ambassador".to_string()
        } else {
            format!("ambassador-{ambassador_id}")
        };
        let secret_name = secret_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("{service_name}-consul-connect"));
        let secret_namespace = secret_namespace
            .filter(|namespace| !namespace.is_empty())
            .unwrap_or_else(|| "default".to_string());

        Self {
            consul_address,
            service_name,
            secret_name,
            secret_namespace,
        }
    }

    /// Consul KV key guarding leadership.
    pub fn lock_key(&self) -> String {
        format!("amb_consul_connect_leader_{}", self.service_name)
    }
}

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct WattConfig {
    /// Empty for all namespaces
    pub namespace: String,
    pub required_kinds: Vec<String>,
    pub field_selector: String,
    pub label_selector: String,
    pub watch_hooks: Vec<String>,
    pub notify: Vec<String>,
    pub listen: SocketAddr,
    pub interval: Duration,
    pub shutdown_grace: Duration,
    pub connect: Option<ConnectConfig>,
}

impl WattConfig {
    /// Host and port receivers use to fetch snapshots.
    pub fn api_authority(&self) -> String {
        format!("localhost:{}", self.listen.port())
    }
}

impl Cli {
    /// # Errors
    /// Returns `ControllerError::InvalidConfig` when no source kind is given.
    pub fn into_config(self) -> Result<WattConfig, ControllerError> {
        let required_kinds: Vec<String> = self
            .sources
            .into_iter()
            .map(|kind| kind.trim().to_string())
            .filter(|kind| !kind.is_empty())
            .collect();
        if required_kinds.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "at least one --source is required".to_string(),
            ));
        }

        let connect = self
            .consul_connect
            .filter(|address| !address.is_empty())
            .map(|address| {
                let namespace = self.tls_secret_namespace.or_else(|| {
                    (!self.namespace.is_empty()).then(|| self.namespace.clone())
                });
                ConnectConfig::new(address, &self.ambassador_id, self.tls_secret_name, namespace)
            });

        Ok(WattConfig {
            namespace: self.namespace,
            required_kinds,
            field_selector: self.fields,
            label_selector: self.labels,
            watch_hooks: self.watches,
            notify: self.notify,
            listen: SocketAddr::new(self.bind, self.port),
            interval: self.interval,
            shutdown_grace: self.shutdown_grace,
            connect,
        })
    }
}

/// Parses Go-style durations: `250ms`, `10s`, `1m30s`, `1.5h`, `0`.
///
/// # Errors
/// Returns a description of the first malformed component.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total_nanos = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return Err(format!("invalid duration {input:?}: expected a number"));
        }
        let value: f64 = rest[..number_end]
            .parse()
            .map_err(|e| format!("invalid duration {input:?}: {e}"))?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("invalid duration {input:?}: missing unit")),
            unit => return Err(format!("invalid duration {input:?}: unknown unit {unit:?}")),
        };
        rest = &rest[unit_end..];
        total_nanos += value * nanos_per_unit;
    }

    let total_nanos = total_nanos.round();
    if !total_nanos.is_finite() || total_nanos >= u64::MAX as f64 {
        return Err(format!("invalid duration {input:?}: out of range"));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "range checked above")]
    let nanos = total_nanos as u64;
    Ok(Duration::from_nanos(nanos))
}
