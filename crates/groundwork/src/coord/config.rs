use std::path::PathBuf;

use duration_str::deserialize_duration;
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use crate::*;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("at least one endpoint is required")]
	MissingEndpoints,
	#[error("TLS requires both a certificate and a key")]
	PartialTlsIdentity,
	#[error("failed to read TLS material: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
	pub endpoints: Vec<String>,
	#[serde(default = "default_dial_timeout", deserialize_with = "deserialize_duration")]
	pub dial_timeout: Duration,
	#[serde(
		default = "default_keep_alive_time",
		deserialize_with = "deserialize_duration"
	)]
	pub keep_alive_time: Duration,
	#[serde(
		default = "default_keep_alive_timeout",
		deserialize_with = "deserialize_duration"
	)]
	pub keep_alive_timeout: Duration,
	#[serde(
		default = "default_request_timeout",
		deserialize_with = "deserialize_duration"
	)]
	pub request_timeout: Duration,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password: Option<SecretString>,
	#[serde(default)]
	pub tls: Option<TlsConfig>,
	/// When set, every value is sealed with AES-256-GCM before it reaches the
	/// backend and opened on the way back. Keys stay in the clear.
	#[serde(default)]
	pub encryption_key: Option<SecretString>,
	/// Key prefix applied to every operation on this client.
	#[serde(default)]
	pub namespace: Option<String>,
}

impl Default for Config {
	fn default() -> Config {
		Config {
			endpoints: Vec::new(),
			dial_timeout: default_dial_timeout(),
			keep_alive_time: default_keep_alive_time(),
			keep_alive_timeout: default_keep_alive_timeout(),
			request_timeout: default_request_timeout(),
			username: None,
			password: None,
			tls: None,
			encryption_key: None,
			namespace: None,
		}
	}
}

impl Config {
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.endpoints.is_empty() {
			return Err(ConfigError::MissingEndpoints);
		}
		if let Some(tls) = &self.tls {
			if tls.cert_file.is_some() != tls.key_file.is_some() {
				return Err(ConfigError::PartialTlsIdentity);
			}
		}
		Ok(())
	}
}

fn default_dial_timeout() -> Duration {
	Duration::from_secs(5)
}

fn default_keep_alive_time() -> Duration {
	Duration::from_secs(30)
}

fn default_keep_alive_timeout() -> Duration {
	Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
	Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TlsConfig {
	#[serde(default)]
	pub ca_file: Option<PathBuf>,
	#[serde(default)]
	pub cert_file: Option<PathBuf>,
	#[serde(default)]
	pub key_file: Option<PathBuf>,
	/// Overrides the server name checked against the backend certificate.
	#[serde(default)]
	pub domain: Option<String>,
}

impl TlsConfig {
	pub(crate) fn load(&self) -> Result<etcd_client::TlsOptions, ConfigError> {
		let mut options = etcd_client::TlsOptions::new();
		if let Some(ca) = &self.ca_file {
			let pem = std::fs::read(ca)?;
			options = options.ca_certificate(etcd_client::Certificate::from_pem(pem));
		}
		if let (Some(cert), Some(key)) = (&self.cert_file, &self.key_file) {
			let cert = std::fs::read(cert)?;
			let key = std::fs::read(key)?;
			options = options.identity(etcd_client::Identity::from_pem(cert, key));
		}
		if let Some(domain) = &self.domain {
			options = options.domain_name(domain.clone());
		}
		Ok(options)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn deserializes_with_defaults() {
		let config: Config =
			serde_json::from_str(r#"{"endpoints": ["localhost:2379"]}"#).unwrap();
		assert_eq!(config.endpoints, vec!["localhost:2379"]);
		assert_eq!(config.dial_timeout, Duration::from_secs(5));
		assert_eq!(config.request_timeout, Duration::from_secs(5));
		assert!(config.encryption_key.is_none());
		config.validate().unwrap();
	}

	#[test]
	fn deserializes_durations_and_secrets() {
		let config: Config = serde_json::from_str(
			r#"{
				"endpoints": ["etcd-1:2379", "etcd-2:2379"],
				"dialTimeout": "10s",
				"requestTimeout": "2s",
				"username": "root",
				"password": "hunter2",
				"encryptionKey": "sealing key",
				"namespace": "/app/"
			}"#,
		)
		.unwrap();
		assert_eq!(config.dial_timeout, Duration::from_secs(10));
		assert_eq!(config.request_timeout, Duration::from_secs(2));
		assert_eq!(config.namespace.as_deref(), Some("/app/"));
		assert!(config.encryption_key.is_some());
		config.validate().unwrap();
	}

	#[test]
	fn rejects_missing_endpoints() {
		let config = Config::default();
		assert!(matches!(
			config.validate(),
			Err(ConfigError::MissingEndpoints)
		));
	}

	#[test]
	fn rejects_partial_tls_identity() {
		let config = Config {
			endpoints: vec!["localhost:2379".to_string()],
			tls: Some(TlsConfig {
				ca_file: None,
				cert_file: Some("client.crt".into()),
				key_file: None,
				domain: None,
			}),
			..Config::default()
		};
		assert!(matches!(
			config.validate(),
			Err(ConfigError::PartialTlsIdentity)
		));
	}
}
