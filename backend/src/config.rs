// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ambient configuration, loaded the way the teacher service loads its
//! [`Settings`] (layered `config` sources, deserialized with `serde`).

use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub kv: KvSettings,
    pub gateway: GatewaySettings,
    pub sequence: SequenceSettings,
    pub cache: CacheSettings,
}

impl Settings {
    /// Loads configuration the way the rest of the fleet does: a base file,
    /// an environment-specific overlay, then environment variables prefixed
    /// `APP_` with `__` as the nesting separator.
    pub fn load() -> Result<Self, config::ConfigError> {
        let environment = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "local".into());
        let builder = config::Config::builder()
            .add_source(config::File::with_name("configuration/base").required(false))
            .add_source(
                config::File::with_name(&format!("configuration/{environment}")).required(false),
            )
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        builder.build()?.try_deserialize()
    }
}

/// Configuration for the backing document store.
#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: String,
    pub port: u16,
    pub host: String,
    pub name: String,
    pub cacertpath: Option<String>,
}

impl DatabaseSettings {
    fn add_tls_mode(&self, mut connection_string: String) -> String {
        if let Some(ref ca_cert_path) = self.cacertpath {
            connection_string.push_str(&format!("?sslmode=verify-ca&sslrootcert={ca_cert_path}"));
        } else {
            tracing::warn!(
                "No CA certificate path set for database connection. TLS will not be enabled."
            );
        }
        connection_string
    }

    fn base_connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}",
            self.username, self.password, self.host, self.port
        )
    }

    pub fn connection_string(&self) -> String {
        let mut connection_string = self.base_connection_string();
        connection_string.push('/');
        connection_string.push_str(&self.name);
        self.add_tls_mode(connection_string)
    }

    pub fn connection_string_without_database(&self) -> String {
        let connection_string = self.base_connection_string();
        self.add_tls_mode(connection_string)
    }
}

/// Configuration for the Redis-cluster KV store backing C1/C2/C5.
#[derive(Deserialize, Clone, Debug)]
pub struct KvSettings {
    /// `redis://` or `redis-cluster://` URLs, one per seed node.
    pub nodes: Vec<String>,
    #[serde(default)]
    pub cluster_mode: bool,
}

/// Configuration for the slot-aware gateway (§4.1).
#[derive(Deserialize, Clone, Debug)]
pub struct GatewaySettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_worker_cap")]
    pub worker_cap: usize,
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_batch_size() -> usize {
    50
}

fn default_worker_cap() -> usize {
    3
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            worker_cap: default_worker_cap(),
            continue_on_error: false,
        }
    }
}

/// Configuration for the sequence allocator (§4.5).
#[derive(Deserialize, Clone, Debug)]
pub struct SequenceSettings {
    #[serde(default = "default_basic_group")]
    pub basic_reservation_group: i64,
    #[serde(default = "default_basic_single")]
    pub basic_reservation_single: i64,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: i64,
    #[serde(default = "default_data_ttl_ms")]
    pub data_ttl_ms: i64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_shard_size")]
    pub doc_shard_size: i64,
}

fn default_basic_group() -> i64 {
    100
}

fn default_basic_single() -> i64 {
    50
}

fn default_lock_ttl_ms() -> i64 {
    3_000
}

fn default_data_ttl_ms() -> i64 {
    7 * 24 * 3_600 * 1_000
}

fn default_retry_interval_ms() -> u64 {
    250
}

fn default_retry_attempts() -> u32 {
    10
}

fn default_shard_size() -> i64 {
    imcommon::DEFAULT_DOC_SHARD_SIZE
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            basic_reservation_group: default_basic_group(),
            basic_reservation_single: default_basic_single(),
            lock_ttl_ms: default_lock_ttl_ms(),
            data_ttl_ms: default_data_ttl_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            retry_attempts: default_retry_attempts(),
            doc_shard_size: default_shard_size(),
        }
    }
}

/// Configuration for the strong-consistency cache (§4.2).
#[derive(Deserialize, Clone, Debug)]
pub struct CacheSettings {
    #[serde(default = "default_message_ttl_s")]
    pub message_ttl_s: i64,
    #[serde(default = "default_entity_ttl_s")]
    pub entity_ttl_s: i64,
}

fn default_message_ttl_s() -> i64 {
    86_400
}

fn default_entity_ttl_s() -> i64 {
    3_600
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            message_ttl_s: default_message_ttl_s(),
            entity_ttl_s: default_entity_ttl_s(),
        }
    }
}
