use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::error::{Error, Result};

/// NIP-11 information document fields.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    pub contact: String,
    pub supported_nips: Vec<u32>,
    pub software: String,
    pub version: String,
}

impl Default for RelayInfo {
    fn default() -> Self {
        Self {
            name: "grotto".to_string(),
            description: "A Rust-based Nostr relay with moderated groups".to_string(),
            contact: String::new(),
            supported_nips: vec![1, 9, 11, 29, 40, 42, 45],
            software: "grotto".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Declarative toggles for the built-in rejection policies. A policy is
/// inactive unless its key is set.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// `RELAY_FORBIDDEN_KINDS`: comma-separated kind numbers.
    pub forbidden_kinds: HashSet<u32>,
    /// `RELAY_MAX_TAGS`: maximum tag count per event.
    pub max_tags: Option<usize>,
    /// `RELAY_MAX_CONTENT_BYTES`: maximum content length.
    pub max_content_bytes: Option<usize>,
    /// `RELAY_CREATED_AT_FUTURE_SECS`: allowed clock drift ahead of now.
    pub created_at_future_secs: Option<i64>,
    /// `RELAY_CREATED_AT_PAST_SECS`: maximum event age.
    pub created_at_past_secs: Option<i64>,
    /// `RELAY_BLOCKED_PUBKEYS`: comma-separated hex pubkeys.
    pub blocked_pubkeys: HashSet<String>,
    /// `RELAY_ALLOWED_PUBKEYS`: when set, only these pubkeys may publish.
    pub allowed_pubkeys: HashSet<String>,
    /// `RELAY_AUTH_REQUIRED_KINDS`: kinds demanding NIP-42 auth.
    pub auth_required_kinds: HashSet<u32>,
    /// `RELAY_REQUIRED_TAGS`: `kind:tag` pairs, `;`-separated
    /// (e.g. `42:e;1984:p`).
    pub required_tags: HashMap<u32, Vec<String>>,
    /// `RELAY_NON_EMPTY_CONTENT_KINDS`: kinds whose content must not be
    /// empty.
    pub non_empty_content_kinds: HashSet<u32>,
    /// `RELAY_BLOCKED_TAG_VALUES`: `tag=value,value` pairs,
    /// `;`-separated (e.g. `t=spam,scam`).
    pub blocked_tag_values: HashMap<String, HashSet<String>>,
    /// `RELAY_REJECT_EXPIRED`: refuse already-expired events
    /// (default true).
    pub reject_expired: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            forbidden_kinds: HashSet::new(),
            max_tags: None,
            max_content_bytes: None,
            created_at_future_secs: None,
            created_at_past_secs: None,
            blocked_pubkeys: HashSet::new(),
            allowed_pubkeys: HashSet::new(),
            auth_required_kinds: HashSet::new(),
            required_tags: HashMap::new(),
            non_empty_content_kinds: HashSet::new(),
            blocked_tag_values: HashMap::new(),
            reject_expired: true,
        }
    }
}

/// Runtime configuration, read once at startup from the environment.
/// Unknown `RELAY_*` variables produce a warning and are ignored.
#[derive(Debug, Clone)]
pub struct Config {
    /// `DATABASE_URL`: Postgres connection string. Absent means the
    /// in-memory store.
    pub database_url: Option<String>,
    /// `RELAY_HOST` (default `0.0.0.0`).
    pub host: String,
    /// `RELAY_PORT` (default `3001`).
    pub port: u16,
    /// `RELAY_SECRET_KEY`: 32-byte hex. Absent means an ephemeral key is
    /// generated at startup.
    pub secret_key: Option<String>,
    /// `RELAY_LEGACY_REPLACEABLE` (default false): narrow the replaceable
    /// classification to kind 0 plus the addressable range.
    pub legacy_replaceable: bool,
    /// `RELAY_MAX_QUERY_LIMIT` (default 500): cap on any filter limit.
    pub max_query_limit: usize,
    /// `RELAY_OUTBOUND_QUEUE` (default 128): per-connection outbound
    /// buffer, in frames.
    pub outbound_queue: usize,
    /// `RELAY_RATE_LIMIT_PER_MIN`: accepted events per minute per
    /// connection. Parsed for the hook; no built-in limiter.
    pub rate_limit_events_per_min: Option<u32>,
    /// `RELAY_NAME`, `RELAY_DESCRIPTION`, `RELAY_CONTACT`.
    pub info: RelayInfo,
    pub policies: PolicyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            host: "0.0.0.0".to_string(),
            port: 3001,
            secret_key: None,
            legacy_replaceable: false,
            max_query_limit: 500,
            outbound_queue: 128,
            rate_limit_events_per_min: None,
            info: RelayInfo::default(),
            policies: PolicyConfig::default(),
        }
    }
}

const RECOGNIZED_KEYS: &[&str] = &[
    "RELAY_HOST",
    "RELAY_PORT",
    "RELAY_SSL",
    "RELAY_SSL_CERT",
    "RELAY_SSL_KEY",
    "RELAY_SECRET_KEY",
    "RELAY_NAME",
    "RELAY_DESCRIPTION",
    "RELAY_CONTACT",
    "RELAY_LEGACY_REPLACEABLE",
    "RELAY_MAX_QUERY_LIMIT",
    "RELAY_OUTBOUND_QUEUE",
    "RELAY_RATE_LIMIT_PER_MIN",
    "RELAY_FORBIDDEN_KINDS",
    "RELAY_MAX_TAGS",
    "RELAY_MAX_CONTENT_BYTES",
    "RELAY_CREATED_AT_FUTURE_SECS",
    "RELAY_CREATED_AT_PAST_SECS",
    "RELAY_BLOCKED_PUBKEYS",
    "RELAY_ALLOWED_PUBKEYS",
    "RELAY_AUTH_REQUIRED_KINDS",
    "RELAY_REQUIRED_TAGS",
    "RELAY_NON_EMPTY_CONTENT_KINDS",
    "RELAY_BLOCKED_TAG_VALUES",
    "RELAY_REJECT_EXPIRED",
];

impl Config {
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        for key in vars.keys() {
            if key.starts_with("RELAY_") && !RECOGNIZED_KEYS.contains(&key.as_str()) {
                warn!("ignoring unrecognized configuration key {key}");
            }
        }

        let mut config = Config {
            database_url: vars.get("DATABASE_URL").cloned(),
            ..Default::default()
        };

        if let Some(host) = vars.get("RELAY_HOST") {
            config.host = host.clone();
        }
        if let Some(port) = vars.get("RELAY_PORT") {
            config.port = parse(port, "RELAY_PORT")?;
        }
        if vars.get("RELAY_SSL").is_some_and(|v| v != "false") {
            // TLS is terminated by a fronting proxy; the keys are accepted
            // so existing deployments keep their configuration.
            warn!("RELAY_SSL is set but TLS termination is delegated to the fronting proxy");
        }
        config.secret_key = vars.get("RELAY_SECRET_KEY").cloned();
        if let Some(v) = vars.get("RELAY_LEGACY_REPLACEABLE") {
            config.legacy_replaceable = parse_bool(v, "RELAY_LEGACY_REPLACEABLE")?;
        }
        if let Some(v) = vars.get("RELAY_MAX_QUERY_LIMIT") {
            config.max_query_limit = parse(v, "RELAY_MAX_QUERY_LIMIT")?;
        }
        if let Some(v) = vars.get("RELAY_OUTBOUND_QUEUE") {
            config.outbound_queue = parse(v, "RELAY_OUTBOUND_QUEUE")?;
        }
        if let Some(v) = vars.get("RELAY_RATE_LIMIT_PER_MIN") {
            config.rate_limit_events_per_min = Some(parse(v, "RELAY_RATE_LIMIT_PER_MIN")?);
        }

        if let Some(name) = vars.get("RELAY_NAME") {
            config.info.name = name.clone();
        }
        if let Some(description) = vars.get("RELAY_DESCRIPTION") {
            config.info.description = description.clone();
        }
        if let Some(contact) = vars.get("RELAY_CONTACT") {
            config.info.contact = contact.clone();
        }

        let p = &mut config.policies;
        if let Some(v) = vars.get("RELAY_FORBIDDEN_KINDS") {
            p.forbidden_kinds = parse_set(v, "RELAY_FORBIDDEN_KINDS")?;
        }
        if let Some(v) = vars.get("RELAY_MAX_TAGS") {
            p.max_tags = Some(parse(v, "RELAY_MAX_TAGS")?);
        }
        if let Some(v) = vars.get("RELAY_MAX_CONTENT_BYTES") {
            p.max_content_bytes = Some(parse(v, "RELAY_MAX_CONTENT_BYTES")?);
        }
        if let Some(v) = vars.get("RELAY_CREATED_AT_FUTURE_SECS") {
            p.created_at_future_secs = Some(parse(v, "RELAY_CREATED_AT_FUTURE_SECS")?);
        }
        if let Some(v) = vars.get("RELAY_CREATED_AT_PAST_SECS") {
            p.created_at_past_secs = Some(parse(v, "RELAY_CREATED_AT_PAST_SECS")?);
        }
        if let Some(v) = vars.get("RELAY_BLOCKED_PUBKEYS") {
            p.blocked_pubkeys = split_list(v).map(str::to_string).collect();
        }
        if let Some(v) = vars.get("RELAY_ALLOWED_PUBKEYS") {
            p.allowed_pubkeys = split_list(v).map(str::to_string).collect();
        }
        if let Some(v) = vars.get("RELAY_AUTH_REQUIRED_KINDS") {
            p.auth_required_kinds = parse_set(v, "RELAY_AUTH_REQUIRED_KINDS")?;
        }
        if let Some(v) = vars.get("RELAY_REQUIRED_TAGS") {
            p.required_tags = parse_required_tags(v)?;
        }
        if let Some(v) = vars.get("RELAY_NON_EMPTY_CONTENT_KINDS") {
            p.non_empty_content_kinds = parse_set(v, "RELAY_NON_EMPTY_CONTENT_KINDS")?;
        }
        if let Some(v) = vars.get("RELAY_BLOCKED_TAG_VALUES") {
            p.blocked_tag_values = parse_blocked_tags(v)?;
        }
        if let Some(v) = vars.get("RELAY_REJECT_EXPIRED") {
            p.reject_expired = parse_bool(v, "RELAY_REJECT_EXPIRED")?;
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: cannot parse '{value}'")))
}

fn parse_bool(value: &str, key: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::Config(format!("{key}: expected a boolean, got '{value}'"))),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_set<T: std::str::FromStr + Eq + std::hash::Hash>(
    value: &str,
    key: &str,
) -> Result<HashSet<T>> {
    split_list(value).map(|item| parse(item, key)).collect()
}

/// `kind:tag` pairs, `;`-separated; repeated kinds accumulate.
fn parse_required_tags(value: &str) -> Result<HashMap<u32, Vec<String>>> {
    let mut map: HashMap<u32, Vec<String>> = HashMap::new();
    for pair in value.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (kind, tag) = pair.split_once(':').ok_or_else(|| {
            Error::Config(format!("RELAY_REQUIRED_TAGS: expected kind:tag, got '{pair}'"))
        })?;
        map.entry(parse(kind, "RELAY_REQUIRED_TAGS")?)
            .or_default()
            .push(tag.trim().to_string());
    }
    Ok(map)
}

/// `tag=value,value` pairs, `;`-separated.
fn parse_blocked_tags(value: &str) -> Result<HashMap<String, HashSet<String>>> {
    let mut map: HashMap<String, HashSet<String>> = HashMap::new();
    for pair in value.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (tag, values) = pair.split_once('=').ok_or_else(|| {
            Error::Config(format!(
                "RELAY_BLOCKED_TAG_VALUES: expected tag=values, got '{pair}'"
            ))
        })?;
        map.entry(tag.trim().to_string())
            .or_default()
            .extend(split_list(values).map(str::to_string));
    }
    Ok(map)
}
