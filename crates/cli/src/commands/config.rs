use std::env;
use std::fs;
use std::path::Path;

use toml::Value;
use wrkspace_core::config::{resolve_config_path, AppConfig, LoadOptions};

struct ConfigField {
    key_path: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

pub fn run(options: &LoadOptions) -> String {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = resolve_config_path(options.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key_path,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key_path, &field.value, source));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<ConfigField> {
    vec![
        ConfigField {
            key_path: "database.url",
            env_keys: &["WRKSPACE_DATABASE_URL"],
            value: redact_url(&config.database.url),
        },
        ConfigField {
            key_path: "database.max_connections",
            env_keys: &["WRKSPACE_DATABASE_MAX_CONNECTIONS"],
            value: config.database.max_connections.to_string(),
        },
        ConfigField {
            key_path: "database.timeout_secs",
            env_keys: &["WRKSPACE_DATABASE_TIMEOUT_SECS"],
            value: config.database.timeout_secs.to_string(),
        },
        ConfigField {
            key_path: "approvals.max_write_attempts",
            env_keys: &["WRKSPACE_APPROVALS_MAX_WRITE_ATTEMPTS"],
            value: config.approvals.max_write_attempts.to_string(),
        },
        ConfigField {
            key_path: "approvals.notifications_enabled",
            env_keys: &["WRKSPACE_APPROVALS_NOTIFICATIONS_ENABLED"],
            value: config.approvals.notifications_enabled.to_string(),
        },
        ConfigField {
            key_path: "approvals.require_fallback_chain",
            env_keys: &["WRKSPACE_APPROVALS_REQUIRE_FALLBACK_CHAIN"],
            value: config.approvals.require_fallback_chain.to_string(),
        },
        ConfigField {
            key_path: "approvals.pending_page_size",
            env_keys: &["WRKSPACE_APPROVALS_PENDING_PAGE_SIZE"],
            value: config.approvals.pending_page_size.to_string(),
        },
        ConfigField {
            key_path: "logging.level",
            env_keys: &["WRKSPACE_LOGGING_LEVEL", "WRKSPACE_LOG_LEVEL"],
            value: config.logging.level.clone(),
        },
        ConfigField {
            key_path: "logging.format",
            env_keys: &["WRKSPACE_LOGGING_FORMAT", "WRKSPACE_LOG_FORMAT"],
            value: format!("{:?}", config.logging.format),
        },
    ]
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Hides credentials embedded in a connection URL.
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((_, host)) => format!("{scheme}://***@{host}"),
        None => url.to_string(),
    }
}
