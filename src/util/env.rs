//! Environment helpers: centralized dotenv loading, getters and redaction.
//! Call `init_env()` once early in each binary (or rely on lazy Once).
use std::path::Path;
use std::sync::Once;
use tracing::{debug, info};

static INIT: Once = Once::new();

/// Load `.env.local` (the web app's file) and then `.env` exactly once.
/// Values already present in the process env win; safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        for candidate in [".env.local", ".env"] {
            if Path::new(candidate).exists() {
                match dotenv::from_filename(candidate) {
                    Ok(_) => debug!(target = "env", file = candidate, "loaded env file"),
                    Err(e) => debug!(target = "env", file = candidate, error = %e, "env file unreadable"),
                }
            }
        }
    });
}

/// Common bootstrap for CLI binaries: load env files and log which job started.
pub fn bootstrap_cli(bin_name: &str) {
    init_env();
    info!(target = "bootstrap", bin = bin_name, "starting");
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Append `sslmode=require` unless the DSN already pins an sslmode.
pub fn ensure_sslmode_require(database_url: &str) -> String {
    if database_url.contains("sslmode=") {
        return database_url.to_string();
    }
    let separator = if database_url.contains('?') { '&' } else { '?' };
    format!("{database_url}{separator}sslmode=require")
}

/// Mask secrets before they reach a log line.
pub fn redact_value(key: &str, val: &str) -> String {
    let k = key.to_ascii_uppercase();
    if k.contains("PASSWORD") || k.contains("SECRET") || k.contains("TOKEN") {
        return "***".to_string();
    }

    let val_trim = val.trim();

    // Always redact postgres DSNs even if the key isn't obviously sensitive.
    if let Ok(mut u) = url::Url::parse(val_trim) {
        let scheme = u.scheme().to_ascii_lowercase();
        if scheme == "postgres" || scheme == "postgresql" {
            let _ = u.set_username("***");
            let _ = u.set_password(Some("***"));
            return u.to_string();
        }
    }

    if (k.contains("URL") || k.contains("DSN"))
        && (val_trim.starts_with("postgres://") || val_trim.starts_with("postgresql://"))
    {
        return "postgres://***".to_string();
    }

    val_trim.to_string()
}
