use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::schema::BridgeConfig;

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["moobridge.toml", "moobridge.json"];

/// Load config from the given path; format picked by extension.
pub fn load_config(path: &Path) -> anyhow::Result<BridgeConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid JSON in {}: {e}", path.display()))
    } else {
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("invalid TOML in {}: {e}", path.display()))
    }
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./moobridge.{toml,json}` (project-local)
/// 2. `~/.config/moobridge/moobridge.{toml,json}` (user-global)
///
/// Returns `BridgeConfig::default()` if no config file is found.
pub fn discover_and_load() -> BridgeConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    BridgeConfig::default()
}

fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }
    if let Some(dir) = home_dir().map(|h| h.join(".config").join("moobridge")) {
        for name in CONFIG_FILENAMES {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Read the bot access token from the file named by the config.
///
/// The token lives in its own file so the config itself can be checked in.
pub fn read_token_file(path: &Path) -> anyhow::Result<String> {
    let raw = std::fs::read_to_string(path).map_err(|_| {
        anyhow::anyhow!(
            "missing token file '{}'; create it with the bot's access token from the \
             platform's app settings",
            path.display()
        )
    })?;
    let token = raw.trim().to_string();
    if token.is_empty() {
        anyhow::bail!("token file '{}' is empty", path.display());
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loads_toml_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moobridge.toml");
        std::fs::write(&path, "[moo]\naddress = \"m:1234\"\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.moo.address, "m:1234");
    }

    #[test]
    fn loads_json_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moobridge.json");
        std::fs::write(&path, r#"{"moo": {"address": "m:1234"}}"#).unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.moo.address, "m:1234");
    }

    #[test]
    fn token_file_is_trimmed() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "  xoxb-secret  ").unwrap();
        assert_eq!(read_token_file(f.path()).unwrap(), "xoxb-secret");
    }

    #[test]
    fn missing_token_file_names_the_path() {
        let err = read_token_file(Path::new("/nonexistent/token")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/token"));
    }

    #[test]
    fn empty_token_file_is_an_error() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(read_token_file(f.path()).is_err());
    }
}
