use std::fmt::{Debug, Formatter};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::utils::redaction::REDACTION_TOKEN;

pub const DEFAULT_MAX_RETRIES: usize = 2;
pub const MAX_RETRIES_CEILING: usize = 10;
pub const DEFAULT_ROW_CAP: usize = 1_000;

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const OPENAI_BASE_URL_ENV: &str = "OPENAI_BASE_URL";
pub const OPENAI_MODEL_ENV: &str = "OPENAI_MODEL";
pub const LLM_TIMEOUT_SECS_ENV: &str = "QUARRY_LLM_TIMEOUT_SECS";
pub const LLM_MAX_TOKENS_ENV: &str = "QUARRY_LLM_MAX_TOKENS";
pub const LLM_TEMPERATURE_ENV: &str = "QUARRY_LLM_TEMPERATURE";
pub const LOG_FILTER_ENV: &str = "QUARRY_LOG";
pub const DEFAULT_LOG_FILTER: &str = "warn";

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 60;
const DEFAULT_LLM_MAX_TOKENS: u32 = 1_200;
const DEFAULT_LLM_TEMPERATURE: f32 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub home_dir: PathBuf,
    pub cwd: PathBuf,
    pub database_path: PathBuf,
    pub catalog_path: PathBuf,
}

pub fn resolve_runtime_paths(
    home_dir: &Path,
    cwd: &Path,
    database_override: Option<&Path>,
    catalog_override: Option<&Path>,
) -> Result<RuntimePaths> {
    if !home_dir.is_absolute() {
        bail!("home_dir must be absolute: {}", home_dir.display());
    }
    if !cwd.is_absolute() {
        bail!("cwd must be absolute: {}", cwd.display());
    }

    let home_dir = normalize_lexical(home_dir);
    let cwd = normalize_lexical(cwd);
    let state_dir = home_dir.join(".quarry");
    let database_path = match database_override {
        Some(path) => resolve_user_path(path, &home_dir, &cwd)?,
        None => state_dir.join("warehouse.sqlite"),
    };
    let catalog_path = match catalog_override {
        Some(path) => resolve_user_path(path, &home_dir, &cwd)?,
        None => state_dir.join("contexts.json"),
    };

    Ok(RuntimePaths {
        home_dir,
        cwd,
        database_path: normalize_lexical(&database_path),
        catalog_path: normalize_lexical(&catalog_path),
    })
}

/// Knobs for one resolution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverSettings {
    pub max_retries: usize,
    pub row_cap: usize,
    pub enforce_table_scope: bool,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            row_cap: DEFAULT_ROW_CAP,
            enforce_table_scope: true,
        }
    }
}

impl ResolverSettings {
    pub fn validate(&self) -> Result<()> {
        if self.row_cap == 0 {
            bail!("row_cap must be greater than zero");
        }
        if self.max_retries > MAX_RETRIES_CEILING {
            bail!(
                "max_retries must be at most {MAX_RETRIES_CEILING} (got {})",
                self.max_retries
            );
        }
        Ok(())
    }
}

/// Connection settings for the OpenAI-compatible chat endpoint.
#[derive(Clone, PartialEq)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Debug for LlmSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &REDACTION_TOKEN)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LlmSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let Some(api_key) = read(OPENAI_API_KEY_ENV) else {
            bail!(
                "language model access requires {OPENAI_API_KEY_ENV} (set it in the environment)"
            );
        };

        let base_url = normalize_http_base_url(
            read(OPENAI_BASE_URL_ENV)
                .as_deref()
                .unwrap_or(DEFAULT_OPENAI_BASE_URL),
        );
        let model = read(OPENAI_MODEL_ENV).unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());

        let timeout_secs = match read(LLM_TIMEOUT_SECS_ENV) {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("{LLM_TIMEOUT_SECS_ENV} must be a whole number of seconds"))?,
            None => DEFAULT_LLM_TIMEOUT_SECS,
        };
        if timeout_secs == 0 {
            bail!("{LLM_TIMEOUT_SECS_ENV} must be greater than zero");
        }

        let max_tokens = match read(LLM_MAX_TOKENS_ENV) {
            Some(raw) => raw
                .parse::<u32>()
                .with_context(|| format!("{LLM_MAX_TOKENS_ENV} must be a positive integer"))?,
            None => DEFAULT_LLM_MAX_TOKENS,
        };

        let temperature = match read(LLM_TEMPERATURE_ENV) {
            Some(raw) => raw
                .parse::<f32>()
                .with_context(|| format!("{LLM_TEMPERATURE_ENV} must be a number"))?,
            None => DEFAULT_LLM_TEMPERATURE,
        };
        if !(0.0..=2.0).contains(&temperature) {
            bail!("{LLM_TEMPERATURE_ENV} must be between 0 and 2");
        }

        Ok(Self {
            base_url,
            api_key,
            model,
            max_tokens,
            temperature,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

fn normalize_http_base_url(raw: &str) -> String {
    let mut base = raw.trim().to_string();
    if !base.starts_with("http://") && !base.starts_with("https://") {
        base = format!("https://{base}");
    }
    let base = base.trim_end_matches('/');
    base.strip_suffix("/v1").unwrap_or(base).to_string()
}

fn resolve_user_path(path: &Path, home_dir: &Path, cwd: &Path) -> Result<PathBuf> {
    let expanded = expand_tilde(path, home_dir)?;
    let resolved = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };

    Ok(normalize_lexical(&resolved))
}

fn expand_tilde(path: &Path, home_dir: &Path) -> Result<PathBuf> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => {
            let mut expanded = home_dir.to_path_buf();
            for component in components {
                expanded.push(component.as_os_str());
            }
            Ok(expanded)
        }
        Some(Component::Normal(first))
            if first
                .to_str()
                .is_some_and(|segment| segment.starts_with('~')) =>
        {
            bail!(
                "unsupported home expansion syntax (only `~` and `~/...` are supported): {}",
                path.display()
            )
        }
        _ => Ok(path.to_path_buf()),
    }
}

fn normalize_lexical(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component.as_os_str());
                }
            }
            _ => normalized.push(component.as_os_str()),
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration;

    use super::{LlmSettings, ResolverSettings, resolve_runtime_paths};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<BTreeMap<_, _>>();
        move |name| values.get(name).cloned()
    }

    #[test]
    fn defaults_live_under_quarry_state_dir() {
        let paths = resolve_runtime_paths(
            Path::new("/home/tester"),
            Path::new("/work/repo"),
            None,
            None,
        )
        .expect("paths should resolve");

        assert_eq!(paths.home_dir, Path::new("/home/tester"));
        assert_eq!(paths.cwd, Path::new("/work/repo"));
        assert_eq!(
            paths.database_path,
            Path::new("/home/tester/.quarry/warehouse.sqlite")
        );
        assert_eq!(
            paths.catalog_path,
            Path::new("/home/tester/.quarry/contexts.json")
        );
    }

    #[test]
    fn expands_tilde_and_relative_overrides() {
        let paths = resolve_runtime_paths(
            Path::new("/home/tester"),
            Path::new("/work/repo"),
            Some(Path::new("~/data/erp.sqlite")),
            Some(Path::new("./config/../config/contexts.json")),
        )
        .expect("overrides should resolve");

        assert_eq!(paths.database_path, Path::new("/home/tester/data/erp.sqlite"));
        assert_eq!(
            paths.catalog_path,
            Path::new("/work/repo/config/contexts.json")
        );
    }

    #[test]
    fn rejects_non_absolute_home_dir() {
        let err = resolve_runtime_paths(Path::new("home/tester"), Path::new("/work/repo"), None, None)
            .expect_err("relative home dir must fail");

        assert!(
            err.to_string().contains("home_dir must be absolute"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn rejects_tilde_username_syntax() {
        let err = resolve_runtime_paths(
            Path::new("/home/tester"),
            Path::new("/work/repo"),
            Some(Path::new("~someone/erp.sqlite")),
            None,
        )
        .expect_err("~username syntax must fail");

        assert!(
            err.to_string()
                .contains("unsupported home expansion syntax"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn llm_settings_require_api_key() {
        let err = LlmSettings::from_lookup(lookup(&[])).expect_err("missing key must fail");
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn llm_settings_apply_defaults_and_overrides() {
        let settings = LlmSettings::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test-123456789"),
            ("OPENAI_BASE_URL", "llm.internal.example/v1/"),
            ("QUARRY_LLM_TIMEOUT_SECS", "15"),
        ]))
        .expect("settings should resolve");

        assert_eq!(settings.base_url, "https://llm.internal.example");
        assert_eq!(settings.model, "gpt-4o-mini");
        assert_eq!(settings.timeout, Duration::from_secs(15));
        assert!(!format!("{settings:?}").contains("sk-test-123456789"));
    }

    #[test]
    fn resolver_settings_enforce_bounds() {
        assert!(ResolverSettings::default().validate().is_ok());

        let zero_cap = ResolverSettings {
            row_cap: 0,
            ..ResolverSettings::default()
        };
        assert!(zero_cap.validate().is_err());

        let runaway = ResolverSettings {
            max_retries: 50,
            ..ResolverSettings::default()
        };
        assert!(runaway.validate().is_err());
    }
}
