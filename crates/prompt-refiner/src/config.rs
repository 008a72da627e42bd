//! Runtime configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variables (a `.env` file is loaded first by `main`)
//! 2. Values from the optional TOML file passed with `--config`
//! 3. Built-in defaults
//!
//! | Setting               | Env                          | Default                     |
//! |-----------------------|------------------------------|-----------------------------|
//! | primary provider key  | `GOOGLE_API_KEY`             | unset (primary disabled)    |
//! | primary model         | `LLM_MODEL`                  | `gemini-2.5-flash`          |
//! | fallback provider key | `DEEPSEEK_API_KEY`           | unset (fallback disabled)   |
//! | fallback base URL     | `DEEPSEEK_BASE_URL`          | `https://api.deepseek.com`  |
//! | temperatures          | `ANALYZER_TEMPERATURE` etc.  | 0.3 / 0.7 / 0.0             |
//! | step bound            | `REFINER_MAX_STEPS`          | 6                           |
//! | per-call timeout      | `REFINER_CALL_TIMEOUT_SECS`  | 120                         |
//! | checkpoint database   | `POSTGRES_URL`               | unset (in-memory)           |

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::refine::state_machine::MAX_STEPS;

const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
const DEFAULT_DEEPSEEK_MODEL: &str = "deepseek-chat";

const DEFAULT_ANALYZER_TEMPERATURE: f64 = 0.3;
const DEFAULT_GENERATOR_TEMPERATURE: f64 = 0.7;
const DEFAULT_REFLECTOR_TEMPERATURE: f64 = 0.0;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 120;

/// One OpenAI-compatible chat endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderEndpoint {
    /// Short name used in logs and error messages.
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct RefinerConfig {
    /// Preferred backend, used when its endpoint answers at startup.
    pub primary: Option<ProviderEndpoint>,
    pub fallback: Option<ProviderEndpoint>,
    pub analyzer_temperature: f64,
    pub generator_temperature: f64,
    pub reflector_temperature: f64,
    pub max_steps: u32,
    pub call_timeout_secs: u64,
    /// `None` keeps checkpoints and the library in memory.
    pub database_url: Option<String>,
    pub templates_path: PathBuf,
    pub log_dir: PathBuf,
    pub bind_addr: String,
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            primary: None,
            fallback: None,
            analyzer_temperature: DEFAULT_ANALYZER_TEMPERATURE,
            generator_temperature: DEFAULT_GENERATOR_TEMPERATURE,
            reflector_temperature: DEFAULT_REFLECTOR_TEMPERATURE,
            max_steps: MAX_STEPS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            database_url: None,
            templates_path: PathBuf::from("rag/templates.json"),
            log_dir: PathBuf::from("logs"),
            bind_addr: "0.0.0.0:8000".into(),
        }
    }
}

/// Shape of the optional TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub primary: Option<ProviderEndpoint>,
    pub fallback: Option<ProviderEndpoint>,
    pub analyzer_temperature: Option<f64>,
    pub generator_temperature: Option<f64>,
    pub reflector_temperature: Option<f64>,
    pub max_steps: Option<u32>,
    pub call_timeout_secs: Option<u64>,
    pub database_url: Option<String>,
    pub templates_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub bind_addr: Option<String>,
}

impl RefinerConfig {
    /// Resolve defaults, then the file (if any), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let file: FileConfig = toml::from_str(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.merge_file(file);
        }
        config.merge_env();
        Ok(config)
    }

    fn merge_file(&mut self, file: FileConfig) {
        if file.primary.is_some() {
            self.primary = file.primary;
        }
        if file.fallback.is_some() {
            self.fallback = file.fallback;
        }
        if let Some(v) = file.analyzer_temperature {
            self.analyzer_temperature = v;
        }
        if let Some(v) = file.generator_temperature {
            self.generator_temperature = v;
        }
        if let Some(v) = file.reflector_temperature {
            self.reflector_temperature = v;
        }
        if let Some(v) = file.max_steps {
            self.max_steps = v;
        }
        if let Some(v) = file.call_timeout_secs {
            self.call_timeout_secs = v;
        }
        if file.database_url.is_some() {
            self.database_url = file.database_url;
        }
        if let Some(v) = file.templates_path {
            self.templates_path = v;
        }
        if let Some(v) = file.log_dir {
            self.log_dir = v;
        }
        if let Some(v) = file.bind_addr {
            self.bind_addr = v;
        }
    }

    fn merge_env(&mut self) {
        if let Ok(api_key) = env::var("GOOGLE_API_KEY") {
            let base = self.primary.take();
            self.primary = Some(ProviderEndpoint {
                name: "gemini".into(),
                base_url: env::var("GEMINI_BASE_URL").unwrap_or_else(|_| {
                    base.as_ref()
                        .map(|p| p.base_url.clone())
                        .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.into())
                }),
                model: env::var("LLM_MODEL").unwrap_or_else(|_| {
                    base.as_ref()
                        .map(|p| p.model.clone())
                        .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.into())
                }),
                api_key,
            });
        }
        if let Ok(api_key) = env::var("DEEPSEEK_API_KEY") {
            let base = self.fallback.take();
            self.fallback = Some(ProviderEndpoint {
                name: "deepseek".into(),
                base_url: env::var("DEEPSEEK_BASE_URL").unwrap_or_else(|_| {
                    base.as_ref()
                        .map(|p| p.base_url.clone())
                        .unwrap_or_else(|| DEFAULT_DEEPSEEK_BASE_URL.into())
                }),
                model: env::var("DEEPSEEK_MODEL").unwrap_or_else(|_| {
                    base.as_ref()
                        .map(|p| p.model.clone())
                        .unwrap_or_else(|| DEFAULT_DEEPSEEK_MODEL.into())
                }),
                api_key,
            });
        }

        override_parsed("ANALYZER_TEMPERATURE", &mut self.analyzer_temperature);
        override_parsed("GENERATOR_TEMPERATURE", &mut self.generator_temperature);
        override_parsed("REFLECTOR_TEMPERATURE", &mut self.reflector_temperature);
        override_parsed("REFINER_MAX_STEPS", &mut self.max_steps);
        override_parsed("REFINER_CALL_TIMEOUT_SECS", &mut self.call_timeout_secs);

        if let Ok(url) = env::var("POSTGRES_URL") {
            self.database_url = Some(url);
        }
        if let Ok(path) = env::var("REFINER_TEMPLATES") {
            self.templates_path = PathBuf::from(path);
        }
        if let Ok(dir) = env::var("REFINER_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = env::var("REFINER_BIND") {
            self.bind_addr = addr;
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Validate the configuration, returning an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.primary.is_none() && self.fallback.is_none() {
            return Err(
                "no text-generation provider configured (set GOOGLE_API_KEY or DEEPSEEK_API_KEY)"
                    .into(),
            );
        }
        for (name, value) in [
            ("analyzer_temperature", self.analyzer_temperature),
            ("generator_temperature", self.generator_temperature),
            ("reflector_temperature", self.reflector_temperature),
        ] {
            if !(0.0..=2.0).contains(&value) {
                return Err(format!("{name} must be in [0.0, 2.0], got {value}"));
            }
        }
        if self.max_steps == 0 {
            return Err("max_steps must be > 0".into());
        }
        if self.call_timeout_secs == 0 {
            return Err("call_timeout_secs must be > 0".into());
        }
        for endpoint in self.primary.iter().chain(self.fallback.iter()) {
            if endpoint.api_key.is_empty() {
                return Err(format!("{} api_key is empty", endpoint.name));
            }
        }
        Ok(())
    }
}

fn override_parsed<T: FromStr>(var: &str, slot: &mut T) {
    if let Ok(raw) = env::var(var) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(var, value = %raw, "ignoring unparseable override"),
        }
    }
}

/// Check if an OpenAI-compatible endpoint is reachable (GET /models).
pub async fn check_endpoint(url: &str, api_key: Option<&str>) -> bool {
    let models_url = format!("{}/models", url.trim_end_matches('/'));
    let mut request = reqwest::Client::new()
        .get(&models_url)
        .timeout(Duration::from_secs(5));
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    match request.send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}
