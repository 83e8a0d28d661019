//! Configuração do dialectic carregada a partir de `dialectic.toml`.
//!
//! A struct [`DialecticConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `ANTHROPIC_API_KEY` tem precedência sobre o arquivo.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::{ModelCatalog, ModelInfo};
use crate::state_machine::RetryConfig;
use crate::worker::WorkerSettings;

pub const CONFIG_FILE: &str = "dialectic.toml";

/// Configuração de nível superior carregada de `dialectic.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct DialecticConfig {
    /// Chave da API Anthropic. Vazia significa modo offline (modelo stub).
    #[serde(default)]
    pub api_key: String,

    /// Máximo de tentativas antes de marcar um job como `retry_loop_failed`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Máximo de continuações por job EXECUTE truncado.
    #[serde(default = "default_max_continuations")]
    pub max_continuations: u32,

    /// Número de workers concorrentes.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,

    #[serde(default = "default_storage_timeout_secs")]
    pub storage_timeout_secs: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Segundos após os quais um job em `processing` é considerado órfão.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,

    /// Diretório raiz dos artefatos gerados.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    #[serde(default = "default_storage_bucket")]
    pub storage_bucket: String,

    /// Snapshot JSON do store de jobs, sessões e recursos.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Receitas próprias; sem valor usa as receitas embutidas.
    #[serde(default)]
    pub recipes_path: Option<PathBuf>,

    /// Filtro de log no formato do `EnvFilter`.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Catálogo de modelos; vazio usa o catálogo padrão.
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

// Valor padrão para tentativas máximas: 3.
fn default_max_retries() -> u32 {
    3
}

// Valor padrão para o atraso base: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_continuations() -> u32 {
    5
}

fn default_workers() -> usize {
    4
}

fn default_model_timeout_secs() -> u64 {
    120
}

fn default_storage_timeout_secs() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_claim_lease_secs() -> u64 {
    600
}

fn default_storage_root() -> PathBuf {
    PathBuf::from(".dialectic/storage")
}

fn default_storage_bucket() -> String {
    "dialectic".to_string()
}

fn default_state_path() -> PathBuf {
    PathBuf::from(".dialectic/state.json")
}

fn default_log_filter() -> String {
    "dialectic=info".to_string()
}

impl Default for DialecticConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_continuations: default_max_continuations(),
            workers: default_workers(),
            model_timeout_secs: default_model_timeout_secs(),
            storage_timeout_secs: default_storage_timeout_secs(),
            max_tokens: default_max_tokens(),
            claim_lease_secs: default_claim_lease_secs(),
            storage_root: default_storage_root(),
            storage_bucket: default_storage_bucket(),
            state_path: default_state_path(),
            recipes_path: None,
            log_filter: default_log_filter(),
            models: Vec::new(),
        }
    }
}

impl DialecticConfig {
    /// Carrega a configuração de `dialectic.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<DialecticConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        config
            .validate()
            .with_context(|| format!("invalid {}", path.display()))?;
        Ok(config)
    }

    /// Rejeita valores que o planejador recusaria de qualquer forma.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            bail!("max_retries must be at least 1");
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            retry: self.retry_config(),
            max_continuations: self.max_continuations,
            model_timeout: Duration::from_secs(self.model_timeout_secs),
            max_tokens: self.max_tokens,
            claim_lease: Duration::from_secs(self.claim_lease_secs),
        }
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }

    pub fn catalog(&self) -> ModelCatalog {
        if self.models.is_empty() {
            ModelCatalog::default()
        } else {
            ModelCatalog::new(self.models.clone())
        }
    }
}
