//! On-disk TOML configuration.
//!
//! Cascade: a `.affilens.toml` in the working directory overrides the
//! platform config (`<config_dir>/affilens/config.toml`); both override
//! built-in defaults. All fields are optional so partial configs work.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::rate_limit::ServiceLimiters;
use crate::{Config, NormalizerConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub llm: Option<LlmConfig>,
    pub api_keys: Option<ApiKeysConfig>,
    pub pipeline: Option<PipelineConfig>,
    pub normalizer: Option<NormalizerFileConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_in_flight: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiKeysConfig {
    pub s2_api_key: Option<String>,
    pub openalex_mailto: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_papers: Option<usize>,
    pub num_workers: Option<usize>,
    pub http_timeout_secs: Option<u64>,
    pub fetch_retries: Option<u32>,
    pub max_pages: Option<usize>,
    pub max_chars: Option<usize>,
    pub cache_dir: Option<String>,
    pub output_dir: Option<String>,
    pub kb_path: Option<String>,
    pub sources: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizerFileConfig {
    pub tau_low: Option<f64>,
    pub tau_high: Option<f64>,
    pub top_k: Option<usize>,
}

/// Platform config path: `<config_dir>/affilens/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("affilens").join("config.toml"))
}

/// Load config by cascading CWD `.affilens.toml` over platform config.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(&PathBuf::from(".affilens.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &PathBuf) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    toml::from_str(&content).ok()
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    fn pick<T: Clone>(
        overlay: Option<&T>,
        base: Option<&T>,
    ) -> Option<T> {
        overlay.or(base).cloned()
    }

    let (bl, ol) = (base.llm.unwrap_or_default(), overlay.llm.unwrap_or_default());
    let (bk, ok) = (
        base.api_keys.unwrap_or_default(),
        overlay.api_keys.unwrap_or_default(),
    );
    let (bp, op) = (
        base.pipeline.unwrap_or_default(),
        overlay.pipeline.unwrap_or_default(),
    );
    let (bn, on) = (
        base.normalizer.unwrap_or_default(),
        overlay.normalizer.unwrap_or_default(),
    );

    ConfigFile {
        llm: Some(LlmConfig {
            model: pick(ol.model.as_ref(), bl.model.as_ref()),
            api_key: pick(ol.api_key.as_ref(), bl.api_key.as_ref()),
            base_url: pick(ol.base_url.as_ref(), bl.base_url.as_ref()),
            max_in_flight: pick(ol.max_in_flight.as_ref(), bl.max_in_flight.as_ref()),
        }),
        api_keys: Some(ApiKeysConfig {
            s2_api_key: pick(ok.s2_api_key.as_ref(), bk.s2_api_key.as_ref()),
            openalex_mailto: pick(ok.openalex_mailto.as_ref(), bk.openalex_mailto.as_ref()),
        }),
        pipeline: Some(PipelineConfig {
            max_papers: pick(op.max_papers.as_ref(), bp.max_papers.as_ref()),
            num_workers: pick(op.num_workers.as_ref(), bp.num_workers.as_ref()),
            http_timeout_secs: pick(op.http_timeout_secs.as_ref(), bp.http_timeout_secs.as_ref()),
            fetch_retries: pick(op.fetch_retries.as_ref(), bp.fetch_retries.as_ref()),
            max_pages: pick(op.max_pages.as_ref(), bp.max_pages.as_ref()),
            max_chars: pick(op.max_chars.as_ref(), bp.max_chars.as_ref()),
            cache_dir: pick(op.cache_dir.as_ref(), bp.cache_dir.as_ref()),
            output_dir: pick(op.output_dir.as_ref(), bp.output_dir.as_ref()),
            kb_path: pick(op.kb_path.as_ref(), bp.kb_path.as_ref()),
            sources: pick(op.sources.as_ref(), bp.sources.as_ref()),
        }),
        normalizer: Some(NormalizerFileConfig {
            tau_low: pick(on.tau_low.as_ref(), bn.tau_low.as_ref()),
            tau_high: pick(on.tau_high.as_ref(), bn.tau_high.as_ref()),
            top_k: pick(on.top_k.as_ref(), bn.top_k.as_ref()),
        }),
    }
}

impl ConfigFile {
    /// Apply file values over built-in defaults and build the runtime
    /// [`Config`], including rate limiters sized to the available keys.
    pub fn into_config(self) -> Config {
        let mut config = Config::default();

        if let Some(llm) = self.llm {
            if let Some(model) = llm.model {
                config.llm_model = model;
            }
            config.llm_api_key = llm.api_key.or(config.llm_api_key);
            config.llm_base_url = llm.base_url.or(config.llm_base_url);
            if let Some(n) = llm.max_in_flight {
                config.llm_max_in_flight = n.max(1);
            }
        }
        if let Some(keys) = self.api_keys {
            config.s2_api_key = keys.s2_api_key.or(config.s2_api_key);
            config.openalex_mailto = keys.openalex_mailto.or(config.openalex_mailto);
        }
        if let Some(p) = self.pipeline {
            if let Some(v) = p.max_papers {
                config.max_papers = v;
            }
            if let Some(v) = p.num_workers {
                config.num_workers = v.max(1);
            }
            if let Some(v) = p.http_timeout_secs {
                config.http_timeout_secs = v;
            }
            if let Some(v) = p.fetch_retries {
                config.fetch_retries = v;
            }
            if let Some(v) = p.max_pages {
                config.max_pages = v;
            }
            if let Some(v) = p.max_chars {
                config.max_chars = v;
            }
            if let Some(v) = p.cache_dir {
                config.cache_dir = PathBuf::from(v);
            }
            if let Some(v) = p.output_dir {
                config.output_dir = PathBuf::from(v);
            }
            if let Some(v) = p.kb_path {
                config.kb_path = Some(PathBuf::from(v));
            }
            if let Some(v) = p.sources {
                config.sources = v;
            }
        }
        if let Some(n) = self.normalizer {
            let mut nc = NormalizerConfig::default();
            if let Some(v) = n.tau_low {
                nc.tau_low = v;
            }
            if let Some(v) = n.tau_high {
                nc.tau_high = v;
            }
            if let Some(v) = n.top_k {
                nc.top_k = v.max(1);
            }
            config.normalizer = nc;
        }

        config.rate_limiters = Arc::new(ServiceLimiters::new(
            config.s2_api_key.is_some(),
            config.openalex_mailto.is_some(),
        ));
        config
    }
}
