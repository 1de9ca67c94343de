use serde::{Deserialize, Serialize};
use std::env;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Local `Added`/`Modified`/`Deleted` entities keep their values.
    #[default]
    PreserveChanges,
    OverwriteChanges,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FetchStrategy {
    #[default]
    FromServer,
    FromLocalCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    pub merge_strategy: MergeStrategy,
    pub fetch_strategy: FetchStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOptions {
    pub allow_concurrent_saves: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOptions {
    pub validate_on_attach: bool,
    pub validate_on_save: bool,
    pub validate_on_query: bool,
    pub validate_on_property_change: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            validate_on_attach: true,
            validate_on_save: true,
            validate_on_query: false,
            validate_on_property_change: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalQueryComparisonOptions {
    pub is_case_sensitive: bool,
    /// Trailing whitespace is ignored by `eq`/`ne` string comparisons.
    pub uses_sql92_compliant_string_comparison: bool,
}

impl Default for LocalQueryComparisonOptions {
    fn default() -> Self {
        Self {
            is_case_sensitive: false,
            uses_sql92_compliant_string_comparison: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    pub service_name: String,
    pub has_server_metadata: bool,
    pub query_options: QueryOptions,
    pub save_options: SaveOptions,
    pub validation_options: ValidationOptions,
    pub local_query_comparison: LocalQueryComparisonOptions,
    pub expression_cache_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            has_server_metadata: true,
            query_options: QueryOptions::default(),
            save_options: SaveOptions::default(),
            validation_options: ValidationOptions::default(),
            local_query_comparison: LocalQueryComparisonOptions::default(),
            expression_cache_capacity: 256,
        }
    }
}

impl ManagerConfig {
    pub fn from_env() -> AppResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            service_name: env::var("ENTITY_CACHE_SERVICE_NAME")
                .unwrap_or_else(|_| defaults.service_name.clone()),
            query_options: QueryOptions {
                merge_strategy: match env::var("ENTITY_CACHE_MERGE_STRATEGY") {
                    Ok(v) => parse_merge_strategy(&v)?,
                    Err(_) => defaults.query_options.merge_strategy,
                },
                fetch_strategy: match env::var("ENTITY_CACHE_FETCH_STRATEGY") {
                    Ok(v) => parse_fetch_strategy(&v)?,
                    Err(_) => defaults.query_options.fetch_strategy,
                },
            },
            save_options: SaveOptions {
                allow_concurrent_saves: env_flag(
                    "ENTITY_CACHE_ALLOW_CONCURRENT_SAVES",
                    defaults.save_options.allow_concurrent_saves,
                )?,
            },
            validation_options: ValidationOptions {
                validate_on_save: env_flag(
                    "ENTITY_CACHE_VALIDATE_ON_SAVE",
                    defaults.validation_options.validate_on_save,
                )?,
                ..defaults.validation_options
            },
            local_query_comparison: LocalQueryComparisonOptions {
                is_case_sensitive: env_flag(
                    "ENTITY_CACHE_CASE_SENSITIVE_QUERIES",
                    defaults.local_query_comparison.is_case_sensitive,
                )?,
                ..defaults.local_query_comparison
            },
            expression_cache_capacity: match env::var("ENTITY_CACHE_EXPRESSION_CACHE_CAPACITY") {
                Ok(v) => v.trim().parse().map_err(|_| {
                    AppError::Configuration(format!(
                        "ENTITY_CACHE_EXPRESSION_CACHE_CAPACITY must be a number, got '{}'",
                        v
                    ))
                })?,
                Err(_) => defaults.expression_cache_capacity,
            },
            ..defaults
        })
    }

    pub fn with_service_name(mut self, service_name: &str) -> Self {
        self.service_name = service_name.to_string();
        self
    }
}

pub fn parse_merge_strategy(value: &str) -> AppResult<MergeStrategy> {
    match value.trim().to_lowercase().as_str() {
        "preservechanges" | "preserve_changes" | "preserve" => Ok(MergeStrategy::PreserveChanges),
        "overwritechanges" | "overwrite_changes" | "overwrite" => Ok(MergeStrategy::OverwriteChanges),
        other => Err(AppError::Configuration(format!(
            "Unknown merge strategy '{}'",
            other
        ))),
    }
}

pub fn parse_fetch_strategy(value: &str) -> AppResult<FetchStrategy> {
    match value.trim().to_lowercase().as_str() {
        "fromserver" | "from_server" | "server" => Ok(FetchStrategy::FromServer),
        "fromlocalcache" | "from_local_cache" | "local" => Ok(FetchStrategy::FromLocalCache),
        other => Err(AppError::Configuration(format!(
            "Unknown fetch strategy '{}'",
            other
        ))),
    }
}

fn env_flag(name: &str, default: bool) -> AppResult<bool> {
    match env::var(name) {
        Ok(v) => match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(AppError::Configuration(format!(
                "{} must be a boolean, got '{}'",
                name, v
            ))),
        },
        Err(_) => Ok(default),
    }
}
