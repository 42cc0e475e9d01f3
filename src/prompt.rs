//! Resolves `__TOKEN__` placeholders in prompt templates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::wildcard::{SharedManager, WildcardFactory};

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"__([A-Z]+(?:_[A-Z]+)*)__").expect("token pattern is valid"));

/// How heavily a wildcard value has been used relative to its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageLevel {
    Unused,
    Low,
    Medium,
    High,
}

impl UsageLevel {
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage <= 0.0 {
            UsageLevel::Unused
        } else if percentage < 50.0 {
            UsageLevel::Low
        } else if percentage < 90.0 {
            UsageLevel::Medium
        } else {
            UsageLevel::High
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemUsage {
    pub count: u64,
    pub percentage: f64,
    pub status: UsageLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WildcardUsage {
    pub total_uses: u64,
    pub items: BTreeMap<String, ItemUsage>,
    pub least_used: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateValidation {
    pub valid: bool,
    pub missing: Vec<String>,
    pub available: Vec<String>,
    pub total_wildcards: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedPrompt {
    pub index: usize,
    pub prompt: String,
    pub wildcard_values: BTreeMap<String, String>,
}

/// Builds concrete prompts from a config's base prompt.
#[derive(Debug)]
pub struct PromptBuilder {
    wildcard_dir: PathBuf,
    factory: Arc<WildcardFactory>,
}

impl PromptBuilder {
    pub fn new(wildcard_dir: impl Into<PathBuf>, factory: Arc<WildcardFactory>) -> Self {
        Self {
            wildcard_dir: wildcard_dir.into(),
            factory,
        }
    }

    pub fn wildcard_dir(&self) -> &Path {
        &self.wildcard_dir
    }

    pub fn factory(&self) -> &Arc<WildcardFactory> {
        &self.factory
    }

    /// Distinct tokens of `template` in order of first appearance.
    pub fn extract_tokens(template: &str) -> Vec<String> {
        let mut tokens: Vec<String> = Vec::new();
        for capture in TOKEN_RE.captures_iter(template) {
            let token = &capture[1];
            if !tokens.iter().any(|t| t == token) {
                tokens.push(token.to_string());
            }
        }
        tokens
    }

    pub fn wildcard_path(&self, token: &str) -> PathBuf {
        self.wildcard_dir.join(format!("{}.txt", token.to_lowercase()))
    }

    fn manager(&self, token: &str) -> SharedManager {
        self.factory.get_manager(self.wildcard_path(token))
    }

    /// Draw one value per distinct token and substitute every occurrence.
    pub fn build_prompt(&self, config: &GenerationConfig) -> String {
        self.build_from_template(&config.prompt_settings.base_prompt)
    }

    pub fn build_from_template(&self, template: &str) -> String {
        let mut prompt = template.to_string();
        for token in Self::extract_tokens(template) {
            let value = self.manager(&token).lock().get_next();
            debug!(token = %token, value = %value, "Resolved wildcard");
            prompt = prompt.replace(&placeholder(&token), &value);
        }
        prompt
    }

    pub fn build_prompt_batch(&self, config: &GenerationConfig, count: usize) -> Vec<String> {
        (0..count).map(|_| self.build_prompt(config)).collect()
    }

    /// `count` prompts from upcoming wildcard values, without consuming any.
    pub fn preview_prompts(&self, config: &GenerationConfig, count: usize) -> Vec<String> {
        self.export_prompt_list(config, count)
            .into_iter()
            .map(|exported| exported.prompt)
            .collect()
    }

    /// Like [`preview_prompts`](Self::preview_prompts), with the value chosen per token.
    pub fn export_prompt_list(&self, config: &GenerationConfig, count: usize) -> Vec<ExportedPrompt> {
        let template = &config.prompt_settings.base_prompt;
        let previews: Vec<(String, Vec<String>)> = Self::extract_tokens(template)
            .into_iter()
            .map(|token| {
                let values = self.manager(&token).lock().get_preview(count);
                (token, values)
            })
            .collect();

        (0..count)
            .map(|index| {
                let mut prompt = template.clone();
                let mut wildcard_values = BTreeMap::new();
                for (token, values) in &previews {
                    let value = values
                        .get(index)
                        .or_else(|| values.first())
                        .cloned()
                        .unwrap_or_else(|| placeholder(token));
                    prompt = prompt.replace(&placeholder(token), &value);
                    wildcard_values.insert(token.clone(), value);
                }
                ExportedPrompt {
                    index,
                    prompt,
                    wildcard_values,
                }
            })
            .collect()
    }

    pub fn get_wildcard_usage_info(&self, config: &GenerationConfig) -> BTreeMap<String, WildcardUsage> {
        Self::extract_tokens(&config.prompt_settings.base_prompt)
            .into_iter()
            .map(|token| {
                let manager = self.manager(&token);
                let manager = manager.lock();
                let stats = manager.get_usage_stats();
                let total_uses: u64 = stats.values().sum();

                let items = stats
                    .iter()
                    .map(|(item, count)| {
                        let percentage = manager.get_usage_percentage(item);
                        let usage = ItemUsage {
                            count: *count,
                            percentage,
                            status: UsageLevel::from_percentage(percentage),
                        };
                        (item.clone(), usage)
                    })
                    .collect();

                let least_used = manager
                    .get_least_used_items(5)
                    .into_iter()
                    .map(|(item, _)| item)
                    .collect();

                (
                    token,
                    WildcardUsage {
                        total_uses,
                        items,
                        least_used,
                    },
                )
            })
            .collect()
    }

    pub fn validate_template(&self, template: &str) -> TemplateValidation {
        let tokens = Self::extract_tokens(template);
        let (available, missing): (Vec<String>, Vec<String>) = tokens
            .iter()
            .cloned()
            .partition(|token| self.wildcard_path(token).is_file());

        TemplateValidation {
            valid: missing.is_empty(),
            missing,
            available,
            total_wildcards: tokens.len(),
        }
    }

    pub fn reset_wildcards(&self, config: &GenerationConfig) {
        for token in Self::extract_tokens(&config.prompt_settings.base_prompt) {
            self.manager(&token).lock().reset();
        }
    }
}

fn placeholder(token: &str) -> String {
    format!("__{}__", token)
}
