use std::time::Duration;

use anyhow::{Context, Result};
use muster_types::ChannelCatalog;

use crate::retry::RetryPolicy;

/// Hard cap on a single initial load, regardless of configuration.
pub const MAX_LOAD_LIMIT: u32 = 200;

const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    "pdf", "png", "jpg", "jpeg", "gif", "webp", "txt", "csv", "doc", "docx", "xls", "xlsx",
    "ppt", "pptx",
];

/// Tunables for a chat session.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub initial_load_limit: u32,
    pub max_cached_messages: usize,
    /// Gap after which a same-author message gets a fresh header.
    pub header_gap: Duration,
    pub max_attachment_bytes: usize,
    /// Lower-case extensions without the dot.
    pub allowed_extensions: Vec<String>,
    /// How long a reaction may wait for its host message.
    pub orphan_window: Duration,
    pub retry: RetryPolicy,
    pub catalog: ChannelCatalog,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            initial_load_limit: 50,
            max_cached_messages: 500,
            header_gap: Duration::from_secs(300),
            max_attachment_bytes: 10 * 1024 * 1024,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            orphan_window: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            catalog: ChannelCatalog::default(),
        }
    }
}

impl ChatConfig {
    /// Read `MUSTER_*` variables from the process environment, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let initial_load_limit: u32 = parse_or(&lookup, "MUSTER_INITIAL_LOAD_LIMIT", defaults.initial_load_limit)?;
        let max_cached_messages = parse_or(&lookup, "MUSTER_MAX_CACHED_MESSAGES", defaults.max_cached_messages)?;
        let header_gap_secs = parse_or(&lookup, "MUSTER_HEADER_GAP_SECS", defaults.header_gap.as_secs())?;
        let max_attachment_bytes = parse_or(&lookup, "MUSTER_MAX_ATTACHMENT_BYTES", defaults.max_attachment_bytes)?;
        let orphan_window_secs = parse_or(&lookup, "MUSTER_ORPHAN_WINDOW_SECS", defaults.orphan_window.as_secs())?;
        let retry_base_ms = parse_or(&lookup, "MUSTER_RETRY_BASE_MS", 500u64)?;
        let retry_max_ms = parse_or(&lookup, "MUSTER_RETRY_MAX_MS", 30_000u64)?;

        let allowed_extensions = match lookup("MUSTER_ALLOWED_EXTENSIONS") {
            Some(list) => list
                .split(',')
                .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            None => defaults.allowed_extensions,
        };

        Ok(Self {
            initial_load_limit: initial_load_limit.clamp(1, MAX_LOAD_LIMIT),
            max_cached_messages: max_cached_messages.max(1),
            header_gap: Duration::from_secs(header_gap_secs),
            max_attachment_bytes,
            allowed_extensions,
            orphan_window: Duration::from_secs(orphan_window_secs),
            retry: RetryPolicy::new(retry_base_ms, retry_max_ms),
            catalog: defaults.catalog,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got '{raw}'")),
        None => Ok(default),
    }
}
