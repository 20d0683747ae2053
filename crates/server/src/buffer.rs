#![forbid(unsafe_code)]

//! Context buffer accumulation and the dispatch trigger.
//!
//! Change items flow in from the pollers; a dispatch fires when any drift
//! metric exceeds its threshold or when the buffered character total reaches
//! the configured dispatch threshold.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::ServerError;
use crate::watcher::ChangeItem;
use engram_core::Config;
use engram_fold::{compute_budget, scan_drift};
use engram_storage::StateStore;

pub struct ContextBuffer<'a> {
    config: &'a Config,
    project_root: PathBuf,
}

/// Buffer fill information for status display.
#[derive(Clone, Debug)]
pub struct FillInfo {
    pub item_count: usize,
    pub buffer_chars: i64,
    pub dispatch_threshold: usize,
    pub budget: usize,
    pub living_docs_chars: usize,
    pub fill_pct: f64,
}

impl<'a> ContextBuffer<'a> {
    pub fn new(config: &'a Config, project_root: &Path) -> Self {
        Self {
            config,
            project_root: project_root.to_path_buf(),
        }
    }

    /// Add a change item unless its path is already buffered.
    /// Returns whether the item was added.
    pub fn add_item(
        &self,
        store: &mut StateStore,
        item: &ChangeItem,
    ) -> Result<bool, ServerError> {
        if store.buffer_contains(&item.path)? {
            debug!(path = %item.path, "skipping duplicate buffer item");
            return Ok(false);
        }
        store.buffer_append(
            &item.path,
            item.kind,
            item.chars,
            item.date.as_deref(),
            None,
            item.metadata.as_deref(),
        )?;
        info!(path = %item.path, kind = item.kind.as_str(), chars = item.chars, "buffer +=");
        Ok(true)
    }

    /// Whether a dispatch is warranted right now; returns the reason.
    /// Drift triggers take precedence over buffer fill.
    pub fn should_dispatch(&self, store: &StateStore) -> Result<Option<String>, ServerError> {
        let fold_from = store.fold_from()?;
        let report = scan_drift(self.config, &self.project_root, fold_from.as_deref());
        if let Some(chunk_type) = report.triggered(self.config) {
            return Ok(Some(format!("drift:{}", chunk_type.as_str())));
        }

        let threshold = self.config.budget.dispatch_threshold_chars;
        let buffer_chars = store.buffer_chars()?;
        if threshold > 0 && buffer_chars >= threshold as i64 {
            return Ok(Some("buffer_full".to_string()));
        }
        Ok(None)
    }

    pub fn fill_info(&self, store: &StateStore) -> Result<FillInfo, ServerError> {
        let doc_paths = self.config.doc_paths(&self.project_root);
        let (budget, living_docs_chars) = compute_budget(self.config, &doc_paths);
        let buffer_chars = store.buffer_chars()?;
        let threshold = self.config.budget.dispatch_threshold_chars;
        let fill_pct = if threshold > 0 {
            ((buffer_chars as f64 / threshold as f64) * 100.0).min(100.0)
        } else {
            0.0
        };
        Ok(FillInfo {
            item_count: store.buffer_items()?.len(),
            buffer_chars,
            dispatch_threshold: threshold,
            budget,
            living_docs_chars,
            fill_pct,
        })
    }
}
