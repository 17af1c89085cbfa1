//! Candidate detection: page geometry in, table and figure candidates out.
//!
//! Detection is pure and deterministic for a given page, so results are
//! cached per `(document_id, page_num)`. Callers must use a fresh document
//! id when a document's content changes.

pub mod types;
pub mod table_detect;
pub mod figure_detect;

pub use types::*;
pub use table_detect::detect_tables;
pub use figure_detect::detect_figures;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::SharedCache;
use crate::pipeline_config::{DetectionConfig, PipelineConfig};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("Malformed geometry on page {page}: {reason}")]
    MalformedGeometry { page: u32, reason: String },

    #[error("Page {page} appears more than once in the document")]
    DuplicatePage { page: u32 },
}

impl PageGeometry {
    /// Reject geometry the detectors cannot reason about.
    pub fn validate(&self) -> Result<(), DetectionError> {
        let malformed = |reason: String| DetectionError::MalformedGeometry {
            page: self.page_num,
            reason,
        };

        if self.page_num == 0 {
            return Err(malformed("page numbers are 1-based".into()));
        }
        if let Some((i, _)) = self
            .spans
            .iter()
            .enumerate()
            .find(|(_, s)| !s.bbox.is_well_formed())
        {
            return Err(malformed(format!("span {i} has a non-finite or negative bounding box")));
        }
        for (i, op) in self.operations.iter().enumerate() {
            if let PaintOperation::Transform { matrix } = op {
                if matrix.iter().any(|v| !v.is_finite()) {
                    return Err(malformed(format!("operation {i} has a non-finite matrix")));
                }
            }
        }
        Ok(())
    }
}

/// Run both detectors on one page without caching.
pub fn detect(page: &PageGeometry, config: &DetectionConfig) -> Result<PageDetection, DetectionError> {
    page.validate()?;
    Ok(PageDetection {
        page_num: page.page_num,
        tables: detect_tables(page.page_num, &page.spans, config),
        figures: detect_figures(page.page_num, &page.operations, &page.spans, config),
    })
}

// ═══════════════════════════════════════════════════════════
// Cached detection
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub document_id: String,
    pub page_num: u32,
}

/// All candidates of a document, in page order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentDetection {
    pub tables: Vec<TableCandidate>,
    pub figures: Vec<FigureCandidate>,
    /// Pages skipped because their geometry was malformed.
    pub skipped_pages: Vec<u32>,
}

pub struct PageDetector {
    config: DetectionConfig,
    cache: SharedCache<PageKey, PageDetection>,
}

impl PageDetector {
    pub fn new(config: DetectionConfig, cache_capacity: usize) -> Self {
        Self {
            config,
            cache: SharedCache::new(cache_capacity),
        }
    }

    pub fn from_pipeline_config(config: &PipelineConfig) -> Self {
        Self::new(config.detection.clone(), config.page_cache_capacity)
    }

    /// Detect one page, serving repeated requests from the cache.
    pub fn detect_page(
        &self,
        document_id: &str,
        page: &PageGeometry,
    ) -> Result<PageDetection, DetectionError> {
        let key = PageKey {
            document_id: document_id.to_string(),
            page_num: page.page_num,
        };
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let detection = detect(page, &self.config)?;
        self.cache.set(key, detection.clone());
        Ok(detection)
    }

    /// Detect every page. Malformed and repeated pages are skipped and reported.
    pub fn detect_document(&self, document_id: &str, pages: &[PageGeometry]) -> DocumentDetection {
        let mut out = DocumentDetection::default();
        let mut seen = HashSet::new();

        for page in pages {
            // A repeated page number would alias the first page's cache entry
            let result = if seen.insert(page.page_num) {
                self.detect_page(document_id, page)
            } else {
                Err(DetectionError::DuplicatePage {
                    page: page.page_num,
                })
            };
            match result {
                Ok(detection) => {
                    out.tables.extend(detection.tables);
                    out.figures.extend(detection.figures);
                }
                Err(e) => {
                    tracing::warn!(
                        document_id,
                        page = page.page_num,
                        error = %e,
                        "Skipping page"
                    );
                    out.skipped_pages.push(page.page_num);
                }
            }
        }

        tracing::info!(
            document_id,
            pages = pages.len(),
            tables = out.tables.len(),
            figures = out.figures.len(),
            skipped = out.skipped_pages.len(),
            "Document detection complete"
        );
        out
    }

    pub fn cache(&self) -> &SharedCache<PageKey, PageDetection> {
        &self.cache
    }
}
