pub mod cache;
pub mod config;
pub mod pipeline;
pub mod pipeline_config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use config::{ConfigError, Settings};
use pipeline::detection::{PageDetector, PageGeometry};
use pipeline::enhancement::{
    CancellationSignal, EnhancementError, HttpAgentBackend, Orchestrator, PipelineContext,
};

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Usage: {} <document.json>", config::APP_NAME)]
    Usage,

    #[error("Cannot read {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid document {path}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Enhancement(#[from] EnhancementError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Cannot serialize output: {0}")]
    Output(#[from] serde_json::Error),
}

/// Page geometry of one document, as handed over by the geometry provider.
#[derive(Debug, Deserialize)]
pub struct DocumentInput {
    #[serde(default)]
    pub document_id: Option<String>,
    pub pages: Vec<PageGeometry>,
}

/// Detect candidates in the document named by the first argument, enhance
/// them through the agent service and print the pipeline output as JSON.
pub fn run() -> Result<(), RunError> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .ok_or(RunError::Usage)?;
    let settings = Settings::from_env()?;
    let document = load_document(&path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(process_document(&settings, document))?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn load_document(path: &Path) -> Result<DocumentInput, RunError> {
    let raw = std::fs::read_to_string(path).map_err(|source| RunError::Input {
        path: path.to_path_buf(),
        source,
    })?;
    let mut document: DocumentInput =
        serde_json::from_str(&raw).map_err(|source| RunError::Document {
            path: path.to_path_buf(),
            source,
        })?;
    if document.document_id.is_none() {
        document.document_id = path.file_stem().map(|s| s.to_string_lossy().into_owned());
    }
    Ok(document)
}

async fn process_document(
    settings: &Settings,
    document: DocumentInput,
) -> Result<pipeline::enhancement::PipelineOutput, RunError> {
    let document_id = document.document_id.unwrap_or_else(|| "document".to_string());
    let detector = PageDetector::from_pipeline_config(&settings.pipeline);
    let detection = detector.detect_document(&document_id, &document.pages);

    let mut backend =
        HttpAgentBackend::new(&settings.agent_url, settings.pipeline.call_timeout())?;
    if let Some(url) = &settings.fallback_url {
        backend = backend.with_fallback(url);
    }
    if let Some(key) = &settings.api_key {
        backend = backend.with_api_key(key);
    }

    let ctx = PipelineContext::new(settings.pipeline.clone(), Arc::new(backend));
    let orchestrator = Orchestrator::new(ctx)?;

    // Ctrl-C stops dispatching new agent calls; calls in flight finish
    let cancel = CancellationSignal::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling pending agent calls");
            on_signal.cancel();
        }
    });

    let output = orchestrator
        .process_extracted_data_with_cancel(&detection.figures, &detection.tables, &cancel)
        .await?;

    for snapshot in orchestrator.breakers().snapshots() {
        tracing::debug!(
            agent = %snapshot.agent,
            state = snapshot.state.as_str(),
            failures = snapshot.failure_count,
            "Circuit status"
        );
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn document_id_defaults_to_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trial-42.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"pages": [{{"page_num": 1}}]}}"#).unwrap();

        let document = load_document(&path).unwrap();
        assert_eq!(document.document_id.as_deref(), Some("trial-42"));
        assert_eq!(document.pages.len(), 1);
    }

    #[test]
    fn explicit_document_id_is_kept() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"document_id": "nct-001", "pages": []}}"#).unwrap();
        let document = load_document(file.path()).unwrap();
        assert_eq!(document.document_id.as_deref(), Some("nct-001"));
    }

    #[test]
    fn malformed_document_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[1, 2, 3]").unwrap();
        assert!(matches!(
            load_document(file.path()),
            Err(RunError::Document { .. })
        ));
    }

    #[tokio::test]
    async fn document_without_candidates_needs_no_agents() {
        let settings = Settings::default();
        let document = DocumentInput {
            document_id: Some("empty".into()),
            pages: vec![PageGeometry {
                page_num: 1,
                ..Default::default()
            }],
        };
        let output = process_document(&settings, document).await.unwrap();
        assert!(output.enhanced_tables.is_empty());
        assert!(output.enhanced_figures.is_empty());
        assert_eq!(output.pipeline_stats.agents_invoked, 0);
    }
}
