use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use extract::{
    DocumentResult, Entity, ExtractionRun, Quote, QualityReport, Relationship, Speaker,
    ThematicConnection, ValidationWarning,
};

/// The per-document JSON artifact.
#[derive(Debug, Serialize)]
pub struct DocumentArtifact<'a> {
    pub document_id: &'a str,
    pub source: &'a str,
    pub quotes: &'a [Quote],
    pub speakers: &'a [Speaker],
    pub entities: &'a [Entity],
    pub relationships: &'a [Relationship],
    pub connections: &'a [ThematicConnection],
    pub quality_report: &'a QualityReport,
    pub warnings: &'a [ValidationWarning],
}

impl<'a> From<&'a DocumentResult> for DocumentArtifact<'a> {
    fn from(result: &'a DocumentResult) -> Self {
        Self {
            document_id: &result.document_id,
            source: &result.source,
            quotes: &result.quotes,
            speakers: &result.speakers,
            entities: &result.entities,
            relationships: &result.relationships,
            connections: &result.connections,
            quality_report: &result.quality_report,
            warnings: &result.warnings,
        }
    }
}

/// Writes `<root>/<run_id>/{schemas.json, summary.json, documents/<id>.json}`.
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run: &ExtractionRun) -> PathBuf {
        self.root.join(run.run_id.to_string())
    }

    /// Returns the run directory.
    pub async fn write_run(&self, run: &ExtractionRun) -> Result<PathBuf> {
        let run_dir = self.run_dir(run);
        let documents_dir = run_dir.join("documents");
        fs::create_dir_all(&documents_dir)
            .await
            .context(format!("Failed to create artifact directory {:?}", documents_dir))?;

        write_json(&run_dir.join("schemas.json"), &run.schemas).await?;

        let mut written = 0;
        for result in run.results() {
            let path = documents_dir.join(format!("{}.json", result.document_id));
            write_json(&path, &DocumentArtifact::from(result)).await?;
            written += 1;
        }

        write_json(&run_dir.join("summary.json"), &run.summary).await?;

        info!(
            run_id = %run.run_id,
            path = %run_dir.display(),
            documents = written,
            "Artifacts written"
        );
        Ok(run_dir)
    }
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize artifact")?;
    fs::write(path, json)
        .await
        .context(format!("Failed to write {:?}", path))
}
