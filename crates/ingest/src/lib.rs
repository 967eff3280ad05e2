pub mod corpus;
pub mod document;
pub mod reader;

pub use corpus::Corpus;
pub use document::Document;
pub use reader::FileReader;

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

/// Load a single transcript
pub async fn ingest_file(file_path: &Path) -> Result<Document> {
    let content = FileReader::read_file(file_path).await?;
    let path_str = file_path.to_string_lossy().to_string();
    Ok(Document::new(path_str, content))
}

/// Load every transcript in a directory
pub async fn ingest_directory(dir_path: &Path) -> Result<Vec<Document>> {
    let files = FileReader::read_directory(dir_path).await?;

    Ok(files
        .into_iter()
        .map(|(path, content)| Document::new(path, content))
        .collect())
}

/// Build a corpus from a file or a directory of transcripts
pub async fn load_corpus(path: &Path) -> Result<Corpus> {
    let metadata = tokio::fs::metadata(path)
        .await
        .context(format!("Transcript path not found: {:?}", path))?;

    let documents = if metadata.is_dir() {
        ingest_directory(path).await?
    } else {
        vec![ingest_file(path).await?]
    };

    let corpus = Corpus::new(documents);
    info!(
        path = %path.display(),
        documents = corpus.len(),
        estimated_tokens = corpus.estimated_tokens(),
        "Corpus loaded"
    );

    Ok(corpus)
}
