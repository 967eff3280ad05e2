use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One interview or focus-group transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub title: String,
    pub source: String,
    pub text: String,
}

impl Document {
    pub fn new(source: String, text: String) -> Self {
        let doc_id = Self::generate_doc_id(&source);
        let title = std::path::Path::new(&source)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| source.clone());

        Self {
            doc_id,
            title,
            source,
            text,
        }
    }

    /// Stable document ID from the file reference
    pub fn generate_doc_id(source: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..8]) // 16 hex chars is plenty for a corpus
    }

    pub fn line_count(&self) -> usize {
        self.text.lines().count()
    }

    /// Render the transcript with 1-based line numbers so the oracle can cite
    /// `line_start`/`line_end` for each quote.
    pub fn numbered_text(&self) -> String {
        let width = self.line_count().max(1).to_string().len();
        let mut out = String::with_capacity(self.text.len() + self.line_count() * (width + 2));
        for (i, line) in self.text.lines().enumerate() {
            out.push_str(&format!("{:>width$}| {}\n", i + 1, line, width = width));
        }
        out
    }

    /// Estimate token count (rough: 1.3 tokens per word)
    pub fn estimated_tokens(&self) -> usize {
        let word_count = self.text.split_whitespace().count();
        (word_count as f64 * 1.3) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_doc_id() {
        let a = Document::new("data/interview_01.txt".to_string(), "hello".to_string());
        let b = Document::new("data/interview_01.txt".to_string(), "changed text".to_string());
        let c = Document::new("data/interview_02.txt".to_string(), "hello".to_string());

        assert_eq!(a.doc_id, b.doc_id);
        assert_ne!(a.doc_id, c.doc_id);
        assert_eq!(a.doc_id.len(), 16);
        assert_eq!(a.title, "interview_01");
    }

    #[test]
    fn test_numbered_text() {
        let text = (1..=12).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let doc = Document::new("t.txt".to_string(), text);
        let numbered = doc.numbered_text();
        let lines: Vec<&str> = numbered.lines().collect();

        assert_eq!(lines.len(), 12);
        assert_eq!(lines[0], " 1| line 1");
        assert_eq!(lines[11], "12| line 12");
    }
}
