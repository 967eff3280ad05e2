use serde::{Deserialize, Serialize};

use crate::document::Document;

/// The full set of transcripts for one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Corpus {
    pub documents: Vec<Document>,
}

impl Corpus {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn get(&self, doc_id: &str) -> Option<&Document> {
        self.documents.iter().find(|d| d.doc_id == doc_id)
    }

    /// Concatenate every transcript behind a header line. Discovery passes see the
    /// whole corpus at once.
    pub fn concatenated(&self) -> String {
        let mut out = String::new();
        for (i, doc) in self.documents.iter().enumerate() {
            out.push_str(&format!(
                "=== DOCUMENT {} of {}: {} ===\n",
                i + 1,
                self.documents.len(),
                doc.title
            ));
            out.push_str(doc.text.trim_end());
            out.push_str("\n\n");
        }
        out
    }

    pub fn estimated_tokens(&self) -> usize {
        self.documents.iter().map(|d| d.estimated_tokens()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concatenated_has_headers_in_order() {
        let corpus = Corpus::new(vec![
            Document::new("a/first.txt".to_string(), "Q: one\nA: two\n".to_string()),
            Document::new("a/second.txt".to_string(), "Q: three".to_string()),
        ]);

        let text = corpus.concatenated();
        let first = text.find("=== DOCUMENT 1 of 2: first ===").unwrap();
        let second = text.find("=== DOCUMENT 2 of 2: second ===").unwrap();

        assert!(first < second);
        assert!(text.contains("A: two\n\n=== DOCUMENT 2"));
        assert!(corpus.get(&corpus.documents[1].doc_id).is_some());
    }
}
