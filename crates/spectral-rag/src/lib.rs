use chrono::Utc;
use serde::{Deserialize, Serialize};
use spectral_core::{DocumentChunk, MemoryKind, RagConfig, CATEGORY_KNOWLEDGE_CHUNKS};
use spectral_memory::{MemoryService, NewMemory};
use spectral_store::StorageError;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;
/// Assumed average document length in tokens; scoring does not re-derive it
/// from the corpus.
const BM25_AVG_DOC_LEN: f64 = 200.0;
/// How far past the target window the chunker may look for a sentence end.
const SENTENCE_LOOKAHEAD: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk: DocumentChunk,
    pub score: f64,
    pub snippet: String,
}

/// Chunking, ingestion, and BM25 retrieval over the knowledge-chunk
/// category of the memory service.
pub struct RagService {
    memory: Arc<MemoryService>,
    config: RagConfig,
}

impl RagService {
    pub fn new(memory: Arc<MemoryService>, config: RagConfig) -> Self {
        Self { memory, config }
    }

    /// Split a document into overlapping chunks of roughly `chunk_size`
    /// characters, extending each window to the nearest sentence terminator
    /// within the look-ahead. Empty content yields no chunks.
    pub fn chunk_document(&self, content: &str) -> Vec<String> {
        chunk_text(content, self.config.chunk_size, self.config.chunk_overlap)
    }

    /// Chunk and persist a document. Returns the stored entry ids.
    pub fn ingest_document(
        &self,
        content: &str,
        source_doc: &str,
        memory_type: MemoryKind,
        metadata: serde_json::Value,
    ) -> Result<Vec<Uuid>, StorageError> {
        let chunks = self.chunk_document(content);
        let mut ids = Vec::with_capacity(chunks.len());
        for (index, chunk_content) in chunks.into_iter().enumerate() {
            let chunk = DocumentChunk {
                chunk_id: Uuid::now_v7(),
                content: chunk_content,
                chunk_index: index,
                source_doc: source_doc.to_string(),
                memory_type,
                metadata: metadata.clone(),
                created_at: Utc::now(),
            };
            let id = self.memory.create_memory(
                NewMemory::new(
                    CATEGORY_KNOWLEDGE_CHUNKS,
                    &format!("{source_doc}#{index}"),
                    serde_json::to_value(&chunk)?,
                )
                .entity("knowledge_chunk", Some(&chunk.chunk_id.to_string()))
                .tags(vec![
                    memory_type.as_str().to_string(),
                    format!("source:{source_doc}"),
                ])
                .from_module("rag", None),
            )?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// BM25-ranked retrieval. `memory_types` and `tags` filter candidates
    /// (any-match each) before scoring; the top `k` results are returned by
    /// descending score with display snippets.
    pub fn retrieve(
        &self,
        query: &str,
        memory_types: &[MemoryKind],
        tags: &[String],
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, StorageError> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut chunks: Vec<DocumentChunk> = Vec::new();
        for entry in self
            .memory
            .get_memories_by_category(CATEGORY_KNOWLEDGE_CHUNKS)?
        {
            let Ok(chunk) = serde_json::from_value::<DocumentChunk>(entry.value) else {
                continue;
            };
            if !memory_types.is_empty() && !memory_types.contains(&chunk.memory_type) {
                continue;
            }
            if !tags.is_empty() && !tags.iter().any(|t| entry.tags.contains(t)) {
                continue;
            }
            chunks.push(chunk);
        }
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let tokenized: Vec<Vec<String>> = chunks.iter().map(|c| tokenize(&c.content)).collect();
        let num_docs = chunks.len() as f64;
        let mut results: Vec<RetrievalResult> = Vec::new();
        for (chunk, doc_tokens) in chunks.into_iter().zip(&tokenized) {
            let score = bm25_score(&query_terms, doc_tokens, &tokenized, num_docs);
            if score <= 0.0 {
                continue;
            }
            let snippet = make_snippet(&chunk.content, &query_terms, self.config.snippet_len);
            results.push(RetrievalResult {
                chunk,
                score,
                snippet,
            });
        }
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    /// Prepend retrieved knowledge to a prompt. The base prompt is returned
    /// unchanged when retrieval finds nothing.
    pub fn enrich_prompt(
        &self,
        base_prompt: &str,
        query: &str,
        memory_types: &[MemoryKind],
        top_k: usize,
    ) -> Result<String, StorageError> {
        let results = self.retrieve(query, memory_types, &[], top_k)?;
        if results.is_empty() {
            return Ok(base_prompt.to_string());
        }
        let mut enriched = String::from("Relevant contextual knowledge:\n");
        for result in &results {
            enriched.push_str(&format!(
                "- [{} | {}] {}\n",
                result.chunk.memory_type.as_str(),
                result.chunk.source_doc,
                result.snippet
            ));
        }
        enriched.push('\n');
        enriched.push_str(base_prompt);
        Ok(enriched)
    }
}

/// Lowercase word tokens; everything that is not alphanumeric separates.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn bm25_score(
    query_terms: &[String],
    doc_tokens: &[String],
    corpus: &[Vec<String>],
    num_docs: f64,
) -> f64 {
    let doc_len = doc_tokens.len() as f64;
    let mut score = 0.0;
    let unique_terms: HashSet<&String> = query_terms.iter().collect();
    for term in unique_terms {
        let tf = doc_tokens.iter().filter(|t| *t == term).count() as f64;
        if tf == 0.0 {
            continue;
        }
        let df = corpus
            .iter()
            .filter(|tokens| tokens.iter().any(|t| t == term))
            .count() as f64;
        let idf = ((num_docs - df + 0.5) / (df + 0.5) + 1.0).ln();
        let numerator = tf * (BM25_K1 + 1.0);
        let denominator =
            tf + BM25_K1 * (1.0 - BM25_B + BM25_B * (doc_len / BM25_AVG_DOC_LEN));
        score += idf * (numerator / denominator);
    }
    score
}

/// Window the content around the first query-term occurrence (or the head
/// when none matches), with ellipses marking truncation.
fn make_snippet(content: &str, query_terms: &[String], snippet_len: usize) -> String {
    let content_lc = content.to_lowercase();
    let first_match = query_terms
        .iter()
        .filter_map(|t| content_lc.find(t.as_str()))
        .min();

    let Some(first_match) = first_match else {
        let head: String = content.chars().take(snippet_len).collect();
        if content.chars().count() > snippet_len {
            return format!("{head}...");
        }
        return head;
    };

    // Work in characters so multi-byte content cannot split.
    let chars: Vec<char> = content.chars().collect();
    let match_char_idx = content[..first_match].chars().count();
    let start = match_char_idx.saturating_sub(snippet_len / 2);
    let end = (start + snippet_len).min(chars.len());
    let mut snippet: String = chars[start..end].iter().collect();
    if start > 0 {
        snippet = format!("...{snippet}");
    }
    if end < chars.len() {
        snippet.push_str("...");
    }
    snippet
}

/// Overlapping chunks with stride `chunk_size - chunk_overlap`, each window
/// extended to the nearest sentence terminator within the look-ahead.
pub fn chunk_text(content: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    let chars: Vec<char> = trimmed.chars().collect();
    let stride = chunk_size.saturating_sub(chunk_overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let raw_end = (start + chunk_size).min(chars.len());
        let end = find_sentence_boundary(&chars, raw_end);
        let chunk: String = chars[start..end].iter().collect();
        let chunk = chunk.trim().to_string();
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
        if end >= chars.len() {
            break;
        }
        start += stride;
    }
    chunks
}

/// Extend `end` to just past the nearest sentence terminator within the
/// bounded look-ahead; fall back to the raw window when none is found.
fn find_sentence_boundary(chars: &[char], end: usize) -> usize {
    if end >= chars.len() {
        return chars.len();
    }
    let limit = (end + SENTENCE_LOOKAHEAD).min(chars.len());
    for idx in end..limit {
        match chars[idx] {
            '.' | '!' | '?' => return idx + 1,
            '\n' if idx + 1 < limit && chars[idx + 1] == '\n' => return idx + 1,
            _ => {}
        }
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral_store::SqliteBackend;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> RagService {
        let backend = SqliteBackend::open(dir.path()).expect("backend");
        let memory = Arc::new(MemoryService::new(Arc::new(backend)));
        RagService::new(memory, RagConfig::default())
    }

    #[test]
    fn empty_content_yields_no_chunks() {
        assert!(chunk_text("", 500, 50).is_empty());
        assert!(chunk_text("   \n\t ", 500, 50).is_empty());
    }

    #[test]
    fn chunks_overlap_and_respect_sentence_boundaries() {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let doc = sentence.repeat(30);
        let chunks = chunk_text(&doc, 100, 20);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            // Window 100 plus bounded look-ahead.
            assert!(chunk.chars().count() <= 100 + 100);
            assert!(chunk.ends_with('.'), "chunk not sentence-aligned: {chunk:?}");
        }
    }

    #[test]
    fn window_without_terminator_uses_raw_cut() {
        let doc = "x".repeat(400);
        let chunks = chunk_text(&doc, 100, 10);
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].chars().count(), 100);
    }

    #[test]
    fn ingest_then_retrieve_finds_source_doc() {
        let dir = TempDir::new().expect("tempdir");
        let rag = service(&dir);
        rag.ingest_document(
            "The file_create tool writes a new file at the given path. \
             The file_delete tool removes a file.",
            "tool-manual",
            MemoryKind::ToolKnowledge,
            serde_json::json!({}),
        )
        .expect("ingest");

        let hits = rag
            .retrieve("file_create tool", &[MemoryKind::ToolKnowledge], &[], 3)
            .expect("retrieve");
        assert!(!hits.is_empty());
        assert_eq!(hits[0].chunk.source_doc, "tool-manual");
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn memory_type_filter_excludes_other_kinds() {
        let dir = TempDir::new().expect("tempdir");
        let rag = service(&dir);
        rag.ingest_document(
            "Users prefer dark mode in the evening.",
            "prefs",
            MemoryKind::UserPreference,
            serde_json::json!({}),
        )
        .expect("ingest");

        let hits = rag
            .retrieve("dark mode", &[MemoryKind::ToolKnowledge], &[], 3)
            .expect("retrieve");
        assert!(hits.is_empty());
    }

    #[test]
    fn chunk_indices_are_unique_per_source() {
        let dir = TempDir::new().expect("tempdir");
        let rag = service(&dir);
        let sentence = "Every tool returns a structured result with timing. ";
        rag.ingest_document(
            &sentence.repeat(40),
            "manual",
            MemoryKind::ToolKnowledge,
            serde_json::json!({}),
        )
        .expect("ingest");

        let hits = rag
            .retrieve("structured result timing", &[], &[], 50)
            .expect("retrieve");
        let mut indices: Vec<usize> = hits
            .iter()
            .filter(|h| h.chunk.source_doc == "manual")
            .map(|h| h.chunk.chunk_index)
            .collect();
        let before = indices.len();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), before);
    }

    #[test]
    fn snippet_windows_around_first_match_with_ellipses() {
        let padding = "lorem ipsum ".repeat(30);
        let content = format!("{padding}needle in the middle {padding}");
        let snippet = make_snippet(&content, &["needle".to_string()], 50);
        assert!(snippet.contains("needle"));
        assert!(snippet.starts_with("..."));
        assert!(snippet.ends_with("..."));
    }

    #[test]
    fn enrich_prompt_prepends_knowledge_block() {
        let dir = TempDir::new().expect("tempdir");
        let rag = service(&dir);
        rag.ingest_document(
            "powershell_get_system_info reports OS version and memory.",
            "tooling",
            MemoryKind::ToolKnowledge,
            serde_json::json!({}),
        )
        .expect("ingest");

        let enriched = rag
            .enrich_prompt("Plan the request.", "system info", &[], 3)
            .expect("enrich");
        assert!(enriched.starts_with("Relevant contextual knowledge:"));
        assert!(enriched.contains("tooling"));
        assert!(enriched.ends_with("Plan the request."));
    }

    #[test]
    fn enrich_prompt_without_hits_returns_base_unchanged() {
        let dir = TempDir::new().expect("tempdir");
        let rag = service(&dir);
        let enriched = rag
            .enrich_prompt("Plan the request.", "quantum entanglement", &[], 3)
            .expect("enrich");
        assert_eq!(enriched, "Plan the request.");
    }

    #[test]
    fn bm25_prefers_document_with_more_term_occurrences() {
        let corpus = vec![
            tokenize("alpha beta gamma"),
            tokenize("alpha alpha alpha beta"),
            tokenize("delta epsilon"),
        ];
        let query = tokenize("alpha");
        let sparse = bm25_score(&query, &corpus[0], &corpus, 3.0);
        let dense = bm25_score(&query, &corpus[1], &corpus, 3.0);
        let none = bm25_score(&query, &corpus[2], &corpus, 3.0);
        assert!(dense > sparse);
        assert_eq!(none, 0.0);
    }
}
