//! Ingesta de un directorio del sistema de archivos: lectura de ficheros,
//! troceado con solapamiento y envío de los chunks a la fusión vectorial,
//! al grafo de conocimiento o a ambos.

use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use walkdir::WalkDir;

use crate::{
    app_state::Status,
    config::AppConfig,
    fusion::RetrievalFusion,
    graph::{GraphContextResolver, GraphIngestReport},
    models::Chunk,
};

/// Separadores por prioridad: párrafos, líneas, palabras y caracteres.
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];
/// Separador de páginas en el texto extraído de un PDF.
const PAGE_BREAK: char = '\x0c';

/// Destino de una ingesta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestTarget {
    Vector,
    Graph,
    #[default]
    Both,
}

impl IngestTarget {
    fn vector(self) -> bool {
        matches!(self, IngestTarget::Vector | IngestTarget::Both)
    }

    fn graph(self) -> bool {
        matches!(self, IngestTarget::Graph | IngestTarget::Both)
    }
}

/// Resumen de los resultados de una operación de ingesta.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestionSummary {
    pub files_scanned: u32,
    pub files_ingested: u32,
    pub files_skipped: u32,
    pub chunks_created: usize,
    pub vector_chunks_added: usize,
    pub graph_documents: usize,
    pub graph_mentions: usize,
}

impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros escaneados, {} ingeridos, {} omitidos. {} chunks creados, {} nuevos en el índice vectorial, {} documentos y {} menciones en el grafo.",
            self.files_scanned,
            self.files_ingested,
            self.files_skipped,
            self.chunks_created,
            self.vector_chunks_added,
            self.graph_documents,
            self.graph_mentions
        )
    }
}

/// Resultado de enrutar un lote de chunks.
#[derive(Debug, Default, Clone)]
pub struct IngestReport {
    /// Chunks nuevos por backend vectorial.
    pub vector: Vec<(String, usize)>,
    pub graph: Option<GraphIngestReport>,
}

// --- Procesado de documentos ---

/// Lee ficheros soportados y los convierte en chunks.
#[derive(Debug, Clone)]
pub struct DocumentProcessor {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl DocumentProcessor {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(cfg.chunk_size, cfg.chunk_overlap)
    }

    /// Ficheros regulares bajo `root`, en orden estable.
    pub fn collect_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        if !root.is_dir() {
            return Err(anyhow!("La ruta no es un directorio: {}", root.display()));
        }
        let mut files: Vec<PathBuf> = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        files.sort();
        Ok(files)
    }

    /// Devuelve `None` si el fichero no está soportado o no tiene texto útil.
    pub fn process_file(&self, path: &Path) -> Result<Option<Vec<Chunk>>> {
        let extension = path
            .extension()
            .and_then(std::ffi::OsStr::to_str)
            .unwrap_or("")
            .to_lowercase();

        let bytes = fs::read(path)?;
        let pages: Vec<String> = match extension.as_str() {
            "pdf" => match pdf_extract::extract_text_from_mem(&bytes) {
                Ok(content) => content.split(PAGE_BREAK).map(str::to_string).collect(),
                Err(e) => {
                    warn!("No se pudo extraer texto del PDF {}: {}. Saltando fichero.", path.display(), e);
                    return Ok(None);
                }
            },
            "txt" | "md" => match String::from_utf8(bytes.clone()) {
                Ok(content) => vec![content],
                Err(_) => {
                    warn!("Saltando fichero no-UTF8: {}", path.display());
                    return Ok(None);
                }
            },
            _ => {
                info!("Saltando fichero con extensión no soportada ('.{}'): {}", extension, path.display());
                return Ok(None);
            }
        };

        let filename = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        let file_hash = blake3::hash(&bytes).to_hex().to_string();

        let chunks = self.process_pages(&file_hash, &filename, &pages);
        if chunks.is_empty() {
            warn!("Fichero vacío o sin texto útil: {}", path.display());
            return Ok(None);
        }
        Ok(Some(chunks))
    }

    /// Trocea cada página; el índice del chunk es global al fichero y la
    /// página empieza en 1.
    pub fn process_pages(&self, file_hash: &str, filename: &str, pages: &[String]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for (page_idx, page) in pages.iter().enumerate() {
            for text in self.split_text(page) {
                let index = chunks.len();
                chunks.push(Chunk::new(file_hash, index, filename, page_idx as u32 + 1, text));
            }
        }
        chunks
    }

    /// Troceado recursivo: intenta respetar párrafos, luego líneas, luego
    /// palabras. Las piezas consecutivas comparten hasta `chunk_overlap`
    /// caracteres.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &SEPARATORS)
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let position = separators
            .iter()
            .position(|s| s.is_empty() || text.contains(s))
            .unwrap_or(separators.len().saturating_sub(1));
        let separator = separators.get(position).copied().unwrap_or("");
        let remaining = separators.get(position + 1..).unwrap_or(&[]);

        let pieces: Vec<String> = if separator.is_empty() {
            text.chars().map(String::from).collect()
        } else {
            text.split(separator)
                .filter(|p| !p.trim().is_empty())
                .map(str::to_string)
                .collect()
        };

        let mut out = Vec::new();
        let mut fitting = Vec::new();
        for piece in pieces {
            if piece.chars().count() <= self.chunk_size {
                fitting.push(piece);
                continue;
            }
            if !fitting.is_empty() {
                out.extend(self.merge_pieces(&fitting, separator));
                fitting.clear();
            }
            if remaining.is_empty() {
                out.push(piece);
            } else {
                out.extend(self.split_recursive(&piece, remaining));
            }
        }
        if !fitting.is_empty() {
            out.extend(self.merge_pieces(&fitting, separator));
        }
        out
    }

    fn merge_pieces(&self, pieces: &[String], separator: &str) -> Vec<String> {
        let sep_len = separator.chars().count();
        let mut out = Vec::new();
        let mut window: VecDeque<(&str, usize)> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = piece.chars().count();
            let joined_len = |window: &VecDeque<(&str, usize)>| if window.is_empty() { 0 } else { sep_len };

            if total + len + joined_len(&window) > self.chunk_size && !window.is_empty() {
                out.push(join(&window, separator));
                // Conservar la cola como solapamiento.
                while total > self.chunk_overlap
                    || (total > 0 && total + len + joined_len(&window) > self.chunk_size)
                {
                    let Some((_, first_len)) = window.pop_front() else {
                        break;
                    };
                    total -= first_len + if window.is_empty() { 0 } else { sep_len };
                }
            }

            total += len + joined_len(&window);
            window.push_back((piece.as_str(), len));
        }
        if !window.is_empty() {
            out.push(join(&window, separator));
        }
        out
    }
}

fn join(window: &VecDeque<(&str, usize)>, separator: &str) -> String {
    window.iter().map(|(p, _)| *p).collect::<Vec<_>>().join(separator)
}

// --- Servicio de ingesta ---

/// Enruta chunks a los almacenes de recuperación.
pub struct IngestionService {
    fusion: Arc<RetrievalFusion>,
    graph: Arc<GraphContextResolver>,
}

impl IngestionService {
    pub fn new(fusion: Arc<RetrievalFusion>, graph: Arc<GraphContextResolver>) -> Self {
        Self { fusion, graph }
    }

    pub async fn ingest(&self, chunks: &[Chunk], target: IngestTarget) -> IngestReport {
        let mut report = IngestReport::default();
        if target.vector() {
            report.vector = self.fusion.index(chunks).await;
        }
        if target.graph() {
            report.graph = Some(self.graph.ingest(chunks).await);
        }
        report
    }

    /// Recorre recursivamente un directorio e ingiere cada fichero soportado,
    /// publicando el progreso en `status`.
    #[instrument(skip(self, processor, status))]
    pub async fn ingest_directory(
        &self,
        processor: &DocumentProcessor,
        root: &Path,
        target: IngestTarget,
        status: Arc<Mutex<Status>>,
    ) -> Result<IngestionSummary> {
        let files = processor.collect_files(root)?;
        let mut summary = IngestionSummary::default();
        let total_files = files.len().max(1) as f32;

        for (index, path) in files.iter().enumerate() {
            summary.files_scanned += 1;
            let filename = path.file_name().unwrap_or_default().to_string_lossy();
            let progress = (index + 1) as f32 / total_files;
            set_status(
                &status,
                format!("[{}/{}] Procesando: {}...", index + 1, files.len(), filename),
                progress,
            );

            match processor.process_file(path) {
                Ok(Some(chunks)) => {
                    let report = self.ingest(&chunks, target).await;
                    summary.files_ingested += 1;
                    summary.chunks_created += chunks.len();
                    summary.vector_chunks_added += report.vector.iter().map(|(_, n)| n).sum::<usize>();
                    if let Some(graph) = report.graph {
                        summary.graph_documents += graph.documents;
                        summary.graph_mentions += graph.mentions;
                    }
                    info!("Ingerido {} con {} chunks.", path.display(), chunks.len());
                }
                Ok(None) => {
                    summary.files_skipped += 1;
                    set_status(
                        &status,
                        format!("[{}/{}] Omitido: {}", index + 1, files.len(), filename),
                        progress,
                    );
                }
                Err(err) => {
                    summary.files_skipped += 1;
                    error!("Error ingiriendo {}: {err}", path.display());
                    set_status(&status, format!("ERROR en {}: {}", path.display(), err), progress);
                }
            }
        }

        Ok(summary)
    }
}

fn set_status(status: &Mutex<Status>, message: String, progress: f32) {
    let mut status = status.lock().unwrap_or_else(|e| e.into_inner());
    status.message = message;
    status.progress = progress;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::CapitalizedTermExtractor;
    use crate::fusion::{FusionSource, SearchStrategy};
    use crate::graph::InMemoryGraphStore;
    use crate::vector_store::tests::embedder;
    use crate::vector_store::InMemoryVectorIndex;

    fn service() -> (IngestionService, Arc<InMemoryVectorIndex>, Arc<GraphContextResolver>) {
        let index = Arc::new(InMemoryVectorIndex::new(embedder()));
        let fusion = Arc::new(RetrievalFusion::new(vec![FusionSource::new(
            index.clone(),
            SearchStrategy::Diversity,
        )]));
        let graph = Arc::new(GraphContextResolver::new(
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(CapitalizedTermExtractor::default()),
        ));
        (IngestionService::new(fusion, graph.clone()), index, graph)
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let processor = DocumentProcessor::new(1200, 200);
        assert_eq!(processor.split_text("  Hello world.  "), vec!["Hello world."]);
        assert!(processor.split_text("\n\n   \n").is_empty());
    }

    #[test]
    fn test_split_respects_size_and_overlaps() {
        let processor = DocumentProcessor::new(20, 8);
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let chunks = processor.split_text(text);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 20));
        // Cada chunk empieza con el final del anterior.
        for pair in chunks.windows(2) {
            let first_word = pair[1].split(' ').next().unwrap();
            assert!(pair[0].contains(first_word), "{pair:?}");
        }
    }

    #[test]
    fn test_split_prefers_paragraph_boundaries() {
        let processor = DocumentProcessor::new(30, 0);
        let chunks = processor.split_text("First paragraph here.\n\nSecond paragraph here.");
        assert_eq!(chunks, vec!["First paragraph here.", "Second paragraph here."]);
    }

    #[test]
    fn test_pages_are_one_based_and_ids_global() {
        let processor = DocumentProcessor::new(1200, 200);
        let pages = vec!["Page one text.".to_string(), "Page two text.".to_string()];
        let chunks = processor.process_pages("abc", "doc.pdf", &pages);

        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].id.as_str(), chunks[0].page), ("abc_0", 1));
        assert_eq!((chunks[1].id.as_str(), chunks[1].page), ("abc_1", 2));
        assert_eq!(chunks[1].tokens_estimate, "Page two text.".len() / 4);
    }

    #[test]
    fn test_process_file_hashes_and_skips_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let md = dir.path().join("notes.md");
        fs::write(&md, "Rust notes.").unwrap();
        let bin = dir.path().join("image.png");
        fs::write(&bin, [0u8, 1, 2]).unwrap();

        let processor = DocumentProcessor::new(1200, 200);
        let chunks = processor.process_file(&md).unwrap().unwrap();
        let hash = blake3::hash(b"Rust notes.").to_hex().to_string();
        assert_eq!(chunks[0].id, format!("{hash}_0"));
        assert_eq!(chunks[0].source_filename, "notes.md");
        assert!(processor.process_file(&bin).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ingest_routes_by_target() {
        let (service, index, graph) = service();
        let chunks = vec![Chunk::new("h", 0, "a.md", 1, "Alice writes Rust code.")];

        let report = service.ingest(&chunks, IngestTarget::Graph).await;
        assert!(report.vector.is_empty());
        assert_eq!(report.graph.unwrap().documents, 1);
        assert_eq!(index.len().await, 0);

        let report = service.ingest(&chunks, IngestTarget::Vector).await;
        assert_eq!(report.vector, vec![("in-memory".to_string(), 1)]);
        assert!(report.graph.is_none());
        assert_eq!(graph.stats().await.unwrap().documents, 1);
    }

    #[tokio::test]
    async fn test_ingest_directory_updates_status() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.md"), "Alice met Bob in Paris.").unwrap();
        fs::write(dir.path().join("b.txt"), "Rust and graph notes.").unwrap();
        fs::write(dir.path().join("c.bin"), [0u8]).unwrap();

        let (service, index, _) = service();
        let status = Arc::new(Mutex::new(Status::default()));
        let summary = service
            .ingest_directory(&DocumentProcessor::new(1200, 200), dir.path(), IngestTarget::Both, status.clone())
            .await
            .unwrap();

        assert_eq!(summary.files_scanned, 3);
        assert_eq!(summary.files_ingested, 2);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.vector_chunks_added, 2);
        assert_eq!(index.len().await, 2);
        assert!((status.lock().unwrap().progress - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_ingest_directory_rejects_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.md");
        fs::write(&file, "x").unwrap();
        let (service, _, _) = service();
        let status = Arc::new(Mutex::new(Status::default()));
        assert!(service
            .ingest_directory(&DocumentProcessor::new(1200, 200), &file, IngestTarget::Both, status)
            .await
            .is_err());
    }
}
