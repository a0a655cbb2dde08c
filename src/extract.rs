//! Extension-keyed extractor registry and per-folder extraction.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::{decode_json, encode_json, Artifact, ArtifactFormat};
use crate::error::{CacheError, PipelineError, Result};
use crate::runner::CancellationToken;

pub use doc_extract::Document;

/// Closed set of supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractorKind {
    /// Whole file as one document (`.txt`, `.md`).
    PlainText,
    /// One document per chapter.
    Epub,
}

impl ExtractorKind {
    /// Extracts every document contained in `path`.
    pub fn extract(self, path: &Path) -> Result<Vec<Document>> {
        let documents = match self {
            Self::PlainText => vec![doc_extract::read_plain(path)?],
            Self::Epub => doc_extract::read_epub(path)?,
        };
        Ok(documents)
    }
}

/// Maps lowercase file extensions to extractors.
#[derive(Debug, Clone)]
pub struct ExtractorRegistry {
    handlers: BTreeMap<String, ExtractorKind>,
}

impl ExtractorRegistry {
    /// Registry without any handler.
    pub fn empty() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Registers (or replaces) the handler for `extension`.
    pub fn register(&mut self, extension: &str, kind: ExtractorKind) {
        self.handlers.insert(normalize_extension(extension), kind);
    }

    /// Looks up the extractor for `extension` (with or without leading dot).
    pub fn extractor_for(&self, extension: &str) -> Result<ExtractorKind> {
        let key = normalize_extension(extension);
        self.handlers
            .get(&key)
            .copied()
            .ok_or(PipelineError::UnsupportedFormat(key))
    }

    /// Registered extensions in sorted order.
    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("txt", ExtractorKind::PlainText);
        registry.register("md", ExtractorKind::PlainText);
        registry.register("epub", ExtractorKind::Epub);
        registry
    }
}

fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_ascii_lowercase()
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

/// One input folder plus the extensions accepted inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFolder {
    /// Root directory, walked recursively.
    pub path: PathBuf,
    /// Accepted extensions, lowercase, without dots.
    pub extensions: Vec<String>,
}

impl InputFolder {
    /// Builds an input folder accepting the given extensions.
    pub fn new<P, I, S>(path: P, extensions: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            path: path.into(),
            extensions: extensions
                .into_iter()
                .map(|ext| normalize_extension(ext.as_ref()))
                .filter(|ext| !ext.is_empty())
                .collect(),
        }
    }

    /// Dataset name used for cache keys: the folder's base name.
    pub fn dataset_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

impl FromStr for InputFolder {
    type Err = PipelineError;

    /// Parses `ext:path` or `ext+ext:path`, e.g. `md+txt:~/notes`.
    fn from_str(value: &str) -> Result<Self> {
        let (extensions, path) = value.split_once(':').ok_or_else(|| {
            PipelineError::invalid_parameter("input", format!("expected ext:path, got '{value}'"))
        })?;
        let folder = Self::new(path.trim(), extensions.split('+'));
        if folder.extensions.is_empty() || folder.path.as_os_str().is_empty() {
            return Err(PipelineError::invalid_parameter(
                "input",
                format!("expected ext:path, got '{value}'"),
            ));
        }
        Ok(folder)
    }
}

impl fmt::Display for InputFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.extensions.join("+"), self.path.display())
    }
}

/// Extracted documents of one dataset, the tabular extraction artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTable {
    /// Dataset (input folder) name.
    pub dataset: String,
    /// Documents in discovery order; position is the document id.
    pub documents: Vec<Document>,
}

impl Artifact for DocumentTable {
    const FORMAT: ArtifactFormat = ArtifactFormat::Json;

    fn encode(&self, writer: &mut dyn Write) -> std::result::Result<(), CacheError> {
        encode_json(self, writer)
    }

    fn decode(reader: &mut dyn Read) -> std::result::Result<Self, CacheError> {
        decode_json(reader)
    }
}

/// Per-folder extraction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    /// Files matching the accepted extensions.
    pub files_seen: usize,
    /// Files extracted without error (possibly yielding no documents).
    pub files_extracted: usize,
    /// Files skipped because extraction failed.
    pub files_failed: usize,
    /// Documents produced.
    pub documents: usize,
}

/// Recursively lists files under `root` whose extension is accepted.
///
/// Paths are sorted so repeated runs see the same order.
pub fn discover(root: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(PipelineError::NotADirectory(root.to_path_buf()));
    }
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let accepted = extension_of(entry.path())
            .map(|ext| extensions.iter().any(|allowed| *allowed == ext))
            .unwrap_or(false);
        if accepted {
            paths.push(entry.into_path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// Extracts every accepted file under `folder`.
///
/// Failing files are logged, counted and skipped. The folder fails only when
/// it yields no documents at all.
pub fn extract_folder(
    registry: &ExtractorRegistry,
    folder: &InputFolder,
    cancel: &CancellationToken,
) -> Result<(DocumentTable, ExtractionSummary)> {
    let dataset = folder.dataset_name();
    let paths = discover(&folder.path, &folder.extensions)?;
    info!(dataset = %dataset, files = paths.len(), "extracting documents");

    let mut summary = ExtractionSummary {
        files_seen: paths.len(),
        ..Default::default()
    };
    let mut documents = Vec::new();
    for path in &paths {
        cancel.check()?;
        let extracted = extension_of(path)
            .ok_or_else(|| PipelineError::UnsupportedFormat(String::new()))
            .and_then(|ext| registry.extractor_for(&ext))
            .and_then(|kind| kind.extract(path));
        match extracted {
            Ok(found) => {
                debug!(path = %path.display(), documents = found.len(), "extracted file");
                summary.files_extracted += 1;
                summary.documents += found.len();
                documents.extend(found);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping file");
                summary.files_failed += 1;
            }
        }
    }

    if documents.is_empty() {
        return Err(PipelineError::NoDocuments {
            folder: folder.path.clone(),
            files_seen: summary.files_seen,
            files_failed: summary.files_failed,
        });
    }
    info!(
        dataset = %dataset,
        extracted = summary.files_extracted,
        failed = summary.files_failed,
        documents = summary.documents,
        "extraction finished"
    );
    Ok((DocumentTable { dataset, documents }, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[test]
    fn registry_resolves_known_extensions() {
        let registry = ExtractorRegistry::default();
        assert_eq!(registry.extractor_for("md").unwrap(), ExtractorKind::PlainText);
        assert_eq!(registry.extractor_for(".EPUB").unwrap(), ExtractorKind::Epub);
        match registry.extractor_for("pdf") {
            Err(PipelineError::UnsupportedFormat(ext)) => assert_eq!(ext, "pdf"),
            other => panic!("expected unsupported format, got {other:?}"),
        }
    }

    #[test]
    fn parses_input_folder_arguments() {
        let folder: InputFolder = "md+TXT:/data/notes".parse().unwrap();
        assert_eq!(folder.extensions, vec!["md", "txt"]);
        assert_eq!(folder.dataset_name(), "notes");
        assert_eq!(folder.to_string(), "md+txt:/data/notes");
        assert!("notes".parse::<InputFolder>().is_err());
        assert!(":/data".parse::<InputFolder>().is_err());
    }

    #[test]
    fn discover_walks_recursively_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("one.md"), "one").unwrap();
        fs::write(dir.path().join("a/b/two.MD"), "two").unwrap();
        fs::write(dir.path().join("a/skip.txt"), "skip").unwrap();

        let found = discover(dir.path(), &["md".to_string()]).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![PathBuf::from("a/b/two.MD"), PathBuf::from("one.md")]
        );
    }

    #[test]
    fn discover_rejects_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.md");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            discover(&file, &["md".to_string()]),
            Err(PipelineError::NotADirectory(_))
        ));
    }

    #[test]
    fn failing_files_are_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("good.txt"), "hello [[world]]").unwrap();
        fs::write(dir.path().join("bad.epub"), "not a zip").unwrap();
        let folder = InputFolder::new(dir.path(), ["txt", "epub"]);

        let (table, summary) =
            extract_folder(&ExtractorRegistry::default(), &folder, &CancellationToken::new())
                .unwrap();
        assert_eq!(
            summary,
            ExtractionSummary {
                files_seen: 2,
                files_extracted: 1,
                files_failed: 1,
                documents: 1,
            }
        );
        assert_eq!(table.documents[0].display_name, "good");
        assert_eq!(table.documents[0].links, vec!["world"]);
    }

    #[test]
    fn folder_without_documents_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.epub"), "not a zip").unwrap();
        let folder = InputFolder::new(dir.path(), ["epub"]);

        match extract_folder(&ExtractorRegistry::default(), &folder, &CancellationToken::new()) {
            Err(PipelineError::NoDocuments {
                files_seen,
                files_failed,
                ..
            }) => {
                assert_eq!((files_seen, files_failed), (1, 1));
            }
            other => panic!("expected no documents, got {other:?}"),
        }
    }

    #[test]
    fn unregistered_extension_fails_only_that_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "text").unwrap();
        fs::write(dir.path().join("b.rst"), "rst").unwrap();
        let folder = InputFolder::new(dir.path(), ["txt", "rst"]);

        let (_, summary) =
            extract_folder(&ExtractorRegistry::default(), &folder, &CancellationToken::new())
                .unwrap();
        assert_eq!(summary.files_failed, 1);
        assert_eq!(summary.documents, 1);
    }
}
