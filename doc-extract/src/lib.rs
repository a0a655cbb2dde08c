//! Extract plain text documents from note folders and EPUB books.
//!
//! A single file yields zero or more [`Document`]s: a text or markdown file
//! is one document, an EPUB yields one document per chapter.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ego_tree::NodeRef;
use scraper::node::Node;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod epub;
pub mod plain;

pub use epub::read_epub;
pub use plain::{read_plain, wiki_links};

/// Result alias for extraction operations.
pub type Result<T> = std::result::Result<T, ExtractError>;

/// Errors raised while reading a single source file.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Offending file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The EPUB container is not a readable zip archive.
    #[error("invalid epub archive {}: {source}", path.display())]
    Archive {
        /// Offending file.
        path: PathBuf,
        /// Underlying zip error.
        #[source]
        source: zip::result::ZipError,
    },

    /// The archive is readable but its package structure is broken.
    #[error("malformed epub {}: {message}", path.display())]
    Malformed {
        /// Offending file.
        path: PathBuf,
        /// What was missing or inconsistent.
        message: String,
    },
}

impl ExtractError {
    /// Wraps an I/O failure on `path`.
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn malformed(path: &Path, message: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

/// One extracted unit of text plus the metadata needed downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// File the document came from.
    pub source_path: PathBuf,
    /// Label shown next to the document in plots and dendrograms.
    pub display_name: String,
    /// Raw text submitted for chunking.
    pub text: String,
    /// Outbound `[[wiki-link]]` targets, when the format has them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    /// Extra extractor-provided columns (book, author, chapter, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub columns: BTreeMap<String, String>,
}

const IGNORE_TAGS: &[&str] = &["script", "style", "noscript", "svg", "nav", "aside"];

pub(crate) fn collect_text(node: &NodeRef<'_, Node>, out: &mut String) {
    match node.value() {
        Node::Text(text) => {
            out.push_str(text);
        }
        Node::Element(element) => {
            if IGNORE_TAGS.contains(&element.name()) {
                return;
            }
            for child in node.children() {
                collect_text(&child, out);
            }
        }
        _ => {
            for child in node.children() {
                collect_text(&child, out);
            }
        }
    }
}

pub(crate) fn normalize_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}
