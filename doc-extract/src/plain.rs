//! Whole-file plain text and markdown documents.

use std::fs;
use std::path::Path;

use crate::{Document, ExtractError, Result};

/// Reads a text or markdown file as a single document.
///
/// The display name is the file name without its last extension, so
/// `notes/Rust Ownership.md` becomes `Rust Ownership`.
pub fn read_plain(path: &Path) -> Result<Document> {
    let text = fs::read_to_string(path).map_err(|err| ExtractError::io(path, err))?;
    let links = wiki_links(&text);
    Ok(Document {
        source_path: path.to_path_buf(),
        display_name: display_name(path),
        text,
        links,
        columns: Default::default(),
    })
}

/// Returns the targets of every `[[...]]` link in `text`, in order.
pub fn wiki_links(text: &str) -> Vec<String> {
    let mut links = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("[[") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("]]") else {
            break;
        };
        links.push(after[..end].to_string());
        rest = &after[end + 2..];
    }
    links
}

fn display_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file_name,
    }
}
