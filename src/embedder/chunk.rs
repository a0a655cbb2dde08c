//! Greedy whitespace-token chunking.

use std::iter::Peekable;
use std::str::SplitWhitespace;

use crate::embeddings::DocumentId;
use crate::extract::Document;

/// Default chunk size bound.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// A bounded slice of one document's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub document_id: DocumentId,
    pub sequence_index: usize,
    pub text: String,
}

/// Splits `text` into chunks bounded by `chunk_size`.
///
/// Tokens are whitespace separated and rejoined with single spaces. A token
/// joins the current chunk while `tokens_in_chunk + token_chars + 1 <=
/// chunk_size`; otherwise the chunk is sealed and the token starts the next
/// one. The first token of a chunk is always taken, so an oversized token
/// opens a chunk of its own and no chunk is ever empty. Calling again
/// restarts from the first chunk.
pub fn chunk_text(text: &str, chunk_size: usize) -> TextChunks<'_> {
    TextChunks {
        tokens: text.split_whitespace().peekable(),
        chunk_size,
    }
}

/// Lazy iterator returned by [`chunk_text`].
#[derive(Debug, Clone)]
pub struct TextChunks<'a> {
    tokens: Peekable<SplitWhitespace<'a>>,
    chunk_size: usize,
}

impl Iterator for TextChunks<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let first = self.tokens.next()?;
        let mut chunk = String::from(first);
        let mut tokens_in_chunk = 1;
        while let Some(token) = self.tokens.peek() {
            if tokens_in_chunk + token.chars().count() + 1 > self.chunk_size {
                break;
            }
            chunk.push(' ');
            chunk.push_str(token);
            tokens_in_chunk += 1;
            self.tokens.next();
        }
        Some(chunk)
    }
}

/// Chunks every document in order, tagging each chunk with its document.
pub fn chunk_documents(
    documents: &[Document],
    chunk_size: usize,
) -> impl Iterator<Item = Chunk> + '_ {
    documents.iter().enumerate().flat_map(move |(id, document)| {
        chunk_text(&document.text, chunk_size)
            .enumerate()
            .map(move |(sequence_index, text)| Chunk {
                document_id: DocumentId(id),
                sequence_index,
                text,
            })
    })
}
