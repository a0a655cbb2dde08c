//! On-disk artifact cache gating every pipeline stage.
//!
//! An artifact is looked up by a [`CacheKey`] before its stage runs. When the
//! file exists it is loaded and the stage is skipped; otherwise the stage
//! computes the value, which is written to a temporary sibling and renamed
//! into place. A failed stage therefore never leaves a partial artifact.
//!
//! There is no automatic invalidation. With [`KeyPolicy::Named`] keys are the
//! legible dataset/method names only, so changed inputs under an unchanged
//! name reuse the old artifact. [`KeyPolicy::Fingerprinted`] appends a CRC32
//! of the stage's input identity to the name instead.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{CacheError, PipelineError, Result};

const MATRIX_MAGIC: [u8; 4] = *b"FEMX";
const MATRIX_VERSION: u8 = 1;

/// Physical artifact encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    /// Pretty JSON, used for tabular extraction results.
    Json,
    /// Versioned bincode, used for matrix + label pairs.
    Matrix,
}

impl ArtifactFormat {
    fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Matrix => "bin",
        }
    }
}

/// A value that can be persisted by [`CacheStore`].
pub trait Artifact: Sized {
    /// Encoding used on disk.
    const FORMAT: ArtifactFormat;

    /// Writes the artifact.
    fn encode(&self, writer: &mut dyn Write) -> std::result::Result<(), CacheError>;

    /// Reads an artifact written by [`Artifact::encode`].
    fn decode(reader: &mut dyn Read) -> std::result::Result<Self, CacheError>;
}

/// Encodes `value` as pretty JSON.
pub fn encode_json<T: Serialize>(
    value: &T,
    writer: &mut dyn Write,
) -> std::result::Result<(), CacheError> {
    serde_json::to_writer_pretty(&mut *writer, value)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Decodes a JSON artifact.
pub fn decode_json<T: DeserializeOwned>(
    reader: &mut dyn Read,
) -> std::result::Result<T, CacheError> {
    Ok(serde_json::from_reader(reader)?)
}

/// Encodes `value` behind the matrix header.
pub fn encode_matrix<T: Serialize>(
    value: &T,
    writer: &mut dyn Write,
) -> std::result::Result<(), CacheError> {
    writer.write_all(&MATRIX_MAGIC)?;
    writer.write_all(&[MATRIX_VERSION])?;
    bincode::serialize_into(writer, value)?;
    Ok(())
}

/// Decodes a matrix artifact, checking its header.
pub fn decode_matrix<T: DeserializeOwned>(
    reader: &mut dyn Read,
) -> std::result::Result<T, CacheError> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if header[..4] != MATRIX_MAGIC || header[4] != MATRIX_VERSION {
        return Err(CacheError::BadHeader);
    }
    Ok(bincode::deserialize_from(reader)?)
}

/// How cache file names are derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Legible names only; inputs changed under the same name are not noticed.
    Named,
    /// Legible names suffixed with a fingerprint of the stage inputs.
    #[default]
    Fingerprinted,
}

/// Identifies one artifact inside the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: String,
    fingerprint: Option<u32>,
}

impl CacheKey {
    /// Key with a legible name and no fingerprint.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fingerprint: None,
        }
    }

    /// Extracted document table of a dataset.
    pub fn table(dataset: &str) -> Self {
        Self::named(dataset)
    }

    /// Embedding matrix of a dataset.
    pub fn embeddings(dataset: &str) -> Self {
        Self::named(format!("{dataset}_embeddings"))
    }

    /// Embedding matrix of all datasets combined.
    pub fn combined() -> Self {
        Self::named("combined_embeddings")
    }

    /// Reduced matrix for a reduction such as `pca5`.
    pub fn reduction(method: &str) -> Self {
        Self::named(format!("{method}_embeddings"))
    }

    /// Attaches an input fingerprint.
    pub fn with_fingerprint(mut self, fingerprint: u32) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    /// Legible part of the key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File name for the given format.
    pub fn file_name(&self, format: ArtifactFormat) -> String {
        match self.fingerprint {
            Some(fingerprint) => format!("{}.{fingerprint:08x}.{}", self.name, format.extension()),
            None => format!("{}.{}", self.name, format.extension()),
        }
    }
}

/// CRC32 accumulator over stage input identity.
#[derive(Default)]
pub struct Fingerprint {
    hasher: crc32fast::Hasher,
}

impl Fingerprint {
    /// Starts an empty fingerprint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mixes in raw bytes, length-prefixed so adjacent fields stay distinct.
    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    /// Mixes in a string.
    pub fn str(self, value: &str) -> Self {
        self.bytes(value.as_bytes())
    }

    /// Mixes in an integer.
    pub fn u64(mut self, value: u64) -> Self {
        self.hasher.update(&value.to_le_bytes());
        self
    }

    /// Final checksum.
    pub fn finish(self) -> u32 {
        self.hasher.finalize()
    }
}

/// Artifact store rooted at the pipeline output directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    policy: KeyPolicy,
    force: bool,
}

impl CacheStore {
    /// Creates a store; the directory is created on first write.
    pub fn new(root: impl Into<PathBuf>, policy: KeyPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
            force: false,
        }
    }

    /// Recompute every artifact even when present on disk.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Output directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Applies the key policy: keeps or drops the input fingerprint.
    pub fn key(&self, key: CacheKey, fingerprint: u32) -> CacheKey {
        match self.policy {
            KeyPolicy::Named => key,
            KeyPolicy::Fingerprinted => key.with_fingerprint(fingerprint),
        }
    }

    /// Like [`CacheStore::key`], but only computes the fingerprint when the
    /// policy keeps it.
    pub fn key_with<F>(&self, key: CacheKey, fingerprint: F) -> Result<CacheKey>
    where
        F: FnOnce() -> Result<u32>,
    {
        match self.policy {
            KeyPolicy::Named => Ok(key),
            KeyPolicy::Fingerprinted => Ok(key.with_fingerprint(fingerprint()?)),
        }
    }

    /// Location of the artifact for `key`.
    pub fn path_for<T: Artifact>(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name(T::FORMAT))
    }

    /// Whether an artifact is present (and would be served) for `key`.
    pub fn contains<T: Artifact>(&self, key: &CacheKey) -> bool {
        !self.force && self.path_for::<T>(key).is_file()
    }

    /// Returns the cached artifact for `key`, computing and persisting it on a
    /// miss. `compute` is not invoked on a hit.
    pub fn get_or_compute<T, F>(&self, key: &CacheKey, compute: F) -> Result<T>
    where
        T: Artifact,
        F: FnOnce() -> Result<T>,
    {
        let path = self.path_for::<T>(key);
        if self.contains::<T>(key) {
            info!(artifact = %path.display(), "artifact cached, skipping stage");
            return self.load(&path);
        }
        let value = compute()?;
        self.store(&path, &value)?;
        info!(artifact = %path.display(), "artifact written");
        Ok(value)
    }

    fn load<T: Artifact>(&self, path: &Path) -> Result<T> {
        let file = File::open(path).map_err(|err| PipelineError::cache(path, err))?;
        let mut reader = BufReader::new(file);
        T::decode(&mut reader).map_err(|err| PipelineError::cache(path, err))
    }

    fn store<T: Artifact>(&self, path: &Path, value: &T) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|err| PipelineError::cache(&self.root, err))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = path.with_file_name(format!("{file_name}.tmp"));
        if let Err(err) = write_artifact(&staging, value) {
            let _ = fs::remove_file(&staging);
            return Err(PipelineError::cache(&staging, err));
        }
        fs::rename(&staging, path).map_err(|err| PipelineError::cache(path, err))?;
        debug!(artifact = %path.display(), "artifact renamed into place");
        Ok(())
    }
}

fn write_artifact<T: Artifact>(path: &Path, value: &T) -> std::result::Result<(), CacheError> {
    let mut writer = BufWriter::new(File::create(path)?);
    value.encode(&mut writer)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use std::cell::Cell;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        title: String,
        words: usize,
    }

    impl Artifact for Note {
        const FORMAT: ArtifactFormat = ArtifactFormat::Json;

        fn encode(&self, writer: &mut dyn Write) -> std::result::Result<(), CacheError> {
            encode_json(self, writer)
        }

        fn decode(reader: &mut dyn Read) -> std::result::Result<Self, CacheError> {
            decode_json(reader)
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pairs(Vec<(f32, String)>);

    impl Artifact for Pairs {
        const FORMAT: ArtifactFormat = ArtifactFormat::Matrix;

        fn encode(&self, writer: &mut dyn Write) -> std::result::Result<(), CacheError> {
            encode_matrix(self, writer)
        }

        fn decode(reader: &mut dyn Read) -> std::result::Result<Self, CacheError> {
            decode_matrix(reader)
        }
    }

    fn note() -> Note {
        Note {
            title: "ownership".into(),
            words: 42,
        }
    }

    #[test]
    fn second_lookup_skips_compute() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path(), KeyPolicy::Named);
        let key = CacheKey::table("notes");
        let calls = Cell::new(0);

        for _ in 0..2 {
            let value = store
                .get_or_compute(&key, || {
                    calls.set(calls.get() + 1);
                    Ok(note())
                })
                .unwrap();
            assert_eq!(value, note());
        }
        assert_eq!(calls.get(), 1);
        assert!(dir.path().join("notes.json").is_file());
    }

    #[test]
    fn failed_compute_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path(), KeyPolicy::Named);
        let key = CacheKey::table("notes");

        let result: Result<Note> = store.get_or_compute(&key, || Err(PipelineError::Cancelled));
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert!(!store.contains::<Note>(&key));
    }

    #[test]
    fn force_recomputes() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::table("notes");
        CacheStore::new(dir.path(), KeyPolicy::Named)
            .get_or_compute(&key, || Ok(note()))
            .unwrap();

        let forced = CacheStore::new(dir.path(), KeyPolicy::Named).with_force(true);
        let calls = Cell::new(0);
        forced
            .get_or_compute(&key, || {
                calls.set(calls.get() + 1);
                Ok(note())
            })
            .unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn matrix_format_round_trips_and_checks_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path(), KeyPolicy::Named);
        let key = CacheKey::reduction("pca2");
        let pairs = Pairs(vec![(0.25, "a".into()), (1.0, "b".into())]);
        store.get_or_compute(&key, || Ok(pairs.clone())).unwrap();

        let loaded: Pairs = store.get_or_compute(&key, || unreachable!()).unwrap();
        assert_eq!(loaded, pairs);

        let path = store.path_for::<Pairs>(&key);
        assert_eq!(path.file_name().unwrap(), "pca2_embeddings.bin");
        fs::write(&path, b"JUNKJUNK").unwrap();
        match store.get_or_compute::<Pairs, _>(&key, || unreachable!()) {
            Err(PipelineError::Cache {
                source: CacheError::BadHeader,
                ..
            }) => {}
            other => panic!("expected bad header, got {other:?}"),
        }
    }

    #[test]
    fn fingerprint_policy_changes_file_name() {
        let named = CacheStore::new("out", KeyPolicy::Named);
        let hashed = CacheStore::new("out", KeyPolicy::Fingerprinted);
        let fp = Fingerprint::new().str("notes").u64(3).finish();

        let plain = named.key(CacheKey::embeddings("notes"), fp);
        assert_eq!(plain.file_name(ArtifactFormat::Matrix), "notes_embeddings.bin");

        let keyed = hashed.key(CacheKey::embeddings("notes"), fp);
        assert_eq!(
            keyed.file_name(ArtifactFormat::Matrix),
            format!("notes_embeddings.{fp:08x}.bin")
        );
    }

    #[test]
    fn fingerprint_separates_fields() {
        let ab = Fingerprint::new().str("ab").str("c").finish();
        let a_bc = Fingerprint::new().str("a").str("bc").finish();
        assert_ne!(ab, a_bc);
    }

    #[test]
    fn named_policy_never_computes_fingerprint() {
        let named = CacheStore::new("out", KeyPolicy::Named);
        let key = named
            .key_with(CacheKey::table("notes"), || Err(PipelineError::Cancelled))
            .unwrap();
        assert_eq!(key.file_name(ArtifactFormat::Json), "notes.json");

        let hashed = CacheStore::new("out", KeyPolicy::Fingerprinted);
        let key = hashed.key_with(CacheKey::table("notes"), || Ok(7)).unwrap();
        assert_eq!(key.file_name(ArtifactFormat::Json), "notes.00000007.json");
    }
}
