#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use fractal_embeddings::embedder::{RateLimit, Truncate};
use fractal_embeddings::{
    EmbedRequest, EmbedSettings, EmbeddingService, InputFolder, PipelineConfig, ServiceError,
};

pub const CHUNK_SIZE: usize = 12;
pub const BATCH_SIZE: usize = 4;

pub const OWNERSHIP: &str = "Every value in Rust has a single owner. When the owner goes out \
    of scope the value is dropped. Moving a value transfers ownership, and [[borrowing]] lets \
    code read a value without taking it. Mutable borrows are exclusive.";

pub const TRAITS: &str = "# Traits\n\nA trait names a set of methods a type promises to \
    provide. Generic functions bound their parameters by traits, and trait objects allow \
    dynamic dispatch through a vtable. Blanket impls cover every type meeting a bound.";

/// Deterministic in-process embedding service: character class histograms.
#[derive(Default)]
pub struct HashingService {
    calls: AtomicUsize,
    texts: AtomicUsize,
    delay: Duration,
    fail_from_call: Option<usize>,
}

impl HashingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn failing_from(call: usize) -> Self {
        Self {
            fail_from_call: Some(call),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

impl EmbeddingService for HashingService {
    fn embed(&self, request: &EmbedRequest<'_>) -> Result<Vec<Vec<f32>>, ServiceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_from_call.is_some_and(|from| call >= from) {
            return Err(ServiceError::transient("503 service unavailable"));
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        assert_eq!(request.truncate, Truncate::End);
        self.texts.fetch_add(request.texts.len(), Ordering::SeqCst);
        Ok(request.texts.iter().map(|text| vector_for(text)).collect())
    }
}

pub fn vector_for(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; 8];
    let mut total = 0.0f32;
    for c in text.chars() {
        vector[(c as usize) % 7] += 1.0;
        total += 1.0;
    }
    for value in vector.iter_mut().take(7) {
        *value /= total.max(1.0);
    }
    vector[7] = total / 40.0;
    vector
}

/// Writes two single-file datasets and returns their input folders.
pub fn write_corpus(root: &Path) -> Vec<InputFolder> {
    let notes = root.join("notes");
    let essays = root.join("essays");
    fs::create_dir_all(&notes).unwrap();
    fs::create_dir_all(&essays).unwrap();
    fs::write(notes.join("ownership.txt"), OWNERSHIP).unwrap();
    fs::write(essays.join("traits.md"), TRAITS).unwrap();
    vec![
        InputFolder::new(notes, ["txt"]),
        InputFolder::new(essays, ["md"]),
    ]
}

pub fn config(output_dir: &Path, inputs: Vec<InputFolder>) -> PipelineConfig {
    PipelineConfig {
        inputs,
        output_dir: output_dir.to_path_buf(),
        embed: EmbedSettings {
            model: "hashing".into(),
            chunk_size: CHUNK_SIZE,
            batch_size: BATCH_SIZE,
            truncate: Truncate::End,
            rate_limit: RateLimit {
                calls: 1,
                per: Duration::from_millis(10),
            },
        },
        ..PipelineConfig::default()
    }
}

/// File name to contents for every file directly under `dir`.
pub fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.is_file())
        .map(|path| {
            let bytes = fs::read(&path).unwrap();
            (path, bytes)
        })
        .collect()
}

pub fn artifact_names(dir: &Path) -> Vec<String> {
    snapshot(dir)
        .keys()
        .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
        .collect()
}
