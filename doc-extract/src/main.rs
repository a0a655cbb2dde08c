use std::env;
use std::path::{Path, PathBuf};
use std::process;

use doc_extract::{read_epub, read_plain, Document};

const HELP: &str = "Options:
  --summary       Print one line per file instead of JSON
  -h, --help      Show this message
  -V, --version   Print package version";

#[derive(Default)]
struct Options {
    summary: bool,
    files: Vec<PathBuf>,
}

fn main() {
    let program = env::args()
        .next()
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
    match parse_options(env::args().skip(1), &program) {
        Ok(Some(options)) => {
            if let Err(err) = run(&options) {
                eprintln!("{}: {err}", env!("CARGO_PKG_NAME"));
                process::exit(1);
            }
        }
        Ok(None) => {}
        Err(err) => {
            eprintln!("{err}");
            process::exit(2);
        }
    }
}

/// `Ok(None)` when help or version was printed.
fn parse_options(
    args: impl Iterator<Item = String>,
    program: &str,
) -> Result<Option<Options>, String> {
    let mut options = Options::default();
    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{}\n\n{HELP}", usage(program));
                return Ok(None);
            }
            "-V" | "--version" => {
                println!("{}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "--summary" => options.summary = true,
            flag if flag.starts_with('-') => {
                return Err(format!("unknown option: {flag}\n{}", usage(program)));
            }
            _ => options.files.push(PathBuf::from(arg)),
        }
    }
    if options.files.is_empty() {
        return Err(usage(program));
    }
    Ok(Some(options))
}

fn run(options: &Options) -> Result<(), String> {
    let mut documents = Vec::new();
    for path in &options.files {
        let extracted = extract(path)?;
        if options.summary {
            let words: usize = extracted
                .iter()
                .map(|doc| doc.text.split_whitespace().count())
                .sum();
            println!(
                "{}: {} documents, {words} words",
                path.display(),
                extracted.len()
            );
        }
        documents.extend(extracted);
    }
    if !options.summary {
        let json = serde_json::to_string_pretty(&documents)
            .map_err(|err| format!("failed to serialize JSON: {err}"))?;
        println!("{json}");
    }
    Ok(())
}

fn extract(path: &Path) -> Result<Vec<Document>, String> {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "txt" | "md" => read_plain(path)
            .map(|document| vec![document])
            .map_err(|err| err.to_string()),
        "epub" => read_epub(path).map_err(|err| err.to_string()),
        other => Err(format!(
            "unsupported file extension '{other}' for {}",
            path.display()
        )),
    }
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {program} [--summary] FILE...\n\n\
         Prints the documents extracted from .txt, .md and .epub files as one JSON array."
    )
}
