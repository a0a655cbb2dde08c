//! EPUB books, one document per chapter.
//!
//! The container file points at the OPF package; the package manifest lists
//! the content files and the spine gives their reading order. Only XHTML
//! spine items are read, navigation documents and front/back matter are
//! skipped. A chapter begins at an `<h1>`; content files without a heading
//! are appended to the chapter before them.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use scraper::{ElementRef, Html, Selector};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::{collect_text, normalize_whitespace, Document, ExtractError, Result};

const CONTAINER_PATH: &str = "META-INF/container.xml";
const XHTML_MEDIA_TYPE: &str = "application/xhtml+xml";
const SKIPPED_PATH_MARKERS: &[&str] = &[
    "frontmatter",
    "backmatter",
    "cover",
    "copyright",
    "signup",
];
const BLOCK_SELECTOR: &str = "p, h1, h2, h3, h4, h5, h6, li, pre";

/// Reads every chapter of the EPUB at `path`.
pub fn read_epub(path: &Path) -> Result<Vec<Document>> {
    let file = File::open(path).map_err(|err| ExtractError::io(path, err))?;
    let mut archive = ZipArchive::new(file).map_err(|source| ExtractError::Archive {
        path: path.to_path_buf(),
        source,
    })?;

    let container = read_entry(&mut archive, CONTAINER_PATH)
        .map_err(|_| ExtractError::malformed(path, "missing META-INF/container.xml"))?;
    let package_path = package_path(&container)
        .ok_or_else(|| ExtractError::malformed(path, "container has no rootfile"))?;
    let package = read_entry(&mut archive, &package_path).map_err(|_| {
        ExtractError::malformed(path, format!("package {package_path} not in archive"))
    })?;
    let package = Package::parse(&package)
        .ok_or_else(|| ExtractError::malformed(path, "package has no metadata"))?;

    let book = package.title.clone().unwrap_or_else(|| {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let package_dir = match package_path.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/"),
        None => String::new(),
    };

    let mut chapters: Vec<Chapter> = Vec::new();
    for item in package.reading_order() {
        let item_path = format!("{package_dir}{}", item.href);
        if SKIPPED_PATH_MARKERS
            .iter()
            .any(|marker| item_path.contains(marker))
        {
            continue;
        }
        let Ok(content) = read_entry(&mut archive, &item_path) else {
            continue;
        };
        push_content(&mut chapters, &content);
    }

    Ok(chapters
        .into_iter()
        .map(|chapter| {
            let mut columns = BTreeMap::new();
            columns.insert("book".to_string(), book.clone());
            if let Some(author) = &package.author {
                columns.insert("author".to_string(), author.clone());
            }
            columns.insert("chapter".to_string(), chapter.title.clone());
            Document {
                source_path: path.to_path_buf(),
                display_name: format!("{book} - {}", chapter.title),
                text: chapter.text,
                links: Vec::new(),
                columns,
            }
        })
        .collect())
}

struct Chapter {
    title: String,
    text: String,
}

struct ManifestItem {
    id: String,
    href: String,
    media_type: String,
    properties: String,
}

struct Package {
    title: Option<String>,
    author: Option<String>,
    items: Vec<ManifestItem>,
    spine: Vec<String>,
}

impl Package {
    fn parse(source: &str) -> Option<Self> {
        // Package XML goes through the HTML parser on purpose. Prefixed names
        // such as `dc:title` are kept verbatim, but self-closing `<item/>` tags
        // nest inside each other, so lookups walk all descendants.
        let document = Html::parse_document(source);
        elements_named(&document, "metadata").next()?;

        let text_of = |name: &str| {
            elements_named(&document, name)
                .next()
                .map(|element| normalize_whitespace(&element.text().collect::<String>()))
                .filter(|text| !text.is_empty())
        };
        let title = text_of("dc:title");
        let author = text_of("dc:creator");

        let items = elements_named(&document, "item")
            .filter_map(|element| {
                let attrs = element.value();
                Some(ManifestItem {
                    id: attrs.attr("id")?.to_string(),
                    href: attrs.attr("href")?.to_string(),
                    media_type: attrs.attr("media-type").unwrap_or_default().to_string(),
                    properties: attrs.attr("properties").unwrap_or_default().to_string(),
                })
            })
            .collect();
        let spine = elements_named(&document, "itemref")
            .filter_map(|element| element.value().attr("idref").map(str::to_string))
            .collect();

        Some(Self {
            title,
            author,
            items,
            spine,
        })
    }

    fn reading_order(&self) -> impl Iterator<Item = &ManifestItem> + '_ {
        self.spine
            .iter()
            .filter_map(|idref| self.items.iter().find(|item| &item.id == idref))
            .filter(|item| item.media_type == XHTML_MEDIA_TYPE)
            .filter(|item| !item.properties.split_whitespace().any(|p| p == "nav"))
    }
}

fn package_path(container: &str) -> Option<String> {
    let document = Html::parse_document(container);
    let found = elements_named(&document, "rootfile")
        .find_map(|element| element.value().attr("full-path").map(str::to_string));
    found
}

fn elements_named<'a>(
    document: &'a Html,
    name: &'a str,
) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(move |element| element.value().name() == name)
}

fn push_content(chapters: &mut Vec<Chapter>, xhtml: &str) {
    let document = Html::parse_document(xhtml);
    let body_selector = Selector::parse("body").expect("body selector");
    let Some(body) = document.select(&body_selector).next() else {
        return;
    };

    let text = body_text(body);
    let heading_selector = Selector::parse("h1").expect("h1 selector");
    let heading = body
        .select(&heading_selector)
        .next()
        .map(|h1| normalize_whitespace(&h1.text().collect::<String>()))
        .filter(|title| !title.is_empty());

    let Some(title) = heading else {
        if let Some(previous) = chapters.last_mut() {
            if !text.is_empty() {
                previous.text.push('\n');
                previous.text.push_str(&text);
            }
        }
        return;
    };

    let text = match text.strip_prefix(title.as_str()) {
        Some(rest) => rest.trim().to_string(),
        None => text,
    };
    if text.is_empty() {
        return;
    }
    chapters.push(Chapter { title, text });
}

fn body_text(body: ElementRef<'_>) -> String {
    let selector = Selector::parse(BLOCK_SELECTOR).expect("block selector");
    let blocks: Vec<String> = body
        .select(&selector)
        .map(|block| {
            let mut buf = String::new();
            collect_text(&block, &mut buf);
            normalize_whitespace(&buf)
        })
        .filter(|text| !text.is_empty())
        .collect();
    if !blocks.is_empty() {
        return blocks.join("\n");
    }
    let mut buf = String::new();
    collect_text(&body, &mut buf);
    normalize_whitespace(&buf)
}

fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> std::result::Result<String, ZipError> {
    let mut entry = archive.by_name(name)?;
    let mut buf = String::new();
    entry.read_to_string(&mut buf)?;
    Ok(buf)
}
