//! Output artifact rendering and writes, plus the dashboard manifest.

use std::path::{Path, PathBuf};

use btpi_core::ManifestEntry;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::fs;
use tracing::info;

pub const CRATE_NAME: &str = "btpi-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("writing {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("creating directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid JSON data for {column} ({value}): {source}")]
    EmbeddedJson {
        column: String,
        value: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing row: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// First column carried a pre-encoded JSON array string.
    EmbeddedJson,
    RowObject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedOutput {
    pub mode: RenderMode,
    pub text: String,
}

/// Serializes `value` compactly when `spaces` is 0, otherwise pretty-printed
/// with a `spaces`-wide indent.
pub fn to_json_text<T: Serialize + ?Sized>(value: &T, spaces: usize) -> serde_json::Result<String> {
    if spaces == 0 {
        return serde_json::to_string(value);
    }
    let indent = " ".repeat(spaces);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut ser)?;
    // serde_json only ever emits UTF-8.
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Turns the first row of a result set into the text of its output artifact.
///
/// Keys are inspected in column order, so `row` must preserve insertion order.
pub fn render_first_row(row: &Map<String, Value>, spaces: usize) -> Result<RenderedOutput, RenderError> {
    if let Some((column, Value::String(raw))) = row.iter().next() {
        if raw.starts_with('[') {
            let parsed: Value =
                serde_json::from_str(raw).map_err(|source| RenderError::EmbeddedJson {
                    column: column.clone(),
                    value: raw.clone(),
                    source,
                })?;
            return Ok(RenderedOutput {
                mode: RenderMode::EmbeddedJson,
                text: to_json_text(&parsed, spaces)?,
            });
        }
    }

    Ok(RenderedOutput {
        mode: RenderMode::RowObject,
        text: to_json_text(row, spaces)?,
    })
}

async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
    }
    Ok(())
}

/// Writes query output files. Plain overwrite; a reader may observe a partial file.
#[derive(Debug, Clone, Default)]
pub struct OutputStore;

impl OutputStore {
    pub fn new() -> Self {
        Self
    }

    pub async fn write_text(&self, path: impl AsRef<Path>, text: &str) -> Result<(), StorageError> {
        let path = path.as_ref();
        ensure_parent(path).await?;
        fs::write(path, text.as_bytes())
            .await
            .map_err(|source| StorageError::Write {
                path: path.display().to_string(),
                source,
            })
    }
}

#[derive(Debug, Clone)]
pub struct ManifestWriter {
    path: PathBuf,
    public_root: PathBuf,
}

impl ManifestWriter {
    pub fn new(path: impl Into<PathBuf>, public_root: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            public_root: public_root.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn root_str(&self) -> String {
        let raw = self.public_root.to_string_lossy().replace('\\', "/");
        raw.trim_start_matches("./").trim_end_matches('/').to_string()
    }

    /// Strips the public root from an output path so the dashboard can fetch
    /// it relative to the site root.
    pub fn sanitize(&self, file: &str) -> String {
        let root = self.root_str();
        if root.is_empty() || root == "." {
            return file.to_string();
        }

        let normalized = file.replace('\\', "/");
        let trimmed = normalized.trim_start_matches("./");
        if let Ok(rel) = Path::new(trimmed).strip_prefix(Path::new(&root)) {
            return rel.to_string_lossy().replace('\\', "/");
        }

        let marker = format!("{root}/");
        if Path::new(trimmed).is_absolute() && !Path::new(&root).is_absolute() {
            if let Some(rel) = self.strip_absolute_root(Path::new(trimmed)) {
                return rel;
            }
            // Relative root somewhere inside an absolute path: drop everything up to it.
            let segment = format!("/{marker}");
            if let Some(at) = trimmed.find(&segment) {
                return trimmed[at + segment.len()..].to_string();
            }
        }
        normalized.replacen(&marker, "", 1)
    }

    /// Strips the public root resolved against the filesystem, then against
    /// the working directory.
    fn strip_absolute_root(&self, file: &Path) -> Option<String> {
        let candidates = [
            std::fs::canonicalize(&self.public_root).ok(),
            std::env::current_dir().ok().map(|cwd| cwd.join(&self.public_root)),
        ];
        candidates
            .into_iter()
            .flatten()
            .find_map(|root| file.strip_prefix(&root).ok().map(|rel| rel.to_path_buf()))
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
    }

    pub fn entry_for(&self, name: &str, title: &str, file: &str) -> ManifestEntry {
        ManifestEntry {
            name: name.to_string(),
            title: title.to_string(),
            file: self.sanitize(file),
        }
    }

    /// Replaces the manifest wholesale; entries keep the order given.
    pub async fn write(&self, entries: &[ManifestEntry]) -> Result<(), StorageError> {
        let text = serde_json::to_string(entries).map_err(|source| StorageError::Serialize {
            what: "manifest",
            source,
        })?;
        ensure_parent(&self.path).await?;
        fs::write(&self.path, text.as_bytes())
            .await
            .map_err(|source| StorageError::Write {
                path: self.path.display().to_string(),
                source,
            })?;
        info!(path = %self.path.display(), entries = entries.len(), "manifest written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn row(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn embedded_json_string_is_reserialized() {
        let r = row(json!({"JSON_F52E2B61": "[{\"a\":1},{\"a\":2}]", "other": 5}));
        let out = render_first_row(&r, 2).unwrap();
        assert_eq!(out.mode, RenderMode::EmbeddedJson);
        let expected = serde_json::to_string_pretty(&json!([{"a": 1}, {"a": 2}])).unwrap();
        assert_eq!(out.text, expected);
    }

    #[test]
    fn invalid_embedded_json_is_an_error() {
        let r = row(json!({"payload": "[{\"a\":"}));
        let err = render_first_row(&r, 0).unwrap_err();
        assert!(matches!(err, RenderError::EmbeddedJson { ref column, .. } if column == "payload"));
    }

    #[test]
    fn only_the_first_column_is_inspected() {
        let r = row(json!({"id": 7, "payload": "[1,2,3]"}));
        let out = render_first_row(&r, 0).unwrap();
        assert_eq!(out.mode, RenderMode::RowObject);
        assert_eq!(out.text, r#"{"id":7,"payload":"[1,2,3]"}"#);
    }

    #[test]
    fn strings_not_starting_with_bracket_stay_row_objects() {
        let r = row(json!({"name": "{\"a\":1}"}));
        let out = render_first_row(&r, 0).unwrap();
        assert_eq!(out.mode, RenderMode::RowObject);
    }

    #[test]
    fn indent_width_is_configurable() {
        let text = to_json_text(&json!({"a": [1]}), 4).unwrap();
        assert_eq!(text, "{\n    \"a\": [\n        1\n    ]\n}");
    }

    #[test]
    fn sanitize_strips_public_root() {
        let w = ManifestWriter::new("public/data/queryList.json", "public");
        assert_eq!(w.sanitize("public/data/orders.json"), "data/orders.json");
        assert_eq!(w.sanitize("./public/data/orders.json"), "data/orders.json");
        assert_eq!(w.sanitize("data/orders.json"), "data/orders.json");

        let w = ManifestWriter::new("x", "./public/");
        assert_eq!(w.sanitize("public/data/orders.json"), "data/orders.json");
    }

    #[test]
    fn sanitized_paths_never_contain_the_root_prefix() {
        let w = ManifestWriter::new("x", "/srv/btpi/public");
        for file in [
            "/srv/btpi/public/data/a.json",
            "/srv/btpi/public/b.json",
            "reports//srv/btpi/public/c.json",
        ] {
            let out = w.sanitize(file);
            assert!(!out.starts_with("/srv/btpi/public/"), "{out}");
        }
    }

    #[test]
    fn absolute_outputs_under_a_relative_root_lose_the_server_prefix() {
        let w = ManifestWriter::new("x", "public");
        assert_eq!(w.sanitize("/srv/app/public/data/x.json"), "data/x.json");

        let cwd = std::env::current_dir().unwrap();
        let file = cwd.join("public").join("reports").join("y.json");
        assert_eq!(w.sanitize(&file.display().to_string()), "reports/y.json");
    }

    #[tokio::test]
    async fn manifest_write_replaces_previous_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data").join("queryList.json");
        let w = ManifestWriter::new(&path, dir.path());

        let first = vec![
            w.entry_for("a", "A", "a.json"),
            w.entry_for("b", "B", "b.json"),
        ];
        w.write(&first).await.expect("first write");
        w.write(&[w.entry_for("c", "C", "c.json")]).await.expect("second write");

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<ManifestEntry> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "c");
    }

    #[tokio::test]
    async fn output_store_overwrites() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let store = OutputStore::new();
        store.write_text(&path, "[1,2,3,4]").await.unwrap();
        store.write_text(&path, "[]").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
    }
}
