// JSON record reader
// Reads newline-delimited or concatenated JSON objects from files, directories or globs

use crate::record::{Record, Value};
use crate::source::{RecordIter, RecordReader, SourceError};

use globset::GlobBuilder;
use serde_json::de::IoRead;
use serde_json::{Deserializer, Map, StreamDeserializer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const GLOB_CHARS: [char; 4] = ['*', '?', '[', '{'];

/// Reads JSON objects from local files
///
/// Locators are resolved against `base_dir`. A locator may name a file,
/// a directory (walked recursively for `*.json`) or a glob pattern.
#[derive(Debug, Clone)]
pub struct JsonLinesReader {
    base_dir: PathBuf,
}

impl JsonLinesReader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Expand a locator into the files it names, in a stable order
    pub fn resolve(&self, locator: &str) -> Result<Vec<PathBuf>, SourceError> {
        if locator.contains("://") {
            return Err(SourceError::Unsupported(locator.to_string()));
        }

        let full = self.base_dir.join(locator);
        if locator.contains(GLOB_CHARS) {
            return self.resolve_glob(locator, &full);
        }

        if full.is_file() {
            Ok(vec![full])
        } else if full.is_dir() {
            let files: Vec<PathBuf> = WalkDir::new(&full)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            Ok(files)
        } else {
            Err(SourceError::NotFound(full.display().to_string()))
        }
    }

    fn resolve_glob(&self, locator: &str, full: &Path) -> Result<Vec<PathBuf>, SourceError> {
        let pattern = full.to_string_lossy().to_string();
        let matcher = GlobBuilder::new(&pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| SourceError::Pattern {
                pattern: locator.to_string(),
                message: e.to_string(),
            })?
            .compile_matcher();

        // Walk from the deepest directory without wildcards
        let root: PathBuf = full
            .components()
            .take_while(|c| match c {
                Component::Normal(part) => !part.to_string_lossy().contains(GLOB_CHARS),
                _ => true,
            })
            .collect();

        let files: Vec<PathBuf> = WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && matcher.is_match(e.path()))
            .map(|e| e.into_path())
            .collect();

        if files.is_empty() {
            return Err(SourceError::NotFound(pattern));
        }
        Ok(files)
    }
}

impl RecordReader for JsonLinesReader {
    fn open(&self, locator: &str) -> Result<RecordIter, SourceError> {
        let files = self.resolve(locator)?;
        debug!(locator, files = files.len(), "opening JSON source");
        Ok(Box::new(JsonRecords {
            pending: files.into_iter(),
            current: None,
        }))
    }
}

type FileStream = StreamDeserializer<'static, IoRead<BufReader<File>>, Map<String, serde_json::Value>>;

struct JsonRecords {
    pending: std::vec::IntoIter<PathBuf>,
    current: Option<(PathBuf, FileStream)>,
}

impl Iterator for JsonRecords {
    type Item = Result<Record, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((path, stream)) = self.current.as_mut() {
                match stream.next() {
                    Some(Ok(object)) => {
                        return Some(Ok(object
                            .into_iter()
                            .map(|(field, value)| (field, Value::from_json(value)))
                            .collect()))
                    }
                    Some(Err(err)) => {
                        let path = path.clone();
                        // A broken stream cannot be resumed
                        self.current = None;
                        return Some(Err(convert(path, err)));
                    }
                    None => self.current = None,
                }
            }

            let path = self.pending.next()?;
            match File::open(&path) {
                Ok(file) => {
                    let stream = Deserializer::from_reader(BufReader::new(file)).into_iter();
                    self.current = Some((path, stream));
                }
                Err(source) => return Some(Err(SourceError::Io { path, source })),
            }
        }
    }
}

fn convert(path: PathBuf, err: serde_json::Error) -> SourceError {
    if err.is_io() {
        SourceError::Io {
            path,
            source: err.into(),
        }
    } else {
        SourceError::Malformed {
            path,
            line: err.line(),
            message: err.to_string(),
        }
    }
}
