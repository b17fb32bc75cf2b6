use crate::error::{LoadError, UploadError};
use crate::models::{Cell, Table};
use log::{debug, error, info, warn};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Cell contents treated as "no value", matching what common dataframe CSV
/// readers map to NaN.
const MISSING_MARKERS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// Load the cutoff table at `path`. Any failure is logged and yields an empty table.
pub fn load(path: &Path) -> Table {
    match try_load(path) {
        Ok(table) => {
            info!("Successfully loaded data with {} rows from {}", table.len(), path.display());
            info!("CSV columns: {:?}", table.columns());
            table
        }
        Err(e) => {
            error!("Error loading CSV {}: {}", path.display(), e);
            Table::empty()
        }
    }
}

pub fn try_load(path: &Path) -> Result<Table, LoadError> {
    let file = fs::File::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_reader(file)
}

/// Parse comma-delimited data with a header row. Header names are kept verbatim.
pub fn parse_reader<R: Read>(input: R) -> Result<Table, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input);

    let columns: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();

    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result?;
        // extra fields would shift cutoffs into the wrong category columns
        if record.len() > columns.len() {
            return Err(LoadError::RaggedRow {
                line: record.position().map(|p| p.line()).unwrap_or(i as u64 + 2),
                expected: columns.len(),
                found: record.len(),
            });
        }
        rows.push(record.iter().map(parse_cell).collect::<Vec<Cell>>());
    }

    let table = Table::new(columns, rows);
    if let Some(column) = table.missing_required() {
        return Err(LoadError::MissingColumn(column));
    }
    Ok(table)
}

fn parse_cell(raw: &str) -> Cell {
    if MISSING_MARKERS.contains(&raw) {
        Cell::Missing
    } else {
        Cell::Text(raw.to_string())
    }
}

/// A loaded table together with the reload generation that produced it.
#[derive(Debug)]
pub struct Snapshot {
    pub version: u64,
    pub table: Table,
}

/// Owner of the current table snapshot and its backing file.
///
/// Readers clone the `Arc` and never block each other. Reloads are serialized on
/// `reload_lock` and only hold the write lock for the pointer swap, so a reader
/// sees either the complete old table or the complete new one.
pub struct DatasetStore {
    path: PathBuf,
    current: RwLock<Arc<Snapshot>>,
    reload_lock: Mutex<()>,
}

impl DatasetStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let table = load(&path);
        Self {
            path,
            current: RwLock::new(Arc::new(Snapshot { version: 1, table })),
            reload_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Re-read the backing file and swap it in wholesale.
    pub fn reload(&self) -> Arc<Snapshot> {
        let _serial = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.reload_serialized()
    }

    fn reload_serialized(&self) -> Arc<Snapshot> {
        let table = load(&self.path);
        let version = self.snapshot().version + 1;
        let snapshot = Arc::new(Snapshot { version, table });

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::clone(&snapshot);
        debug!("Swapped in dataset version {}", version);
        snapshot
    }

    /// Replace the backing file with uploaded content and reload.
    ///
    /// The content is checked before anything is written: a wrong extension or
    /// a file that does not parse into a table with the required columns leaves
    /// both the backing file and the loaded table untouched.
    pub fn upload(&self, file_name: &str, content: &[u8], extension: &str) -> Result<Arc<Snapshot>, UploadError> {
        if !has_extension(file_name, extension) {
            warn!("Invalid file format for upload: {}", file_name);
            return Err(UploadError::BadExtension {
                file_name: file_name.to_string(),
                expected: extension.to_string(),
            });
        }

        if let Err(e) = parse_reader(content) {
            warn!("Rejected upload {}: {}", file_name, e);
            return Err(UploadError::Invalid(e));
        }

        let _serial = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.persist(content)?;
        let snapshot = self.reload_serialized();
        info!(
            "CSV {} uploaded and reloaded successfully (version {}, {} rows)",
            file_name,
            snapshot.version,
            snapshot.table.len()
        );
        Ok(snapshot)
    }

    pub fn upload_file(&self, source: &Path, extension: &str) -> Result<Arc<Snapshot>, UploadError> {
        let content = fs::read(source).map_err(|e| {
            UploadError::Invalid(LoadError::Io {
                path: source.to_path_buf(),
                source: e,
            })
        })?;
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        self.upload(file_name, &content, extension)
    }

    /// Write through a sibling temp file so the backing file is never half-written.
    fn persist(&self, content: &[u8]) -> Result<(), UploadError> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".upload");
        let tmp_path = PathBuf::from(tmp_name);

        let io_err = |source| UploadError::Io {
            path: self.path.clone(),
            source,
        };
        fs::write(&tmp_path, content).map_err(io_err)?;
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}

fn has_extension(file_name: &str, extension: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(extension.trim_start_matches('.')))
        .unwrap_or(false)
}
