use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const COLLEGE_CODE: &str = "College Code";
pub const COLLEGE_NAME: &str = "College Name";
pub const BRANCH: &str = "Branch";

/// Columns every non-empty cutoff table must carry. Everything else is a category.
pub const REQUIRED_COLUMNS: [&str; 3] = [COLLEGE_CODE, COLLEGE_NAME, BRANCH];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backing CSV file; uploads overwrite it.
    pub data_file: String,
    pub upload_extension: String,
    pub log_level: String,
    pub fetch_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_file: "kcet_cutoff_data_finale.csv".to_string(),
            upload_extension: "csv".to_string(),
            log_level: "info".to_string(),
            fetch_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn load_from_file(file_path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(file_path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, file_path: &str) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(file_path, content)?;
        Ok(())
    }
}

/// A raw table cell as read from the backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Missing,
    Text(String),
}

impl Cell {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            Cell::Missing => None,
        }
    }
}

/// In-memory cutoff table. Column names are kept exactly as they appear in the
/// header row; category columns are whatever is left after the required ones.
#[derive(Debug, Clone, Default)]
pub struct Table {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table, padding short rows with `Cell::Missing`. Rows longer than
    /// the header are rejected by the loader before they get here.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        let mut index = HashMap::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            // first occurrence wins on duplicate headers
            index.entry(name.clone()).or_insert(i);
        }

        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut cells| {
                cells.resize(width, Cell::Missing);
                cells
            })
            .collect();

        Self { columns, index, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn category_columns(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns
            .iter()
            .map(String::as_str)
            .filter(|name| !REQUIRED_COLUMNS.contains(name))
    }

    pub fn is_category(&self, name: &str) -> bool {
        !REQUIRED_COLUMNS.contains(&name) && self.index.contains_key(name)
    }

    pub fn missing_required(&self) -> Option<&'static str> {
        REQUIRED_COLUMNS
            .iter()
            .copied()
            .find(|name| !self.index.contains_key(*name))
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> + '_ {
        self.rows.iter().map(move |cells| Row { table: self, cells })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

static MISSING: Cell = Cell::Missing;

#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    table: &'a Table,
    cells: &'a [Cell],
}

impl<'a> Row<'a> {
    pub fn get(&self, column: &str) -> &'a Cell {
        self.table
            .column_index(column)
            .and_then(|i| self.cells.get(i))
            .unwrap_or(&MISSING)
    }

    pub fn text(&self, column: &str) -> Option<&'a str> {
        self.get(column).as_text()
    }
}

/// One eligible college/branch for the requested category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollegeCutoff {
    pub code: String,
    pub name: String,
    pub branch: String,
    pub cutoff: i64,
}

/// Query as received from a caller, before any validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawQuery {
    #[serde(default)]
    pub rank: Option<serde_json::Value>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictQuery {
    pub rank: i64,
    pub category: String,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredictResponse {
    Colleges { colleges: Vec<CollegeCutoff> },
    Error { error: String },
}
