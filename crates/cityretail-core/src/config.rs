use std::path::{Path, PathBuf};

use crate::error::Result;

/// Runtime configuration, read once at process entry and carried through the
/// run context. Nothing here is consulted as ambient state after startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub data_root: PathBuf,
}

impl Config {
    /// Read configuration from the environment. `DATABASE_URL` (or
    /// `CITYRETAIL_DATABASE_URL`) is required; `DATA_PATH` defaults to `data`
    /// relative to the working directory.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .or_else(|_| std::env::var("CITYRETAIL_DATABASE_URL"))?;
        let data_root = std::env::var("DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        Ok(Self {
            database_url,
            data_root,
        })
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_root.join("raw")
    }

    pub fn cleaned_dir(&self) -> PathBuf {
        self.data_root.join("cleaned")
    }

    pub fn raw_file(&self, file_name: &str) -> PathBuf {
        self.raw_dir().join(file_name)
    }
}

/// Logical source file names under the raw data directory.
pub const CALENDAR_FILE: &str = "calendar.csv";
pub const PRODUCTS_FILE: &str = "products.csv";
pub const STORES_FILE: &str = "stores.csv";
pub const SALES_FILE: &str = "sales.csv";
/// Optional city-name standardization lookup.
pub const CITIES_LOOKUP_FILE: &str = "cities_lookup.csv";

pub fn cleaned_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(file_name)
}
