// SPDX-License-Identifier: MPL-2.0

//! Credential store
//!
//! User records are kept in a CSV file whose header names the `username`,
//! `password` and `role` columns in any order. Lines starting with `#` and
//! blank lines are skipped. The file is read on every lookup so edits take
//! effect without a restart.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::errors::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserData {
    pub username: String,
    pub password: String,
    pub role: String,
}

pub trait CredentialStore: Send + Sync {
    fn lookup(&self, username: &str) -> Option<UserData>;
}

/// Open a credential store from a location string (`file://...` or a path)
pub fn open_user_db(location: &str) -> Result<Box<dyn CredentialStore>, ConfigError> {
    let path = match location.split_once("://") {
        Some(("file", path)) => path,
        Some(_) => return Err(ConfigError::UnsupportedUserDb(location.to_string())),
        None => location,
    };
    if path.is_empty() {
        return Err(ConfigError::UnsupportedUserDb(location.to_string()));
    }

    let db = CsvUserDb::new(path);
    if !db.path().exists() {
        warn!(path = %db.path().display(), "User database does not exist yet");
    }
    Ok(Box::new(db))
}

#[derive(Debug, Clone)]
pub struct CsvUserDb {
    path: PathBuf,
    separator: char,
}

struct Columns {
    username: usize,
    password: usize,
    role: usize,
}

impl CsvUserDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            separator: ',',
        }
    }

    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        line.split(self.separator).map(str::trim).collect()
    }

    fn header(&self, line: &str) -> Option<Columns> {
        let fields = self.split(line);
        let find = |name: &str| fields.iter().position(|f| f.eq_ignore_ascii_case(name));
        Some(Columns {
            username: find("username")?,
            password: find("password")?,
            role: find("role")?,
        })
    }

    /// Find `username` in CSV content
    pub fn lookup_in<R: BufRead>(&self, reader: R, username: &str) -> Option<UserData> {
        let mut columns: Option<Columns> = None;

        for (number, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "Failed to read user database");
                    return None;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if columns.is_none() {
                columns = self.header(trimmed);
                if columns.is_none() {
                    error!(
                        path = %self.path.display(),
                        "User database header must name username, password and role"
                    );
                    return None;
                }
                continue;
            }
            let Some(cols) = columns.as_ref() else {
                continue;
            };

            let fields = self.split(trimmed);
            let (Some(name), Some(password), Some(role)) = (
                fields.get(cols.username),
                fields.get(cols.password),
                fields.get(cols.role),
            ) else {
                warn!(line = number + 1, "Skipping malformed user database row");
                continue;
            };

            if *name == username {
                return Some(UserData {
                    username: name.to_string(),
                    password: password.to_string(),
                    role: role.to_string(),
                });
            }
        }

        debug!(user = %username, "User not found");
        None
    }
}

impl CredentialStore for CsvUserDb {
    fn lookup(&self, username: &str) -> Option<UserData> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to open user database");
                return None;
            }
        };
        self.lookup_in(BufReader::new(file), username)
    }
}
