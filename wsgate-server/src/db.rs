//! SQLite-backed project store.
//!
//! The broker only reads from it (via [`ProjectLookup`]); `wsgate-admin`
//! writes to it.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::domain::validate_pattern;
use crate::project::{DomainRule, Project, ProjectLookup, RuleKind};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Check a project name and return its canonical (lower-case) form.
pub fn validate_project_name(name: &str) -> Result<String, StoreError> {
    let name = name.trim();
    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(StoreError::Validation(format!(
            "Invalid project name '{name}': use letters, digits, '-' or '_'"
        )));
    }
    Ok(name.to_ascii_lowercase())
}

/// Fresh signing secret: 32 random bytes, base64url without padding.
pub fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS projects (
                name             TEXT PRIMARY KEY,
                secret_key       TEXT NOT NULL,
                allow_any_domain INTEGER NOT NULL DEFAULT 0,
                description      TEXT,
                created_at       TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at       TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS domains (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                project  TEXT NOT NULL REFERENCES projects(name) ON DELETE CASCADE,
                pattern  TEXT NOT NULL,
                kind     TEXT NOT NULL CHECK (kind IN ('allow', 'deny')),
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(project, pattern, kind)
            );

            CREATE INDEX IF NOT EXISTS idx_domains_project ON domains(project);
            ",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // ── Projects ───────────────────────────────────────────────────────

    /// Create a project with a freshly generated secret.
    pub fn create_project(
        &self,
        name: &str,
        allow_any_domain: bool,
        description: Option<&str>,
    ) -> Result<Project, StoreError> {
        let name = validate_project_name(name)?;
        let secret = generate_secret();
        let conn = self.conn.lock();
        let exists: bool = conn
            .query_row("SELECT 1 FROM projects WHERE name = ?1", params![name], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if exists {
            return Err(StoreError::Validation(format!("Project '{name}' already exists")));
        }
        conn.execute(
            "INSERT INTO projects (name, secret_key, allow_any_domain, description) VALUES (?1, ?2, ?3, ?4)",
            params![name, secret, allow_any_domain, description],
        )?;
        Ok(Project { name, secret, allow_any_domain, rules: Vec::new() })
    }

    pub fn set_allow_any_domain(&self, name: &str, allow: bool) -> Result<(), StoreError> {
        let name = validate_project_name(name)?;
        let n = self.conn.lock().execute(
            "UPDATE projects SET allow_any_domain = ?2, updated_at = datetime('now') WHERE name = ?1",
            params![name, allow],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("project '{name}'")));
        }
        Ok(())
    }

    /// Replace the project's signing secret. Tokens signed with the old one stop verifying.
    pub fn rotate_secret(&self, name: &str) -> Result<String, StoreError> {
        let name = validate_project_name(name)?;
        let secret = generate_secret();
        let n = self.conn.lock().execute(
            "UPDATE projects SET secret_key = ?2, updated_at = datetime('now') WHERE name = ?1",
            params![name, secret],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("project '{name}'")));
        }
        Ok(secret)
    }

    pub fn delete_project(&self, name: &str) -> Result<bool, StoreError> {
        let name = validate_project_name(name)?;
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM projects WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }

    pub fn list_projects(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM projects ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Load a project and its domain rules. Names are matched case-insensitively.
    pub fn get_project(&self, name: &str) -> Result<Option<Project>, StoreError> {
        let name = name.trim().to_ascii_lowercase();
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT name, secret_key, allow_any_domain FROM projects WHERE name = ?1",
                params![name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, bool>(2)?)),
            )
            .optional()?;
        let Some((name, secret, allow_any_domain)) = row else {
            return Ok(None);
        };

        let mut stmt =
            conn.prepare("SELECT pattern, kind FROM domains WHERE project = ?1 ORDER BY id")?;
        let rules = stmt
            .query_map(params![name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(pattern, kind)| {
                let kind = kind.parse::<RuleKind>().map_err(StoreError::Database)?;
                Ok(DomainRule { pattern, kind })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Some(Project { name, secret, allow_any_domain, rules }))
    }

    // ── Domain rules ───────────────────────────────────────────────────

    /// Add a rule after validating its pattern. Adding an existing rule is a no-op.
    pub fn add_domain_rule(
        &self,
        project: &str,
        pattern: &str,
        kind: RuleKind,
    ) -> Result<DomainRule, StoreError> {
        let project = validate_project_name(project)?;
        let pattern = validate_pattern(pattern).map_err(StoreError::Validation)?;
        let conn = self.conn.lock();
        let exists: bool = conn
            .query_row("SELECT 1 FROM projects WHERE name = ?1", params![project], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(StoreError::NotFound(format!("project '{project}'")));
        }
        conn.execute(
            "INSERT OR IGNORE INTO domains (project, pattern, kind) VALUES (?1, ?2, ?3)",
            params![project, pattern, kind.as_str()],
        )?;
        Ok(DomainRule { pattern, kind })
    }

    /// Returns whether a rule was removed.
    pub fn remove_domain_rule(
        &self,
        project: &str,
        pattern: &str,
        kind: RuleKind,
    ) -> Result<bool, StoreError> {
        let project = validate_project_name(project)?;
        let pattern = crate::domain::normalize_origin(pattern);
        let n = self.conn.lock().execute(
            "DELETE FROM domains WHERE project = ?1 AND pattern = ?2 AND kind = ?3",
            params![project, pattern, kind.as_str()],
        )?;
        Ok(n > 0)
    }
}

impl ProjectLookup for Db {
    fn lookup_project(&self, name: &str) -> Result<Option<Project>, StoreError> {
        self.get_project(name)
    }
}
