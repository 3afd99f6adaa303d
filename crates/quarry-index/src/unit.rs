//! Semantic units and their deterministic ids.

use serde::{Deserialize, Serialize};

use crate::languages::Lang;

/// Namespace for unit id derivation. Changing it invalidates every stored id.
const QUARRY_NAMESPACE: uuid::Uuid = uuid::Uuid::from_bytes([
    0x5c, 0x2e, 0x91, 0x0a, 0x7d, 0x43, 0x4f, 0x1b, 0x9a, 0x66, 0x0e, 0xc4, 0x38, 0xb2, 0x71, 0xd9,
]);

/// Payload keys written for every stored unit. The category key lives in
/// [`crate::category::CATEGORY_FIELD`].
pub const FILE_PATH_FIELD: &str = "file_path";
pub const LANGUAGE_FIELD: &str = "language";
pub const PROJECT_FIELD: &str = "project";
pub const ROOT_FIELD: &str = "root";
pub const UNIT_TYPE_FIELD: &str = "unit_type";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    Function,
    Class,
    Module,
}

impl UnitType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Module => "module",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(Self::Function),
            "class" => Some(Self::Class),
            "module" => Some(Self::Module),
            _ => None,
        }
    }
}

impl std::fmt::Display for UnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable id for a unit: the same root, path, name, and start line always map
/// to the same id, whichever parser backend produced the unit. Parsers work
/// without a root and use `""`; the indexer re-anchors units with
/// [`SemanticUnit::in_root`].
#[must_use]
pub fn unit_id(root: &str, file_path: &str, name: &str, start_line: usize) -> String {
    let key = format!("{root}\0{file_path}\0{name}\0{start_line}");
    uuid::Uuid::new_v5(&QUARRY_NAMESPACE, key.as_bytes()).to_string()
}

/// One indexable code element. Lines are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticUnit {
    pub unit_id: String,
    pub file_path: String,
    pub unit_type: UnitType,
    pub name: String,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    pub language: Lang,
}

impl SemanticUnit {
    #[must_use]
    pub fn new(
        file_path: &str,
        unit_type: UnitType,
        name: impl Into<String>,
        content: impl Into<String>,
        (start_line, end_line): (usize, usize),
        language: Lang,
    ) -> Self {
        let name = name.into();
        Self {
            unit_id: unit_id("", file_path, &name, start_line),
            file_path: file_path.to_owned(),
            unit_type,
            name,
            content: content.into(),
            start_line,
            end_line,
            language,
        }
    }

    /// Re-derive the id under `root`, the canonical path of the indexed directory.
    #[must_use]
    pub fn in_root(mut self, root: &str) -> Self {
        self.unit_id = unit_id(root, &self.file_path, &self.name, self.start_line);
        self
    }

    /// Single unit covering a whole file, named after the file stem.
    #[must_use]
    pub fn whole_file(file_path: &str, source: &str, language: Lang) -> Self {
        let stem = std::path::Path::new(file_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_path);
        let lines = source.lines().count().max(1);
        Self::new(file_path, UnitType::Module, stem, source, (1, lines), language)
    }
}
