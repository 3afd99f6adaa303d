//! Pluggable parsing of file bytes into semantic units.
//!
//! [`ParserBackend`] is chosen once at startup: the tree-sitter backend when at
//! least one grammar loads, otherwise the regex-based portable backend. Both
//! derive unit ids through [`crate::unit::unit_id`], so switching backends between
//! runs keeps ids stable for the same declarations.

mod native;
mod portable;

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

pub use native::NativeParser;
pub use portable::PortableParser;

use crate::error::{IndexError, Result};
use crate::languages::Lang;
use crate::unit::SemanticUnit;

/// Which backend to use. `Auto` probes the native grammars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserPreference {
    #[default]
    Auto,
    Native,
    Portable,
}

impl std::str::FromStr for ParserPreference {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "native" => Ok(Self::Native),
            "portable" => Ok(Self::Portable),
            other => Err(IndexError::Other(format!("unknown parser backend: {other}"))),
        }
    }
}

macro_rules! delegate_parser {
    ($self:expr, |$p:ident| $expr:expr) => {
        match $self {
            ParserBackend::Native($p) => $expr,
            ParserBackend::Portable($p) => $expr,
        }
    };
}

#[derive(Debug, Clone)]
pub enum ParserBackend {
    Native(NativeParser),
    Portable(PortableParser),
}

impl ParserBackend {
    /// Pick the native backend if any grammar loads, otherwise fall back to the
    /// portable one.
    #[must_use]
    pub fn probe() -> Self {
        match NativeParser::probe() {
            Some(native) => {
                tracing::info!(
                    languages = native.supported_languages().len(),
                    "using tree-sitter parser"
                );
                Self::Native(native)
            }
            None => {
                tracing::warn!("no tree-sitter grammar available, using portable parser");
                Self::Portable(PortableParser::new())
            }
        }
    }

    /// # Errors
    ///
    /// Returns an error when `Native` is forced but no grammar is available.
    pub fn from_preference(pref: ParserPreference) -> Result<Self> {
        match pref {
            ParserPreference::Auto => Ok(Self::probe()),
            ParserPreference::Native => NativeParser::probe().map(Self::Native).ok_or_else(|| {
                IndexError::Other("native parser requested but no grammar is available".into())
            }),
            ParserPreference::Portable => Ok(Self::Portable(PortableParser::new())),
        }
    }

    /// Parse `content` as `lang`. `file_path` is the root-relative path recorded on
    /// every unit.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::ParseFailure`] for non-UTF-8 content, unsupported
    /// languages, or a grammar failure.
    pub fn parse(&self, content: &[u8], file_path: &str, lang: Lang) -> Result<Vec<SemanticUnit>> {
        let source = std::str::from_utf8(content).map_err(|e| IndexError::ParseFailure {
            path: file_path.to_owned(),
            reason: format!("not valid UTF-8: {e}"),
        })?;
        if !self.supported_languages().contains(&lang) {
            return Err(IndexError::ParseFailure {
                path: file_path.to_owned(),
                reason: format!("{lang} not supported by the {} parser", self.name()),
            });
        }
        if source.trim().is_empty() {
            return Ok(Vec::new());
        }
        if lang.is_whole_file() {
            return Ok(vec![SemanticUnit::whole_file(file_path, source, lang)]);
        }
        let mut units = delegate_parser!(self, |p| p.parse_source(source, file_path, lang))?;
        // Two declarations can share a name and start line (`struct Foo; impl Foo {}`);
        // the first one keeps the id.
        let mut seen = HashSet::new();
        units.retain(|u| seen.insert(u.unit_id.clone()));
        if units.is_empty() {
            units.push(SemanticUnit::whole_file(file_path, source, lang));
        }
        Ok(units)
    }

    #[must_use]
    pub fn supported_languages(&self) -> BTreeSet<Lang> {
        delegate_parser!(self, |p| p.supported_languages())
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Native(_) => "native",
            Self::Portable(_) => "portable",
        }
    }
}
