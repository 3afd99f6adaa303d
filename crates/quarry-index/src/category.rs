//! Content categories shared by the indexer (writer) and the searcher (reader).
//!
//! Both sides go through [`Category`] and [`CATEGORY_FIELD`]; there is no other
//! place where the category string or payload key is spelled out.

use serde::{Deserialize, Serialize};

use crate::languages::Lang;

/// Payload key holding the category of a stored unit.
pub const CATEGORY_FIELD: &str = "category";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Code,
    Config,
    Docs,
}

impl Category {
    pub const ALL: [Category; 3] = [Self::Code, Self::Config, Self::Docs];

    #[must_use]
    pub fn for_language(lang: Lang) -> Self {
        match lang {
            Lang::Markdown => Self::Docs,
            Lang::Toml | Lang::Json => Self::Config,
            _ => Self::Code,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Config => "config",
            Self::Docs => "docs",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// Categories a search accepts when the caller does not restrict them.
    #[must_use]
    pub fn default_filter() -> Vec<Category> {
        Self::ALL.to_vec()
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(&s.to_ascii_lowercase()).ok_or_else(|| format!("unknown category: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn config_and_docs_languages() {
        assert_eq!(Category::for_language(Lang::Toml), Category::Config);
        assert_eq!(Category::for_language(Lang::Json), Category::Config);
        assert_eq!(Category::for_language(Lang::Markdown), Category::Docs);
        assert_eq!(Category::for_language(Lang::Rust), Category::Code);
        assert_eq!(Category::for_language(Lang::Bash), Category::Code);
    }

    #[test]
    fn parse_matches_as_str() {
        for c in Category::ALL {
            assert_eq!(Category::parse(c.as_str()), Some(c));
        }
        assert_eq!("DOCS".parse::<Category>(), Ok(Category::Docs));
        assert!("tests".parse::<Category>().is_err());
    }

    #[test]
    fn serde_uses_the_payload_spelling() {
        for c in Category::ALL {
            let json = serde_json::to_value(c).unwrap();
            assert_eq!(json, serde_json::Value::String(c.as_str().to_owned()));
        }
    }

    proptest! {
        #[test]
        fn every_written_category_is_searchable_by_default(idx in 0..Lang::ALL.len()) {
            let written = Category::for_language(Lang::ALL[idx]);
            prop_assert!(Category::default_filter().contains(&written));
            prop_assert_eq!(Category::parse(written.as_str()), Some(written));
        }
    }
}
