use std::collections::BTreeSet;

use tree_sitter::{Node, Parser};

use crate::error::{IndexError, Result};
use crate::languages::Lang;
use crate::unit::{SemanticUnit, UnitType};

/// Tree-sitter backend over the grammars compiled in via `lang-*` features.
#[derive(Debug, Clone)]
pub struct NativeParser {
    languages: BTreeSet<Lang>,
}

impl NativeParser {
    /// Load every compiled-in grammar and parse a trivial sample with it.
    /// Returns `None` when no grammar works.
    #[must_use]
    pub fn probe() -> Option<Self> {
        let languages: BTreeSet<Lang> = Lang::ALL
            .into_iter()
            .filter(|lang| {
                let Some(grammar) = lang.grammar() else {
                    return false;
                };
                let mut parser = Parser::new();
                if let Err(e) = parser.set_language(&grammar) {
                    tracing::warn!(language = %lang, "grammar failed to load: {e}");
                    return false;
                }
                parser.parse("x", None).is_some()
            })
            .collect();
        if languages.is_empty() {
            None
        } else {
            Some(Self { languages })
        }
    }

    #[must_use]
    pub fn supported_languages(&self) -> BTreeSet<Lang> {
        self.languages.clone()
    }

    pub(super) fn parse_source(
        &self,
        source: &str,
        file_path: &str,
        lang: Lang,
    ) -> Result<Vec<SemanticUnit>> {
        let failure = |reason: String| IndexError::ParseFailure {
            path: file_path.to_owned(),
            reason,
        };
        let grammar = lang
            .grammar()
            .ok_or_else(|| failure(format!("no grammar for {lang}")))?;
        let mut parser = Parser::new();
        parser
            .set_language(&grammar)
            .map_err(|e| failure(format!("set_language failed: {e}")))?;
        let tree = parser
            .parse(source, None)
            .ok_or_else(|| failure("tree-sitter returned no tree".into()))?;

        let mut units = Vec::new();
        let ctx = WalkCtx {
            source,
            file_path,
            lang,
        };
        collect_units(&ctx, &tree.root_node(), &mut units);
        Ok(units)
    }
}

struct WalkCtx<'a> {
    source: &'a str,
    file_path: &'a str,
    lang: Lang,
}

/// Pre-order walk. Functions are leaves; class-like nodes are emitted and then
/// searched for methods; every other node is transparent.
fn collect_units(ctx: &WalkCtx<'_>, parent: &Node, out: &mut Vec<SemanticUnit>) {
    let child_count = u32::try_from(parent.named_child_count()).unwrap_or(u32::MAX);
    for i in 0..child_count {
        let Some(child) = parent.named_child(i) else {
            continue;
        };
        let kind = child.kind();
        if ctx.lang.function_node_kinds().contains(&kind) {
            if let Some(unit) = make_unit(ctx, &child, UnitType::Function) {
                out.push(unit);
            }
        } else if ctx.lang.class_node_kinds().contains(&kind) {
            if let Some(unit) = make_unit(ctx, &child, UnitType::Class) {
                out.push(unit);
            }
            collect_units(ctx, &child, out);
        } else {
            collect_units(ctx, &child, out);
        }
    }
}

fn make_unit(ctx: &WalkCtx<'_>, node: &Node, unit_type: UnitType) -> Option<SemanticUnit> {
    let name = entity_name(node, ctx.source)?;
    let content = &ctx.source[node.byte_range()];
    Some(SemanticUnit::new(
        ctx.file_path,
        unit_type,
        name,
        content,
        (node.start_position().row + 1, node.end_position().row + 1),
        ctx.lang,
    ))
}

fn entity_name(node: &Node, source: &str) -> Option<String> {
    // tree-sitter-rust: impl_item uses "type"; Go type_declaration nests a type_spec.
    let name_node = node
        .child_by_field_name("name")
        .or_else(|| node.child_by_field_name("type"))
        .or_else(|| {
            (node.kind() == "type_declaration")
                .then(|| node.named_child(0))
                .flatten()
                .and_then(|spec| spec.child_by_field_name("name"))
        })?;
    let text = &source[name_node.byte_range()];
    let bare = text.split('<').next().unwrap_or(text).trim();
    (!bare.is_empty()).then(|| bare.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str, path: &str, lang: Lang) -> Vec<SemanticUnit> {
        NativeParser::probe()
            .expect("at least one grammar")
            .parse_source(source, path, lang)
            .unwrap()
    }

    fn names(units: &[SemanticUnit]) -> Vec<(UnitType, &str)> {
        units.iter().map(|u| (u.unit_type, u.name.as_str())).collect()
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn rust_methods_are_extracted_from_impls() {
        let units = parse(
            "struct Foo;\n\nimpl<T> Bar<T> {\n    fn baz(&self) {}\n}\n\nfn top() {\n    fn nested() {}\n}\n",
            "src/lib.rs",
            Lang::Rust,
        );
        assert_eq!(
            names(&units),
            [
                (UnitType::Class, "Foo"),
                (UnitType::Class, "Bar"),
                (UnitType::Function, "baz"),
                (UnitType::Function, "top"),
            ]
        );
        assert_eq!((units[2].start_line, units[2].end_line), (4, 4));
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn rust_functions_in_modules_are_found() {
        let units = parse(
            "mod tests {\n    #[test]\n    fn it_works() {}\n}\n",
            "src/lib.rs",
            Lang::Rust,
        );
        assert_eq!(names(&units), [(UnitType::Function, "it_works")]);
        assert_eq!(units[0].start_line, 3);
    }

    #[cfg(feature = "lang-python")]
    #[test]
    fn python_decorated_function_starts_at_def() {
        let units = parse(
            "@cache\ndef compute(x):\n    return x\n",
            "m.py",
            Lang::Python,
        );
        assert_eq!(names(&units), [(UnitType::Function, "compute")]);
        assert_eq!(units[0].start_line, 2);
    }

    #[cfg(feature = "lang-go")]
    #[test]
    fn go_types_and_methods() {
        let units = parse(
            "package main\n\ntype Server struct {\n\taddr string\n}\n\nfunc (s *Server) Run() error {\n\treturn nil\n}\n",
            "main.go",
            Lang::Go,
        );
        assert_eq!(
            names(&units),
            [(UnitType::Class, "Server"), (UnitType::Function, "Run")]
        );
    }

    #[cfg(feature = "lang-js")]
    #[test]
    fn typescript_class_methods() {
        let units = parse(
            "export class Api {\n  constructor() {}\n  async fetch(id: string): Promise<void> {\n  }\n}\n",
            "api.ts",
            Lang::TypeScript,
        );
        assert_eq!(
            names(&units),
            [
                (UnitType::Class, "Api"),
                (UnitType::Function, "constructor"),
                (UnitType::Function, "fetch"),
            ]
        );
    }
}
