//! Syntax-aware segmentation of source files.
//!
//! Parses a file with tree-sitter and cuts it at the start of the line of
//! every top-level definition. Doc comments and attributes directly above a
//! definition stay with it. Each unit carries the definition's name so
//! retrieval results can say which function or type they came from.
//!
//! Returns `None` when the language has no grammar here, when the file does
//! not parse cleanly, or when it contains no top-level definitions. Callers
//! then fall back to plain line windows.

use tracing::debug;
use tree_sitter::{Language, Node, Parser};

use crate::chunk::Unit;

const MAX_SYMBOL_LEN: usize = 120;

fn grammar(language: &str) -> Option<Language> {
    let lang = match language {
        "rust" => tree_sitter_rust::LANGUAGE.into(),
        "python" => tree_sitter_python::LANGUAGE.into(),
        "javascript" => tree_sitter_javascript::LANGUAGE.into(),
        "typescript" => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        "tsx" => tree_sitter_typescript::LANGUAGE_TSX.into(),
        "go" => tree_sitter_go::LANGUAGE.into(),
        _ => return None,
    };
    Some(lang)
}

fn is_definition(language: &str, kind: &str) -> bool {
    match language {
        "rust" => matches!(
            kind,
            "function_item"
                | "struct_item"
                | "enum_item"
                | "union_item"
                | "impl_item"
                | "trait_item"
                | "mod_item"
                | "type_item"
                | "const_item"
                | "static_item"
                | "macro_definition"
        ),
        "python" => matches!(
            kind,
            "function_definition" | "class_definition" | "decorated_definition"
        ),
        "javascript" | "typescript" | "tsx" => matches!(
            kind,
            "function_declaration"
                | "generator_function_declaration"
                | "class_declaration"
                | "abstract_class_declaration"
                | "interface_declaration"
                | "type_alias_declaration"
                | "enum_declaration"
                | "module"
                | "lexical_declaration"
                | "export_statement"
        ),
        "go" => matches!(
            kind,
            "function_declaration"
                | "method_declaration"
                | "type_declaration"
                | "const_declaration"
                | "var_declaration"
        ),
        _ => false,
    }
}

fn is_leading_trivia(kind: &str) -> bool {
    matches!(
        kind,
        "comment" | "line_comment" | "block_comment" | "attribute_item"
    )
}

/// Cut `text` into units at top-level definitions.
pub(crate) fn definition_units(text: &str, language: &str) -> Option<Vec<Unit>> {
    let grammar = grammar(language)?;
    let mut parser = Parser::new();
    if let Err(e) = parser.set_language(&grammar) {
        debug!(language, error = %e, "grammar rejected by parser");
        return None;
    }
    let tree = parser.parse(text, None)?;
    let root = tree.root_node();
    if root.has_error() {
        debug!(language, "syntax errors, using line windows");
        return None;
    }

    let mut cursor = root.walk();
    let children: Vec<Node> = root.named_children(&mut cursor).collect();

    let mut cuts: Vec<(usize, Option<String>)> = Vec::new();
    for (idx, node) in children.iter().enumerate() {
        if !is_definition(language, node.kind()) {
            continue;
        }
        let mut first = idx;
        while first > 0 {
            let prev = &children[first - 1];
            let adjacent = prev.end_position().row + 1 >= children[first].start_position().row;
            if is_leading_trivia(prev.kind()) && adjacent {
                first -= 1;
            } else {
                break;
            }
        }
        let cut = line_start(text, children[first].start_byte());
        if cuts.last().map_or(true, |(prev, _)| cut > *prev) {
            cuts.push((cut, symbol_name(*node, text)));
        }
    }

    if cuts.is_empty() {
        return None;
    }

    let mut units = Vec::with_capacity(cuts.len() + 1);
    if cuts[0].0 > 0 {
        units.push(Unit::new(0..cuts[0].0, None));
    }
    for (k, (start, symbol)) in cuts.iter().enumerate() {
        let end = cuts.get(k + 1).map_or(text.len(), |(next, _)| *next);
        units.push(Unit::new(*start..end, symbol.clone()));
    }
    Some(units)
}

fn line_start(text: &str, offset: usize) -> usize {
    text[..offset].rfind('\n').map_or(0, |p| p + 1)
}

/// Best-effort name of a top-level definition.
fn symbol_name(node: Node, text: &str) -> Option<String> {
    let node = match node.kind() {
        "decorated_definition" => node.child_by_field_name("definition")?,
        "export_statement" => node
            .child_by_field_name("declaration")
            .or_else(|| node.child_by_field_name("value"))?,
        _ => node,
    };

    let name_node = match node.kind() {
        "impl_item" => node.child_by_field_name("type"),
        "lexical_declaration" | "type_declaration" | "const_declaration" | "var_declaration" => {
            let mut cursor = node.walk();
            let first = node.named_children(&mut cursor).next();
            first.and_then(|n| n.child_by_field_name("name"))
        }
        _ => node.child_by_field_name("name"),
    }?;

    let raw = name_node.utf8_text(text.as_bytes()).ok()?;
    let name = raw.lines().next().unwrap_or(raw).trim();
    if name.is_empty() {
        return None;
    }
    Some(name.chars().take(MAX_SYMBOL_LEN).collect())
}
