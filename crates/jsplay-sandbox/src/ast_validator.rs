//! AST-based module-format detection.
//!
//! Parses the script as a module with `oxc_parser` and reports the first
//! top-level `import`/`export` declaration. Sources the module grammar
//! rejects (sloppy-mode constructs, syntax errors) and pathologically deep
//! nesting fall back to the lexical scanner in [`crate::validator`].
//!
//! This module is only compiled when the `ast-validator` feature is enabled.

use oxc_allocator::Allocator;
use oxc_ast::ast::Statement;
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType};

use crate::validator::ModuleSyntax;

/// Maximum bracket nesting handed to the parser.
const MAX_NESTING_DEPTH: usize = 256;

/// Whether bracket nesting stays within what the parser is given.
fn nesting_within_limit(code: &str) -> bool {
    let mut depth: usize = 0;
    for ch in code.chars() {
        match ch {
            '{' | '[' | '(' => {
                depth += 1;
                if depth > MAX_NESTING_DEPTH {
                    return false;
                }
            }
            '}' | ']' | ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    true
}

/// Find the first top-level module declaration in `code`.
pub fn detect_module_syntax(code: &str) -> Option<ModuleSyntax> {
    if !nesting_within_limit(code) {
        return crate::validator::detect_module_syntax(code);
    }

    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, code, SourceType::mjs()).parse();
    if ret.panicked || !ret.errors.is_empty() {
        return crate::validator::detect_module_syntax(code);
    }

    for stmt in &ret.program.body {
        let keyword = match stmt {
            Statement::ImportDeclaration(_) => "import",
            Statement::ExportAllDeclaration(_)
            | Statement::ExportDefaultDeclaration(_)
            | Statement::ExportNamedDeclaration(_) => "export",
            _ => continue,
        };
        let start = (stmt.span().start as usize).min(code.len());
        let line = code.as_bytes()[..start].iter().filter(|b| **b == b'\n').count() + 1;
        return Some(ModuleSyntax { keyword, line });
    }
    None
}
