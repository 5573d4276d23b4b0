// Static policy gate consulted before any container is created.
// The orchestrator only sees allow/deny plus reasons; the rules live here.

use tree_sitter::{Node, Parser};

pub const FORBIDDEN_BUILTINS: &[&str] = &["eval", "exec", "compile", "open", "__import__"];
pub const FORBIDDEN_MODULES: &[&str] = &["socket", "subprocess", "os", "sys"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    Allow,
    Deny { reasons: Vec<String> },
}

impl PolicyVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyVerdict::Allow)
    }
}

pub trait PolicyGate: Send + Sync {
    fn check(&self, code: &str) -> PolicyVerdict;
}

/// Denies calls to dangerous builtins and imports of host-reaching modules.
///
/// The body is parsed as a Python module (a bare `return` is accepted by the
/// grammar) and every node of the tree is inspected, so imports nested in
/// compound statements or function definitions are found too. Code that
/// does not parse is denied.
#[derive(Debug, Default, Clone)]
pub struct DenylistPolicy;

fn root_module(path: &str) -> &str {
    path.trim_start_matches('.').split('.').next().unwrap_or("").trim()
}

fn deny(reasons: Vec<String>) -> PolicyVerdict {
    PolicyVerdict::Deny { reasons }
}

fn note(reasons: &mut Vec<String>, reason: String) {
    if !reasons.contains(&reason) {
        reasons.push(reason);
    }
}

fn note_module(reasons: &mut Vec<String>, module: &str) {
    if FORBIDDEN_MODULES.contains(&root_module(module)) {
        note(reasons, format!("import of forbidden module: {}", module));
    }
}

/// Module path named by an `import` item, with any `as` alias dropped
fn imported_path<'s>(item: Node, source: &'s str) -> &'s str {
    let path = if item.kind() == "aliased_import" {
        item.child_by_field_name("name").unwrap_or(item)
    } else {
        item
    };
    &source[path.byte_range()]
}

fn inspect(node: Node, source: &str, reasons: &mut Vec<String>) {
    match node.kind() {
        "call" => {
            if let Some(function) = node.child_by_field_name("function") {
                let name = &source[function.byte_range()];
                if function.kind() == "identifier" && FORBIDDEN_BUILTINS.contains(&name) {
                    note(reasons, format!("call to forbidden builtin: {}", name));
                }
            }
        }
        // legacy `exec code` form kept by the grammar
        "exec_statement" => note(reasons, "call to forbidden builtin: exec".to_string()),
        "import_statement" => {
            let mut cursor = node.walk();
            for item in node.children_by_field_name("name", &mut cursor) {
                note_module(reasons, imported_path(item, source));
            }
        }
        "import_from_statement" => {
            if let Some(module) = node.child_by_field_name("module_name") {
                note_module(reasons, &source[module.byte_range()]);
            }
        }
        _ => {}
    }
}

/// First syntax error in the tree, as a 1-based line number
fn first_error_line(root: Node) -> Option<usize> {
    let mut cursor = root.walk();
    loop {
        let node = cursor.node();
        if node.is_error() || node.is_missing() {
            return Some(node.start_position().row + 1);
        }
        if node.has_error() && cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return None;
            }
        }
    }
}

impl PolicyGate for DenylistPolicy {
    fn check(&self, code: &str) -> PolicyVerdict {
        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(tree_sitter_python::language()) {
            return deny(vec![format!("policy checker unavailable: {}", e)]);
        }
        let tree = match parser.parse(code, None) {
            Some(tree) => tree,
            None => return deny(vec!["code could not be parsed".to_string()]),
        };

        let root = tree.root_node();
        if root.has_error() {
            let line = first_error_line(root).unwrap_or(1);
            return deny(vec![format!("syntax error near line {}", line)]);
        }

        // pre-order walk without recursion; nesting depth is caller-controlled
        let mut reasons = Vec::new();
        let mut cursor = root.walk();
        'walk: loop {
            inspect(cursor.node(), code, &mut reasons);
            if cursor.goto_first_child() {
                continue;
            }
            loop {
                if cursor.goto_next_sibling() {
                    break;
                }
                if !cursor.goto_parent() {
                    break 'walk;
                }
            }
        }

        if reasons.is_empty() {
            PolicyVerdict::Allow
        } else {
            deny(reasons)
        }
    }
}
