//! Lexical path handling shared by the working directory and the inode layer.

use alloc::string::String;
use alloc::vec::Vec;

/// Splits an absolute path into components, dropping "." and folding "..".
/// ".." at the root stays at the root.
pub fn components(path: &str) -> Option<Vec<&str>> {
    if !path.starts_with('/') {
        return None;
    }
    let mut comps = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                comps.pop();
            }
            name => comps.push(name),
        }
    }
    Some(comps)
}

pub fn join(comps: &[&str]) -> String {
    let mut path = String::from("/");
    path.push_str(&comps.join("/"));
    path
}

/// Canonical spelling of an absolute path.
pub fn canonical(path: &str) -> Option<String> {
    components(path).map(|comps| join(&comps))
}
