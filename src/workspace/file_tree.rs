//! Path-indexed file tree of a workspace.
//!
//! Buffers are files addressed by `/`-separated relative paths. Directories
//! are created implicitly for every parent segment and removed only
//! explicitly (deleting a directory removes its whole subtree). The same
//! structure backs the client cache and the authority's registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Type of file tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
}

/// A node in the file tree (file or directory)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// Last path segment
    pub name: String,
    /// Full path relative to the workspace root
    pub path: String,
    pub file_type: FileType,
    /// File extension (for files)
    pub extension: Option<String>,
    /// Creation timestamp (seconds since epoch)
    pub created_at: i64,
}

impl FileNode {
    pub fn new_file(path: impl Into<String>) -> Self {
        let path = path.into();
        let extension = Path::new(&path)
            .extension()
            .map(|e| e.to_string_lossy().to_string());

        Self {
            name: file_name(&path).to_string(),
            extension,
            path,
            file_type: FileType::File,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn new_directory(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: file_name(&path).to_string(),
            path,
            file_type: FileType::Directory,
            extension: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    fn moved(&self, path: String) -> Self {
        Self {
            name: file_name(&path).to_string(),
            path,
            ..self.clone()
        }
    }
}

/// File tree keyed by path, kept in sorted order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileTree {
    nodes: BTreeMap<String, FileNode>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree holding the given files
    pub fn from_files<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tree = Self::new();
        for path in paths {
            let _ = tree.create_file(path.as_ref());
        }
        tree
    }

    pub fn get(&self, path: &str) -> Option<&FileNode> {
        self.nodes.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.nodes.get(path).map_or(false, FileNode::is_file)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn file_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_file()).count()
    }

    /// Every file path, sorted
    pub fn files(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.is_file())
            .map(|n| n.path.clone())
            .collect()
    }

    /// File paths matching `filter`: equal to it when `strict`, starting
    /// with it otherwise. No filter returns every file.
    pub fn search(&self, filter: Option<&str>, strict: bool) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.is_file())
            .filter(|n| match filter {
                None => true,
                Some(f) if strict => n.path == f,
                Some(f) => n.path.starts_with(f),
            })
            .map(|n| n.path.clone())
            .collect()
    }

    /// Add a file, creating missing parent directories
    pub fn create_file(&mut self, path: &str) -> Result<&FileNode, FileTreeError> {
        let path = normalize(path)?;
        if self.nodes.contains_key(&path) {
            return Err(FileTreeError::PathExists(path));
        }
        self.create_parents(&path)?;
        Ok(self
            .nodes
            .entry(path.clone())
            .or_insert_with(|| FileNode::new_file(path)))
    }

    /// Add a directory, creating missing parents
    pub fn create_directory(&mut self, path: &str) -> Result<&FileNode, FileTreeError> {
        let path = normalize(path)?;
        match self.nodes.get(&path) {
            Some(node) if node.is_file() => return Err(FileTreeError::PathExists(path)),
            _ => {}
        }
        self.create_parents(&path)?;
        Ok(self
            .nodes
            .entry(path.clone())
            .or_insert_with(|| FileNode::new_directory(path)))
    }

    /// Remove a node and, for a directory, everything under it
    pub fn delete(&mut self, path: &str) -> Result<Vec<FileNode>, FileTreeError> {
        let path = normalize(path)?;
        if !self.nodes.contains_key(&path) {
            return Err(FileTreeError::NodeNotFound(path));
        }

        let doomed: Vec<String> = self.subtree(&path).collect();
        Ok(doomed
            .into_iter()
            .filter_map(|p| self.nodes.remove(&p))
            .collect())
    }

    /// Move a node (and its subtree) to a new path.
    /// Returns the `(old, new)` pairs of every moved file.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<Vec<(String, String)>, FileTreeError> {
        let from = normalize(from)?;
        let to = normalize(to)?;

        if !self.nodes.contains_key(&from) {
            return Err(FileTreeError::NodeNotFound(from));
        }
        if from == to {
            return Ok(Vec::new());
        }
        if self.nodes.contains_key(&to) {
            return Err(FileTreeError::PathExists(to));
        }
        if to.starts_with(&format!("{}/", from)) {
            return Err(FileTreeError::CircularMove);
        }
        self.create_parents(&to)?;

        let moved: Vec<String> = self.subtree(&from).collect();
        let mut renamed = Vec::new();
        for old in moved {
            if let Some(node) = self.nodes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                if node.is_file() {
                    renamed.push((old, new.clone()));
                }
                self.nodes.insert(new.clone(), node.moved(new));
            }
        }
        Ok(renamed)
    }

    /// Convert to a nested structure for serialization
    pub fn to_nested(&self, root_name: &str) -> NestedNode {
        let mut root = NestedNode {
            name: root_name.to_string(),
            path: String::new(),
            is_dir: true,
            children: Some(Vec::new()),
        };
        for node in self.nodes.values() {
            insert_nested(&mut root, node);
        }
        root
    }

    fn create_parents(&mut self, path: &str) -> Result<(), FileTreeError> {
        let mut parent = String::new();
        let segments: Vec<&str> = path.split('/').collect();
        for segment in &segments[..segments.len() - 1] {
            if !parent.is_empty() {
                parent.push('/');
            }
            parent.push_str(segment);
            match self.nodes.get(&parent) {
                Some(node) if node.is_file() => {
                    return Err(FileTreeError::NotADirectory(parent));
                }
                Some(_) => {}
                None => {
                    self.nodes
                        .insert(parent.clone(), FileNode::new_directory(parent.clone()));
                }
            }
        }
        Ok(())
    }

    fn subtree<'a>(&'a self, path: &'a str) -> impl Iterator<Item = String> + 'a {
        self.nodes.keys().filter(move |p| is_within(p, path)).cloned()
    }
}

/// Nested representation for display or JSON export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedNode {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub children: Option<Vec<NestedNode>>,
}

fn insert_nested(root: &mut NestedNode, node: &FileNode) {
    let mut current = root;
    let segments: Vec<&str> = node.path.split('/').collect();
    for depth in 1..segments.len() {
        let parent_path = segments[..depth].join("/");
        let children = current.children.get_or_insert_with(Vec::new);
        let index = match children.iter().position(|c| c.path == parent_path) {
            Some(index) => index,
            None => {
                children.push(NestedNode {
                    name: segments[depth - 1].to_string(),
                    path: parent_path,
                    is_dir: true,
                    children: Some(Vec::new()),
                });
                children.len() - 1
            }
        };
        current = &mut children[index];
    }

    let children = current.children.get_or_insert_with(Vec::new);
    if children.iter().any(|c| c.path == node.path) {
        return;
    }
    children.push(NestedNode {
        name: node.name.clone(),
        path: node.path.clone(),
        is_dir: node.is_directory(),
        children: if node.is_directory() { Some(Vec::new()) } else { None },
    });
}

/// Errors that can occur during file tree operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileTreeError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Path already exists: {0}")]
    PathExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("Cannot move node to its own descendant")]
    CircularMove,
}

pub(crate) fn normalize(path: &str) -> Result<String, FileTreeError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty()
        || trimmed
            .split('/')
            .any(|s| s.is_empty() || s == "." || s == "..")
    {
        return Err(FileTreeError::InvalidPath(path.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Whether `path` is `root` itself or lies below it
pub(crate) fn is_within(path: &str, root: &str) -> bool {
    path.strip_prefix(root)
        .map_or(false, |rest| rest.is_empty() || rest.starts_with('/'))
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_file_creates_parents() {
        let mut tree = FileTree::new();
        let node = tree.create_file("src/net/mod.rs").unwrap();
        assert_eq!(node.name, "mod.rs");
        assert_eq!(node.extension.as_deref(), Some("rs"));

        assert_eq!(tree.node_count(), 3);
        assert!(tree.get("src").unwrap().is_directory());
        assert!(tree.get("src/net").unwrap().is_directory());
        assert_eq!(tree.files(), vec!["src/net/mod.rs"]);
    }

    #[test]
    fn test_create_duplicate_file() {
        let mut tree = FileTree::new();
        tree.create_file("notes.txt").unwrap();
        assert_eq!(
            tree.create_file("/notes.txt/").unwrap_err(),
            FileTreeError::PathExists("notes.txt".into())
        );
    }

    #[test]
    fn test_file_cannot_be_parent() {
        let mut tree = FileTree::new();
        tree.create_file("a.txt").unwrap();
        assert_eq!(
            tree.create_file("a.txt/b.txt").unwrap_err(),
            FileTreeError::NotADirectory("a.txt".into())
        );
    }

    #[test]
    fn test_invalid_paths() {
        let mut tree = FileTree::new();
        for bad in ["", "/", "a//b", "../etc/passwd", "a/./b"] {
            assert!(matches!(tree.create_file(bad), Err(FileTreeError::InvalidPath(_))));
        }
    }

    #[test]
    fn test_delete_directory_removes_subtree() {
        let mut tree = FileTree::from_files(["src/main.rs", "src/lib.rs", "src-extra.txt"]);
        let removed = tree.delete("src").unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(tree.files(), vec!["src-extra.txt"]);
        assert!(matches!(tree.delete("src"), Err(FileTreeError::NodeNotFound(_))));
    }

    #[test]
    fn test_rename_file() {
        let mut tree = FileTree::from_files(["draft.md"]);
        let moved = tree.rename("draft.md", "docs/final.md").unwrap();
        assert_eq!(moved, vec![("draft.md".to_string(), "docs/final.md".to_string())]);
        assert!(!tree.contains("draft.md"));
        assert_eq!(tree.get("docs/final.md").unwrap().name, "final.md");
    }

    #[test]
    fn test_rename_directory_moves_children() {
        let mut tree = FileTree::from_files(["old/a.rs", "old/deep/b.rs"]);
        let moved = tree.rename("old", "new").unwrap();
        assert_eq!(moved.len(), 2);
        assert_eq!(tree.files(), vec!["new/a.rs", "new/deep/b.rs"]);
        assert!(tree.get("new/deep").unwrap().is_directory());
    }

    #[test]
    fn test_rename_into_itself_is_rejected() {
        let mut tree = FileTree::from_files(["dir/a.rs"]);
        assert_eq!(tree.rename("dir", "dir/sub").unwrap_err(), FileTreeError::CircularMove);
    }

    #[test]
    fn test_search() {
        let tree = FileTree::from_files(["src/main.rs", "src/lib.rs", "README.md"]);
        assert_eq!(tree.search(Some("src/"), false), vec!["src/lib.rs", "src/main.rs"]);
        assert_eq!(tree.search(Some("src/lib.rs"), true), vec!["src/lib.rs"]);
        assert!(tree.search(Some("src"), true).is_empty());
        assert_eq!(tree.search(None, false).len(), 3);
    }

    #[test]
    fn test_to_nested() {
        let tree = FileTree::from_files(["src/main.rs", "Cargo.toml"]);
        let nested = tree.to_nested("demo");

        let children = nested.children.unwrap();
        assert_eq!(children.len(), 2);
        let src = children.iter().find(|c| c.name == "src").unwrap();
        assert!(src.is_dir);
        assert_eq!(src.children.as_ref().unwrap()[0].path, "src/main.rs");

        let json = serde_json::to_string(&tree.to_nested("demo")).unwrap();
        assert!(json.contains("\"Cargo.toml\""));
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("src", "src"));
        assert!(is_within("src/lib.rs", "src"));
        assert!(!is_within("src-extra.txt", "src"));
        assert!(!is_within("lib.rs", "src/lib.rs"));
    }
}
