use alloc::string::{String, ToString};
use spin::Mutex;

use crate::{
    error::{FsError, FsResult},
    inode::InodeLayer,
    path::canonical,
};

/// Process-wide working directory.
pub struct WorkingDir {
    path: Mutex<String>,
    max_path: usize,
}

impl WorkingDir {
    pub fn new(max_path: usize) -> Self {
        Self {
            path: Mutex::new("/".to_string()),
            max_path,
        }
    }

    pub fn current(&self) -> String {
        self.path.lock().clone()
    }

    /// Absolute form of `path`: used verbatim when it starts with `/`,
    /// otherwise composed onto the working directory.
    pub fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            return path.to_string();
        }
        let cwd = self.path.lock();
        compose(&cwd, path, self.max_path)
    }

    /// Changes the working directory. The lock is held across the lookup, so
    /// a failed change leaves the previous value in place.
    pub fn chdir(&self, layer: &dyn InodeLayer, path: Option<&str>) -> FsResult<()> {
        let path = path
            .filter(|p| !p.is_empty())
            .ok_or(FsError::NoSuchEntry)?;
        let mut cwd = self.path.lock();
        let target = if path.starts_with('/') {
            let mut target = path.to_string();
            bound(&mut target, self.max_path);
            target
        } else {
            compose(&cwd, path, self.max_path)
        };

        let ip = layer.namei(&target).ok_or(FsError::NoSuchEntry)?;
        if !ip.is_dir() {
            return Err(FsError::NotADirectory);
        }
        // stored canonical so ".." never accumulates
        let mut target = canonical(&target).ok_or(FsError::NoSuchEntry)?;
        bound(&mut target, self.max_path);
        log::debug!("chdir {} -> {}", cwd, target);
        *cwd = target;
        Ok(())
    }
}

fn compose(base: &str, rel: &str, max_path: usize) -> String {
    let mut path = String::with_capacity(base.len() + rel.len() + 1);
    path.push_str(base);
    if !path.ends_with('/') {
        path.push('/');
    }
    path.push_str(rel);
    bound(&mut path, max_path);
    path
}

/// Truncates to fit a `max_path` buffer with its terminating NUL.
fn bound(path: &mut String, max_path: usize) {
    let mut end = max_path.saturating_sub(1);
    if path.len() <= end {
        return;
    }
    while !path.is_char_boundary(end) {
        end -= 1;
    }
    path.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_get_one_separator() {
        assert_eq!(compose("/", "a", 64), "/a");
        assert_eq!(compose("/d", "a/b", 64), "/d/a/b");
        assert_eq!(compose("/d/", "a", 64), "/d/a");
    }

    #[test]
    fn composed_paths_are_bounded() {
        assert_eq!(compose("/dir", "file", 8), "/dir/fi");
        // never splits a character
        assert_eq!(compose("/", "aé", 4), "/a");
    }

    #[test]
    fn absolute_paths_are_verbatim() {
        let cwd = WorkingDir::new(16);
        assert_eq!(cwd.resolve("/x/../y"), "/x/../y");
        assert_eq!(cwd.resolve("y"), "/y");
    }
}
