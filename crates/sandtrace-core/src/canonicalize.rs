//! Path canonicalization.
//!
//! Turns a possibly relative path into an absolute one and resolves every
//! symlink along it, collecting each link it had to read so the caller
//! can report them: a build that depends on `/usr/lib/libfoo.so` also
//! depends on every link that led there.

use std::collections::HashSet;

use sandtrace_common::constants::PATH_MAX;
use sandtrace_common::error::{Result, SandtraceError};

use crate::fs_view::FileSystemView;

/// Directory a relative path is interpreted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseDir {
    /// Working directory of the calling process, or of `pid`.
    CurrentDir {
        /// Process whose working directory applies; `None` for self.
        pid: Option<u32>,
    },
    /// An already-known directory, e.g. the target of a directory
    /// descriptor.
    Directory(String),
}

/// Result of resolving a path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resolved {
    /// The canonical path.
    pub path: String,
    /// Every symlink read during resolution, in traversal order.
    pub traversed_links: Vec<String>,
}

/// Canonicalizes paths against a [`FileSystemView`].
pub struct Canonicalizer<'a> {
    view: &'a dyn FileSystemView,
}

impl<'a> Canonicalizer<'a> {
    /// Creates a canonicalizer over the given view.
    #[must_use]
    pub fn new(view: &'a dyn FileSystemView) -> Self {
        Self { view }
    }

    /// Makes `path` absolute without touching symlinks.
    ///
    /// # Errors
    ///
    /// Returns [`SandtraceError::Unresolvable`] if `path` is relative and
    /// the base directory cannot be determined.
    pub fn to_absolute(&self, path: &str, base: &BaseDir) -> Result<String> {
        if path.starts_with('/') {
            return Ok(path.to_owned());
        }
        let dir = match base {
            BaseDir::CurrentDir { pid } => self.view.current_dir(*pid),
            BaseDir::Directory(dir) => Some(dir.clone()),
        }
        .filter(|d| d.starts_with('/'))
        .ok_or_else(|| SandtraceError::Unresolvable {
            path: path.to_owned(),
        })?;

        let dir = dir.strip_suffix('/').unwrap_or(&dir);
        Ok(format!("{dir}/{path}"))
    }

    /// Makes `path` absolute and resolves it.
    ///
    /// # Errors
    ///
    /// See [`Self::to_absolute`].
    pub fn canonicalize(&self, path: &str, base: &BaseDir, follow_final: bool) -> Result<Resolved> {
        let absolute = self.to_absolute(path, base)?;
        Ok(self.resolve(&absolute, follow_final))
    }

    /// Removes `//`, `.` and `..` segments and resolves symlinks in an
    /// absolute path.
    ///
    /// Every intermediate component that is a symlink is replaced by its
    /// target; the final component is only followed when `follow_final`
    /// is set, or when a trailing `.` or `..` makes it a directory to
    /// enter. A `..` at the root stays at the root. A link seen twice ends
    /// resolution with the path built so far, as does a path that grows
    /// past [`PATH_MAX`]. Relative input is returned unchanged.
    #[must_use]
    pub fn resolve(&self, path: &str, follow_final: bool) -> Resolved {
        let mut resolved = Resolved {
            path: path.to_owned(),
            traversed_links: Vec::new(),
        };
        if !path.starts_with('/') {
            tracing::debug!(path, "relative path left unresolved");
            return resolved;
        }

        let buf = &mut resolved.path;
        let mut visited: HashSet<String> = HashSet::new();
        let mut follow_final = follow_final;
        let mut i = 1;

        loop {
            let bytes = buf.as_bytes();
            let last_segment = i >= bytes.len();
            if last_segment || bytes[i] == b'/' {
                let prev = previous_slash(bytes, i);
                let segment_len = i - prev - 1;
                if segment_len == 0 && !last_segment {
                    let _ = buf.remove(i);
                    continue;
                }
                if segment_len == 1 && bytes[i - 1] == b'.' {
                    if last_segment {
                        // `dir/.` names `dir` itself, which must be entered.
                        buf.truncate(prev.max(1));
                        i = buf.len();
                        follow_final = true;
                        continue;
                    }
                    buf.replace_range(i - 1..=i, "");
                    i -= 1;
                    continue;
                }
                if segment_len == 2 && bytes[i - 1] == b'.' && bytes[i - 2] == b'.' {
                    let start = if prev > 0 { previous_slash(bytes, prev) } else { prev };
                    if last_segment {
                        buf.truncate(start.max(1));
                        i = buf.len();
                        follow_final = true;
                        continue;
                    }
                    buf.replace_range(start + 1..=i, "");
                    i = start + 1;
                    continue;
                }
            }

            let at_end = i >= buf.len();
            let probe = if at_end {
                follow_final
            } else {
                buf.as_bytes()[i] == b'/'
            };
            let target = if probe {
                self.view.read_link(&buf[..i]).filter(|t| !t.is_empty())
            } else {
                None
            };

            let Some(target) = target else {
                if at_end {
                    break;
                }
                i += 1;
                continue;
            };

            let link = buf[..i].to_owned();
            if !visited.insert(link.clone()) {
                tracing::debug!(link = %link, "symlink cycle, stopping resolution");
                break;
            }
            resolved.traversed_links.push(link);

            let rest = &buf[i..];
            let rest = if target.ends_with('/') && rest.starts_with('/') {
                &rest[1..]
            } else {
                rest
            };
            let spliced = format!("{target}{rest}");

            if spliced.starts_with('/') {
                *buf = spliced;
                i = 1;
            } else {
                let slash = previous_slash(buf.as_bytes(), i);
                buf.truncate(slash + 1);
                buf.push_str(&spliced);
                i = slash + 1;
            }

            if buf.len() > PATH_MAX {
                tracing::debug!(len = buf.len(), "path exceeds PATH_MAX, stopping resolution");
                break;
            }
        }

        resolved
    }
}

/// Index of the last `/` strictly before `i`. Index 0 is always a slash in
/// an absolute path.
fn previous_slash(bytes: &[u8], i: usize) -> usize {
    bytes[..i].iter().rposition(|&b| b == b'/').unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    struct FakeFs {
        links: HashMap<String, String>,
        cwd: Option<String>,
    }

    impl FakeFs {
        fn link(mut self, from: &str, to: &str) -> Self {
            let _ = self.links.insert(from.to_owned(), to.to_owned());
            self
        }
    }

    impl FileSystemView for FakeFs {
        fn read_link(&self, path: &str) -> Option<String> {
            self.links.get(path).cloned()
        }
        fn current_dir(&self, _pid: Option<u32>) -> Option<String> {
            self.cwd.clone()
        }
        fn fd_path(&self, _fd: i32, _pid: Option<u32>) -> Option<String> {
            None
        }
        fn file_mode(&self, _path: &str) -> Option<u32> {
            None
        }
        fn fd_mode(&self, _fd: i32, _pid: Option<u32>) -> Option<u32> {
            None
        }
        fn modified_secs(&self, _path: &str) -> Option<i64> {
            None
        }
        fn command_line(&self, _pid: u32) -> Option<Vec<String>> {
            None
        }
        fn executable(&self) -> Option<String> {
            None
        }
    }

    fn resolve(fs: &FakeFs, path: &str, follow: bool) -> Resolved {
        Canonicalizer::new(fs).resolve(path, follow)
    }

    #[test]
    fn removes_duplicate_slashes_and_dot_segments() {
        let fs = FakeFs::default();
        assert_eq!(resolve(&fs, "/a//b/./c", true).path, "/a/b/c");
        assert_eq!(resolve(&fs, "/./a", true).path, "/a");
    }

    #[test]
    fn dot_dot_removes_previous_segment() {
        let fs = FakeFs::default();
        assert_eq!(resolve(&fs, "/a/b/../c", true).path, "/a/c");
        assert_eq!(resolve(&fs, "/a/../b", true).path, "/b");
    }

    #[test]
    fn dot_dot_at_root_stays_at_root() {
        let fs = FakeFs::default();
        assert_eq!(resolve(&fs, "/../a", true).path, "/a");
        assert_eq!(resolve(&fs, "/../../a", true).path, "/a");
    }

    #[test]
    fn trailing_dot_segments_are_collapsed() {
        let fs = FakeFs::default();
        assert_eq!(resolve(&fs, "/a/.", false).path, "/a");
        assert_eq!(resolve(&fs, "/a/b/..", false).path, "/a");
        assert_eq!(resolve(&fs, "/a/..", true).path, "/");
        assert_eq!(resolve(&fs, "/..", true).path, "/");
        assert_eq!(resolve(&fs, "/.", true).path, "/");
        assert_eq!(resolve(&fs, "/a/b/./..", true).path, "/a");
    }

    #[test]
    fn working_directory_itself_has_no_trailing_dot() {
        let fs = FakeFs {
            cwd: Some("/tmp".into()),
            ..FakeFs::default()
        };
        let resolved = Canonicalizer::new(&fs)
            .canonicalize(".", &BaseDir::CurrentDir { pid: None }, false)
            .unwrap();
        assert_eq!(resolved.path, "/tmp");
    }

    #[test]
    fn link_before_trailing_dot_is_entered() {
        let fs = FakeFs::default().link("/lib", "/usr/lib");
        let resolved = resolve(&fs, "/lib/.", false);
        assert_eq!(resolved.path, "/usr/lib");
        assert_eq!(resolved.traversed_links, vec!["/lib"]);
    }

    #[test]
    fn canonical_paths_are_fixed_points() {
        let fs = FakeFs::default().link("/lib", "/usr/lib");
        let once = resolve(&fs, "/lib/./x/../libc.so", true).path;
        assert_eq!(once, "/usr/lib/libc.so");
        assert_eq!(resolve(&fs, &once, true).path, once);
    }

    #[test]
    fn intermediate_links_are_each_reported() {
        let fs = FakeFs::default()
            .link("/a", "/real_a")
            .link("/real_a/b", "c")
            .link("/real_a/c/d", "../e");
        let resolved = resolve(&fs, "/a/b/d/file", true);
        assert_eq!(resolved.path, "/real_a/e/file");
        assert_eq!(
            resolved.traversed_links,
            vec!["/a", "/real_a/b", "/real_a/c/d"]
        );
    }

    #[test]
    fn final_link_followed_only_when_requested() {
        let fs = FakeFs::default().link("/bin/sh", "dash");
        let followed = resolve(&fs, "/bin/sh", true);
        assert_eq!(followed.path, "/bin/dash");
        assert_eq!(followed.traversed_links.len(), 1);

        let kept = resolve(&fs, "/bin/sh", false);
        assert_eq!(kept.path, "/bin/sh");
        assert!(kept.traversed_links.is_empty());
    }

    #[test]
    fn trailing_slash_in_target_is_not_doubled() {
        let fs = FakeFs::default().link("/opt", "/srv/opt/");
        assert_eq!(resolve(&fs, "/opt/tool", true).path, "/srv/opt/tool");
    }

    #[test]
    fn symlink_cycle_terminates() {
        let fs = FakeFs::default().link("/loop", "/loop");
        let resolved = resolve(&fs, "/loop/x", true);
        assert_eq!(resolved.traversed_links, vec!["/loop"]);
        assert_eq!(resolved.path, "/loop/x");
    }

    #[test]
    fn mutual_cycle_terminates() {
        let fs = FakeFs::default().link("/a", "/b").link("/b", "/a");
        let resolved = resolve(&fs, "/a/f", true);
        assert_eq!(resolved.traversed_links, vec!["/a", "/b"]);
    }

    #[test]
    fn relative_path_uses_working_directory() {
        let fs = FakeFs {
            cwd: Some("/work/".into()),
            ..FakeFs::default()
        };
        let canon = Canonicalizer::new(&fs);
        let abs = canon
            .to_absolute("src/../out", &BaseDir::CurrentDir { pid: None })
            .unwrap();
        assert_eq!(abs, "/work/src/../out");
        assert_eq!(canon.resolve(&abs, true).path, "/work/out");
    }

    #[test]
    fn relative_path_uses_directory_base() {
        let fs = FakeFs::default();
        let abs = Canonicalizer::new(&fs)
            .to_absolute("f", &BaseDir::Directory("/d".into()))
            .unwrap();
        assert_eq!(abs, "/d/f");
    }

    #[test]
    fn unknown_working_directory_is_unresolvable() {
        let fs = FakeFs::default();
        let err = Canonicalizer::new(&fs)
            .to_absolute("f", &BaseDir::CurrentDir { pid: Some(7) })
            .unwrap_err();
        assert!(matches!(err, SandtraceError::Unresolvable { .. }));
    }

    #[test]
    fn resolves_real_symlinks_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::create_dir(root.join("real")).unwrap();
        std::fs::write(root.join("real/file"), b"x").unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();

        let view = crate::fs_view::ProcFs;
        let input = format!("{}/alias/./file", root.display());
        let resolved = Canonicalizer::new(&view).resolve(&input, true);
        assert_eq!(resolved.path, format!("{}/real/file", root.display()));
        assert_eq!(
            resolved.traversed_links,
            vec![format!("{}/alias", root.display())]
        );
    }
}
