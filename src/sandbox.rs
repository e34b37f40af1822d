use std::ffi::OsString;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::{PipelineError, PipelineResult};

/// An absolute path proven to live under the sandbox root.
///
/// Only [`SandboxGuard`] hands these out; handlers never build one from a raw
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SandboxedPath {
    absolute: PathBuf,
    relative: String,
}

impl SandboxedPath {
    pub fn as_path(&self) -> &Path {
        &self.absolute
    }

    /// Root-relative form with `/` separators, `.` for the root itself.
    pub fn relative(&self) -> &str {
        &self.relative
    }

}

impl AsRef<Path> for SandboxedPath {
    fn as_ref(&self) -> &Path {
        &self.absolute
    }
}

impl fmt::Display for SandboxedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative)
    }
}

#[derive(Debug, Clone)]
pub struct SandboxGuard {
    root: PathBuf,
    logical_prefix: String,
}

impl SandboxGuard {
    pub fn new(root: &Path, logical_prefix: &str) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed creating sandbox root {}", root.display()))?;
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("failed canonicalizing sandbox root {}", root.display()))?;
        Ok(Self {
            root,
            logical_prefix: logical_prefix.trim().trim_matches('/').to_owned(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, raw: &str) -> PipelineResult<SandboxedPath> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::sandbox_violation(
                "path must be a non-empty string",
            ));
        }

        let normalized = trimmed.replace('\\', "/");
        let relative = strip_logical_prefix(normalized.trim_start_matches('/'), &self.logical_prefix);

        let mut candidate = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => candidate.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if candidate == self.root {
                        return Err(self.escape_error(raw));
                    }
                    candidate.pop();
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(self.escape_error(raw));
                }
            }
        }

        self.adopt(&candidate).map_err(|_| self.escape_error(raw))
    }

    /// Re-validates a path discovered on disk (for example while walking a
    /// sandboxed directory), following symlinks before the prefix check.
    pub fn adopt(&self, path: &Path) -> PipelineResult<SandboxedPath> {
        let resolved = canonicalize_with_missing_segments(path).map_err(|err| {
            PipelineError::sandbox_violation(format!(
                "failed resolving {}: {err:#}",
                path.display()
            ))
        })?;
        if !resolved.starts_with(&self.root) {
            return Err(self.escape_error(&path.display().to_string()));
        }
        let relative = display_path(&self.root, &resolved);
        Ok(SandboxedPath {
            absolute: resolved,
            relative,
        })
    }

    fn escape_error(&self, raw: &str) -> PipelineError {
        PipelineError::sandbox_violation(format!(
            "path `{raw}` escapes sandbox root {}",
            self.root.display()
        ))
    }
}

fn strip_logical_prefix<'a>(path: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return path;
    }
    if path == prefix {
        return "";
    }
    match path.strip_prefix(prefix) {
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => path,
    }
}

const MAX_SYMLINK_HOPS: usize = 40;

/// Canonicalizes the longest existing prefix and re-appends the rest.
/// Dangling symlinks are followed to their target so a link to a missing
/// file outside the root cannot pass as a missing segment.
fn canonicalize_with_missing_segments(path: &Path) -> Result<PathBuf> {
    let mut cursor = path.to_path_buf();
    let mut missing = Vec::<OsString>::new();
    let mut hops = 0;
    loop {
        match std::fs::symlink_metadata(&cursor) {
            Ok(meta) if meta.file_type().is_symlink() && !cursor.exists() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    anyhow::bail!("too many symlink hops resolving {}", path.display());
                }
                let target = std::fs::read_link(&cursor)
                    .with_context(|| format!("failed reading symlink {}", cursor.display()))?;
                cursor = match cursor.parent() {
                    Some(parent) => parent.join(target),
                    None => target,
                };
                continue;
            }
            Ok(_) => {
                let mut resolved = cursor
                    .canonicalize()
                    .with_context(|| format!("failed canonicalizing path {}", cursor.display()))?;
                for part in missing.iter().rev() {
                    resolved.push(part);
                }
                return Ok(resolved);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed inspecting {}", cursor.display()));
            }
        }

        let file_name = cursor
            .file_name()
            .with_context(|| format!("unable to resolve parent path for {}", path.display()))?;
        missing.push(file_name.to_os_string());
        cursor = cursor
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("unable to resolve parent path for {}", path.display()))?;
    }
}

fn display_path(root: &Path, path: &Path) -> String {
    if let Ok(relative) = path.strip_prefix(root) {
        let text = relative.to_string_lossy().to_string();
        if text.is_empty() {
            ".".to_owned()
        } else {
            text.replace('\\', "/")
        }
    } else {
        path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use proptest::prelude::*;

    use super::*;
    use crate::error::PipelineErrorCode;

    fn temp_path(tag: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        root.push(format!("taskdesk-rs-sandbox-{tag}-{stamp}"));
        root
    }

    fn guard(tag: &str) -> SandboxGuard {
        SandboxGuard::new(&temp_path(tag), "data").expect("sandbox guard")
    }

    #[test]
    fn traversal_above_root_is_rejected() {
        let guard = guard("traversal");
        for raw in [
            "../../etc/passwd",
            "..",
            "/data/../../etc/passwd",
            "reports/../../outside.txt",
            "./../x",
        ] {
            let err = guard.resolve(raw).expect_err(raw);
            assert_eq!(err.code, PipelineErrorCode::SandboxViolation, "{raw}");
        }
    }

    #[test]
    fn logical_prefix_and_leading_separators_are_equivalent() {
        let guard = guard("prefix");
        let a = guard.resolve("/data/dates.txt").expect("prefixed");
        let b = guard.resolve("data/dates.txt").expect("bare prefix");
        let c = guard.resolve("dates.txt").expect("relative");
        let d = guard.resolve("//dates.txt").expect("leading separators");
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(c, d);
        assert_eq!(a.relative(), "dates.txt");
        assert!(a.as_path().starts_with(guard.root()));
    }

    #[test]
    fn absolute_paths_are_rebased_under_root() {
        let guard = guard("absolute");
        let resolved = guard.resolve("/etc/passwd").expect("rebased");
        assert!(resolved.as_path().starts_with(guard.root()));
        assert_eq!(resolved.relative(), "etc/passwd");
    }

    #[test]
    fn prefix_alone_names_the_root() {
        let guard = guard("root");
        let resolved = guard.resolve("/data/").expect("root");
        assert_eq!(resolved.as_path(), guard.root());
        assert_eq!(resolved.relative(), ".");
    }

    #[test]
    fn inner_parent_segments_stay_inside() {
        let guard = guard("inner");
        let resolved = guard.resolve("logs/../docs/./a.md").expect("inner");
        assert_eq!(resolved.relative(), "docs/a.md");
    }

    #[test]
    fn similarly_named_prefix_is_not_stripped() {
        let guard = guard("dataset");
        let resolved = guard.resolve("dataset/x.csv").expect("dataset");
        assert_eq!(resolved.relative(), "dataset/x.csv");
    }

    #[test]
    fn empty_path_is_a_violation() {
        let guard = guard("empty");
        let err = guard.resolve("   ").expect_err("empty");
        assert_eq!(err.code, PipelineErrorCode::SandboxViolation);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_root_is_rejected() {
        let outside = temp_path("outside");
        std::fs::create_dir_all(&outside).expect("outside dir");
        std::fs::write(outside.join("secret.txt"), "s3cret").expect("secret");
        let guard = guard("symlink");
        std::os::unix::fs::symlink(&outside, guard.root().join("link")).expect("symlink");

        let err = guard.resolve("link/secret.txt").expect_err("symlink escape");
        assert_eq!(err.code, PipelineErrorCode::SandboxViolation);
        let err = guard
            .adopt(&guard.root().join("link").join("secret.txt"))
            .expect_err("adopt escape");
        assert_eq!(err.code, PipelineErrorCode::SandboxViolation);
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_to_outside_file_is_rejected() {
        let outside = temp_path("dangling-outside");
        std::fs::create_dir_all(&outside).expect("outside dir");
        let target = outside.join("pwned.txt");
        let guard = guard("dangling");
        std::os::unix::fs::symlink(&target, guard.root().join("out.txt")).expect("symlink");

        let err = guard.resolve("data/out.txt").expect_err("dangling escape");
        assert_eq!(err.code, PipelineErrorCode::SandboxViolation);
        assert!(!target.exists());
        let _ = std::fs::remove_dir_all(outside);
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_inside_root_resolves_to_its_target() {
        let guard = guard("dangling-inside");
        std::fs::create_dir_all(guard.root().join("real")).expect("real dir");
        std::os::unix::fs::symlink("real/target.txt", guard.root().join("alias.txt"))
            .expect("symlink");

        let path = guard.resolve("data/alias.txt").expect("inside target");
        assert_eq!(path.relative(), "real/target.txt");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loop_is_a_violation() {
        let guard = guard("symlink-loop");
        std::os::unix::fs::symlink("b", guard.root().join("a")).expect("symlink a");
        std::os::unix::fs::symlink("a", guard.root().join("b")).expect("symlink b");

        let err = guard.resolve("a").expect_err("loop");
        assert_eq!(err.code, PipelineErrorCode::SandboxViolation);
    }

    proptest! {
        #[test]
        fn resolve_is_inside_root_or_a_violation(raw in "[a-z./\\\\]{0,32}") {
            let guard = SandboxGuard::new(&std::env::temp_dir().join("taskdesk-rs-sandbox-prop"), "data")
                .expect("sandbox guard");
            match guard.resolve(&raw) {
                Ok(path) => prop_assert!(path.as_path().starts_with(guard.root())),
                Err(err) => prop_assert_eq!(err.code, PipelineErrorCode::SandboxViolation),
            }
        }
    }
}
