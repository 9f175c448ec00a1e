//! Oberon File Resolution
//!
//! Decides which file on disk answers a request.
//!
//! Outside an Oberon tree the lookup is flat: `root/filename`. When the
//! served root sits at or below a directory literally named `Oberon`, the
//! lookup walks from the root towards that directory and the closest match
//! wins, so a project directory overrides the shared modules of its
//! ancestors:
//!
//! ```text
//! Oberon/
//! ├── Lib/          shared library, searched last
//! └── proj/         served root, searched first
//!     └── sub/
//! ```

use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

/// Directory name marking the top of an Oberon tree
pub const OBERON_DIR: &str = "Oberon";

/// Shared library directory inside the Oberon tree
pub const LIB_DIR: &str = "Lib";

/// Outcome of a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedLocation {
    /// The path to open
    Found(PathBuf),
    /// Nothing matched; carries `root/filename` so that opening it yields the
    /// filesystem's own not-found error
    NotFound(PathBuf),
}

impl ResolvedLocation {
    pub fn path(&self) -> &Path {
        match self {
            Self::Found(path) | Self::NotFound(path) => path,
        }
    }

    pub fn into_path(self) -> PathBuf {
        match self {
            Self::Found(path) | Self::NotFound(path) => path,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Strategy mapping a requested name to a file under a root
pub trait FileResolver: Send + Sync {
    /// `filename` must already be sanitized, see [`sanitize_filename`].
    fn resolve(&self, root: &Path, filename: &Path) -> ResolvedLocation;

    /// Directory every resolved file must really live under, symlinks followed
    fn confinement<'a>(&self, root: &'a Path) -> &'a Path {
        root
    }
}

/// `root/filename`, existence is left to the open call
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatResolver;

impl FileResolver for FlatResolver {
    fn resolve(&self, root: &Path, filename: &Path) -> ResolvedLocation {
        ResolvedLocation::Found(root.join(filename))
    }
}

/// Hierarchy-aware lookup for roots inside an Oberon tree
#[derive(Debug, Clone, Copy, Default)]
pub struct OberonResolver;

impl FileResolver for OberonResolver {
    /// The whole Oberon tree, which holds the ancestors and `Lib`
    fn confinement<'a>(&self, root: &'a Path) -> &'a Path {
        root.ancestors().find(|dir| is_oberon_dir(dir)).unwrap_or(root)
    }

    fn resolve(&self, root: &Path, filename: &Path) -> ResolvedLocation {
        let mut current = root;
        let mut top = None;

        loop {
            if is_oberon_dir(current) {
                top = Some(current);
                break;
            }

            let candidate = current.join(filename);
            debug!("looking for {} in {}", filename.display(), current.display());
            if candidate.is_file() {
                return ResolvedLocation::Found(candidate);
            }

            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }

        let mut libraries = vec![root.join(OBERON_DIR).join(LIB_DIR)];
        if let Some(top) = top {
            libraries.push(top.join(LIB_DIR));
        }

        for lib in libraries {
            let candidate = lib.join(filename);
            debug!("looking for {} in {}", filename.display(), lib.display());
            if candidate.is_file() {
                return ResolvedLocation::Found(candidate);
            }
        }

        let requested = root.join(filename);
        debug!("{} not found", requested.display());
        ResolvedLocation::NotFound(requested)
    }
}

fn is_oberon_dir(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == OBERON_DIR)
}

/// True when `root` or one of its ancestors is named `Oberon`
pub fn is_under_oberon(root: &Path) -> bool {
    root.components().any(|c| c.as_os_str() == OBERON_DIR)
}

/// Pick the lookup strategy for a served root
pub fn resolver_for(root: &Path) -> Box<dyn FileResolver> {
    if is_under_oberon(root) {
        Box::new(OberonResolver)
    } else {
        Box::new(FlatResolver)
    }
}

/// Check that an existing `path` really lives under `base`.
///
/// Both paths are canonicalized, so a symlink pointing out of `base` is
/// refused with `PermissionDenied`. A missing `path` yields the filesystem's
/// `NotFound`. Returns the canonical path.
pub fn confine_existing(base: &Path, path: &Path) -> io::Result<PathBuf> {
    let base_canon = base.canonicalize()?;
    let path_canon = path.canonicalize()?;

    if !path_canon.starts_with(&base_canon) {
        return Err(outside(path, base));
    }
    Ok(path_canon)
}

/// Check that a file about to be created at `path` ends up under `base`.
///
/// The parent directory must exist and canonicalize to somewhere under
/// `base`. Returns the canonical parent joined with the file name.
pub fn confine_new(base: &Path, path: &Path) -> io::Result<PathBuf> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(outside(path, base));
    };

    let base_canon = base.canonicalize()?;
    let parent_canon = parent.canonicalize()?;

    if !parent_canon.starts_with(&base_canon) {
        return Err(outside(path, base));
    }
    Ok(parent_canon.join(name))
}

fn outside(path: &Path, base: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("{} leads outside {}", path.display(), base.display()),
    )
}

/// Normalize a requested filename into a relative path that cannot leave the root.
///
/// Leading separators are dropped, `.` is skipped and `..` removes the
/// previous component without ever climbing above the root. Returns `None`
/// when nothing is left to name a file.
///
/// # Examples
/// ```
/// use std::path::PathBuf;
/// use otftp::sanitize_filename;
///
/// assert_eq!(sanitize_filename("/tmp/testfile"), Some(PathBuf::from("tmp/testfile")));
/// assert_eq!(sanitize_filename("../../tmp/testfile"), Some(PathBuf::from("tmp/testfile")));
/// assert_eq!(sanitize_filename(".."), None);
/// ```
pub fn sanitize_filename(filename: &str) -> Option<PathBuf> {
    if filename.contains('\0') {
        return None;
    }

    let mut clean = PathBuf::new();
    for component in Path::new(filename).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::ParentDir => {
                clean.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    (!clean.as_os_str().is_empty()).then_some(clean)
}
