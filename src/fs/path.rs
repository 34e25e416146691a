//! Path parsing.
//!
//! A path is a run of `/`-separated components. Parsing never allocates:
//! [`Path`] and [`FileName`] borrow from the caller's string, and
//! [`Path::split_component`] is a pure function over the remaining input so
//! the walk in the resolver (and the tests) can drive it one step at a time.

use super::FsError;
use crate::param::NAME_MAX;

/// One path component.
#[derive(Debug, PartialEq)]
#[repr(transparent)]
pub struct FileName {
    // Invariant:
    // - Nonempty, contains no '/'.
    // - At most NAME_MAX bytes.
    inner: str,
}

impl FileName {
    /// Wraps a component already known to satisfy the invariant.
    fn from_str_unchecked(name: &str) -> &FileName {
        // SAFETY: `&FileName` is layout-compatible with `str` because of
        // its `#[repr(transparent)]` attribute.
        unsafe { &*(name as *const str as *const FileName) }
    }

    /// Validates `name` as a single component.
    pub fn new(name: &str) -> Result<&FileName, FsError> {
        if name.is_empty() || name.contains('/') {
            return Err(FsError::NotFound);
        }
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        Ok(FileName::from_str_unchecked(name))
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

#[derive(Debug, PartialEq)]
#[repr(transparent)]
pub struct Path {
    inner: str,
}

impl Path {
    pub fn new(path: &str) -> &Path {
        // SAFETY: `&Path` is layout-compatible with `str` because of its
        // `#[repr(transparent)]` attribute.
        unsafe { &*(path as *const str as *const Path) }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Returns `true` if the path begins with `'/'`.
    pub fn is_absolute(&self) -> bool {
        self.inner.starts_with('/')
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Splits off the next component.
    ///
    /// Returns `Ok(Some((rest, name)))` where `name` is the next component
    /// and `rest` is the remaining path with no leading slashes, so the
    /// caller can check `rest.is_empty()` to see whether `name` was the
    /// last one. Returns `Ok(None)` when no component remains (the path is
    /// empty or all slashes), and `Err(NameTooLong)` for a component longer
    /// than `NAME_MAX`.
    pub fn split_component(&self) -> Result<Option<(&Path, &FileName)>, FsError> {
        let trimmed = self.inner.trim_start_matches('/');
        if trimmed.is_empty() {
            return Ok(None);
        }
        let len = trimmed.find('/').unwrap_or(trimmed.len());
        if len > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        let name = FileName::from_str_unchecked(&trimmed[..len]);
        let rest = trimmed[len..].trim_start_matches('/');
        Ok(Some((Path::new(rest), name)))
    }

    /// The last component, or `""` when the path contains none.
    pub fn basename(&self) -> Result<&str, FsError> {
        let mut rest = self;
        let mut last = "";
        while let Some((next, name)) = rest.split_component()? {
            rest = next;
            last = name.as_str();
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_component_walks_the_path() {
        let (rest, name) = Path::new("a/bb/c").split_component().unwrap().unwrap();
        assert_eq!(name.as_str(), "a");
        assert_eq!(rest.as_str(), "bb/c");

        let (rest, name) = Path::new("///a//bb").split_component().unwrap().unwrap();
        assert_eq!(name.as_str(), "a");
        assert_eq!(rest.as_str(), "bb");

        let (rest, name) = Path::new("a").split_component().unwrap().unwrap();
        assert_eq!(name.as_str(), "a");
        assert!(rest.is_empty());

        assert!(Path::new("").split_component().unwrap().is_none());
        assert!(Path::new("////").split_component().unwrap().is_none());
    }

    #[test]
    fn overlength_component_is_malformed() {
        let long = "x".repeat(NAME_MAX + 1);
        assert_eq!(
            Path::new(&long).split_component().unwrap_err(),
            FsError::NameTooLong
        );
        let nested = format!("ok/{}/tail", long);
        let (rest, _) = Path::new(&nested).split_component().unwrap().unwrap();
        assert_eq!(rest.split_component().unwrap_err(), FsError::NameTooLong);
    }

    #[test]
    fn basename_is_the_last_component() {
        assert_eq!(Path::new("a/bb/c").basename().unwrap(), "c");
        assert_eq!(Path::new("/a/bb/").basename().unwrap(), "bb");
        assert_eq!(Path::new("/").basename().unwrap(), "");
        assert_eq!(Path::new("").basename().unwrap(), "");
    }

    #[test]
    fn absolute_paths_start_with_slash() {
        assert!(Path::new("/etc").is_absolute());
        assert!(!Path::new("etc").is_absolute());
        assert!(!Path::new("").is_absolute());
    }

    #[test]
    fn filename_validation() {
        assert!(FileName::new("sample.txt").is_ok());
        assert!(FileName::new("").is_err());
        assert!(FileName::new("a/b").is_err());
        assert!(FileName::new(&"y".repeat(NAME_MAX + 1)).is_err());
        assert!(FileName::new(&"y".repeat(NAME_MAX)).is_ok());
    }
}
