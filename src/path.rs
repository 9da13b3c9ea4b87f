//! Vault path helpers
//!
//! Vault paths are `/`-delimited. The normalized form used everywhere in
//! this crate has no leading or trailing separator, and its first segment
//! is the mount. A trailing separator on a list entry is the only signal
//! that the entry is a directory.

/// Path separator
pub const SEPARATOR: char = '/';

/// Marker segment inserted after a v2 mount for reads and writes
pub const DATA_MARKER: &str = "data";

/// Marker segment inserted after a v2 mount for listings
pub const METADATA_MARKER: &str = "metadata";

/// Strip leading separators (and surrounding whitespace)
pub fn ensure_no_leading_slash(s: &str) -> String {
    s.trim().trim_start_matches(SEPARATOR).to_string()
}

/// Strip trailing separators (and surrounding whitespace)
pub fn ensure_no_trailing_slash(s: &str) -> String {
    s.trim().trim_end_matches(SEPARATOR).to_string()
}

/// Append a separator unless one is already present
pub fn ensure_trailing_slash(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() || s.ends_with(SEPARATOR) {
        s.to_string()
    } else {
        format!("{s}{SEPARATOR}")
    }
}

/// Normalize a user-supplied path: no whitespace, no leading or trailing `/`
pub fn sanitize(s: &str) -> String {
    s.trim()
        .trim_start_matches(SEPARATOR)
        .trim_end_matches(SEPARATOR)
        .to_string()
}

/// A list entry is a directory iff it ends with the separator
pub fn is_directory(segment: &str) -> bool {
    segment.ends_with(SEPARATOR)
}

/// Join a normalized parent with a list entry, producing a normalized path
pub fn join(parent: &str, child: &str) -> String {
    let parent = sanitize(parent);
    let child = sanitize(child);
    match (parent.is_empty(), child.is_empty()) {
        (true, _) => child,
        (_, true) => parent,
        _ => format!("{parent}{SEPARATOR}{child}"),
    }
}

/// First segment of a normalized path
pub fn mount_of(path: &str) -> &str {
    path.split(SEPARATOR).next().unwrap_or_default()
}

/// Insert `marker` right after `mount_path` in `path`
///
/// `mount_path` may carry a trailing separator (as returned by the mount
/// lookup). Paths that already carry the marker are returned unchanged.
pub fn insert_after_mount(path: &str, mount_path: &str, marker: &str) -> String {
    let path = sanitize(path);
    let mount = sanitize(mount_path);

    let prefix = format!("{mount}{SEPARATOR}");
    let rest = if mount.is_empty() {
        path.clone()
    } else if path == mount {
        String::new()
    } else {
        match path.strip_prefix(&prefix) {
            Some(rest) => rest.to_string(),
            None => return path,
        }
    };

    if rest == marker || rest.starts_with(&format!("{marker}{SEPARATOR}")) {
        return path;
    }

    join(&join(&mount, marker), &rest)
}

/// Rewrite a listing-form path into the read form
///
/// Only a `metadata` segment directly after `mount_path` is replaced, so
/// mounts or secrets that are themselves named `metadata` keep their name.
pub fn list_to_read_form(path: &str, mount_path: &str) -> String {
    let path = sanitize(path);
    let mount = sanitize(mount_path);

    let (prefix, rest) = if mount.is_empty() {
        (String::new(), path.as_str())
    } else if let Some(rest) = path.strip_prefix(&format!("{mount}{SEPARATOR}")) {
        (format!("{mount}{SEPARATOR}"), rest)
    } else {
        return path;
    };

    match rest.strip_prefix(METADATA_MARKER) {
        Some(tail) if tail.is_empty() || tail.starts_with(SEPARATOR) => {
            format!("{prefix}{DATA_MARKER}{tail}")
        }
        _ => path,
    }
}
