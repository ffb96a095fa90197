//! Virtual path resolution for the session's directory and file map.

/// Resolves `path` against `base`, expanding `~` to `home` and folding `.`
/// and `..` segments. Always returns an absolute path without a trailing
/// slash (except for the root itself).
pub fn resolve(base: &str, path: &str, home: &str) -> String {
    let path = path.trim();
    let joined = if path.is_empty() || path == "~" {
        home.to_owned()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("{home}/{rest}")
    } else if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("{base}/{path}")
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Parent directory of an absolute path. The root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}
