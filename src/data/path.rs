/// Makes `path` absolute against the current directory and normalizes it
/// lexically. Symlinks are not resolved.
///
/// Returns `"ErrorPath"` when a relative path is given and the current
/// directory cannot be determined.
pub fn abspath(path: &str) -> String {
    if path.starts_with('/') {
        return normalize(path);
    }
    match std::env::current_dir() {
        Ok(cwd) => normalize(&format!("{}/{}", cwd.display(), path)),
        Err(_) => "ErrorPath".to_string(),
    }
}

/// Removes `.` segments, resolves `..` against the preceding segment and
/// collapses repeated separators. A path of exactly two leading slashes
/// keeps them, as POSIX leaves that prefix implementation defined.
pub fn normalize(path: &str) -> String {
    let root = if path.starts_with("//") && !path.starts_with("///") {
        "//"
    } else if path.starts_with('/') {
        "/"
    } else {
        ""
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if root.is_empty() {
                    segments.push(segment);
                }
            }
            _ => segments.push(segment),
        }
    }

    let joined = segments.join("/");
    match (root, joined.is_empty()) {
        ("", true) => ".".to_string(),
        (root, _) => format!("{root}{joined}"),
    }
}
