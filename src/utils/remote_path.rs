//! Paths on the device filesystem. Always `/`-separated and absolute.

/// Resolves `.` and `..` components and collapses repeated or trailing slashes.
/// Relative paths are taken from the device root.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    format!("/{}", parts.join("/"))
}

pub fn join(base: &str, name: &str) -> String {
    if name.starts_with('/') {
        return normalize(name);
    }
    normalize(&format!("{}/{}", base, name))
}

/// Parent directory; the root is its own parent.
pub fn parent(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}

/// Last path component, empty for the root.
pub fn file_name(path: &str) -> String {
    let normalized = normalize(path);
    normalized.rsplit('/').next().unwrap_or_default().to_string()
}
