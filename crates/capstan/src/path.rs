//! Guest path handling: segment normalization and pre-open prefix
//! matching.

use crate::error::Error;

/// Split a guest-relative path into clean segments.
///
/// `.` and empty segments are dropped; `..` pops the previous segment, and
/// popping past the mount root is `NOTCAPABLE`.
pub fn normalize(path: &str) -> Result<Vec<String>, Error> {
    let mut segments: Vec<String> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::not_capable()
                        .context(format!("path {path:?} escapes the pre-opened directory")));
                }
            }
            other => segments.push(other.to_owned()),
        }
    }
    Ok(segments)
}

pub fn join(segments: &[String]) -> String {
    segments.join("/")
}

/// If `preopen` is a whole-segment prefix of the absolute path `abs`,
/// return the remainder (possibly empty). `/sandbox` is not a prefix of
/// `/sandbox2/x`.
pub fn strip_prefix<'a>(preopen: &str, abs: &'a str) -> Option<&'a str> {
    let rest = abs.strip_prefix(preopen)?;
    if preopen.ends_with('/') {
        // a mount at "/" (or any trailing-slash spelling)
        return Some(rest);
    }
    match rest.strip_prefix('/') {
        Some(tail) => Some(tail),
        None if rest.is_empty() => Some(""),
        None => None,
    }
}
