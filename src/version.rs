// written by build.rs.
// First line is commit sha (or "unknown"), second line is date of build.
pub const VERSION_DATA: &str = include_str!(concat!(env!("OUT_DIR"), "/VERSION.txt"));

pub fn commit_sha() -> &'static str {
    VERSION_DATA.lines().next().unwrap_or("")
}

/// First eight of the commit sha, for page footers and such.
pub fn short_sha() -> &'static str {
    let sha = commit_sha();
    sha.get(..8).unwrap_or(sha)
}

pub fn build_date() -> &'static str {
    VERSION_DATA.lines().nth(1).unwrap_or("")
}
