//! Name/path length ceilings.
//!
//! These mirror common POSIX `NAME_MAX`/`PATH_MAX` values; AVFS enforces
//! them itself rather than relying on the underlying OS, since a virtual
//! path's handler-marker segments (`#gzip[...]`) can grow well past what
//! any single base-filesystem component would allow.

/// Longest a single path segment (between two `/`) may be.
pub const MAX_NAME_LEN: usize = 255;

/// Longest a full virtual path string may be.
pub const MAX_PATH_LEN: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_match_common_posix_values() {
        assert_eq!(MAX_NAME_LEN, 255);
        assert_eq!(MAX_PATH_LEN, 4096);
    }
}
