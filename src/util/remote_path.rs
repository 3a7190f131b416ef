/// Join path segments on the remote (always posix) side, normalizing
/// duplicate separators, without local filesystem access.
pub fn join_remote(base: &str, segment: &str) -> String {
    let base = base.trim_end_matches('/');
    let segment = segment.trim_start_matches("./").trim_start_matches('/');
    if segment.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base, segment)
}

/// Sanitize an arbitrary path-like string into a single safe path segment
/// (used for cache fingerprints derived from Globus paths).
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "root".to_string()
    } else {
        cleaned
    }
}

/// Minimal single-quote escaping for values interpolated into remote shell
/// commands.
pub fn sh_escape(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_remote_normalizes_separators() {
        assert_eq!(join_remote("/scratch/jobs/", "abc"), "/scratch/jobs/abc");
        assert_eq!(join_remote("/scratch/jobs", "/abc"), "/scratch/jobs/abc");
        assert_eq!(join_remote("/scratch/jobs", "./abc"), "/scratch/jobs/abc");
        assert_eq!(join_remote("/scratch/jobs", ""), "/scratch/jobs");
    }

    #[test]
    fn sanitize_segment_replaces_unsafe_chars() {
        assert_eq!(sanitize_segment("/shared/data set/v1"), "shared_data_set_v1");
        assert_eq!(sanitize_segment("plain-name_1.0"), "plain-name_1.0");
        assert_eq!(sanitize_segment("///"), "root");
    }

    #[test]
    fn sh_escape_wraps_single_quotes() {
        assert_eq!(sh_escape("abc"), "'abc'");
        assert_eq!(sh_escape("it's"), r"'it'\''s'");
    }
}
