//! Blob key derivation.
//!
//! Uploaded blobs live at `{prefix}/{request path}/{uuid}/{filename}` with
//! exactly one `/` between segments, whatever separators the request path
//! already carries.

use percent_encoding::percent_decode_str;

/// Join two path segments with exactly one `/` between them.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Percent-decode a raw request path.
pub fn decode_request_path(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Blob key addressed by a GET: the decoded request path without its
/// leading `/`.
pub fn download_key(raw_path: &str) -> String {
    let decoded = decode_request_path(raw_path);
    match decoded.strip_prefix('/') {
        Some(rest) => rest.to_string(),
        None => decoded,
    }
}

/// Storage key for a new upload.
///
/// `prefix` is expected to be normalized (no leading or trailing `/`).
pub fn upload_key(prefix: &str, request_path: &str, id: &str, filename: &str) -> String {
    // Exactly one leading '/', however many the request carried.
    let path = format!("/{}", request_path.trim_start_matches('/'));
    let joined = format!("{}{}/{}", prefix, single_joining_slash(&path, id), filename);
    if prefix.is_empty() {
        joined.trim_start_matches('/').to_string()
    } else {
        joined
    }
}

/// Public URL returned to the uploader.
pub fn public_url(base_url: &str, key: &str) -> String {
    format!("{}/{}", base_url, key)
}

/// Reduce a client-supplied filename to its last path component.
///
/// Returns `None` when nothing usable remains.
pub fn base_filename(raw: &str) -> Option<&str> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or("");
    match name {
        "" | "." | ".." => None,
        name => Some(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_joining_slash() {
        assert_eq!(single_joining_slash("/a/", "b"), "/a/b");
        assert_eq!(single_joining_slash("/a", "b"), "/a/b");
        assert_eq!(single_joining_slash("/a/", "/b"), "/a/b");
        assert_eq!(single_joining_slash("/a", "/b"), "/a/b");
    }

    #[test]
    fn test_upload_key_trailing_slash_path() {
        assert_eq!(
            upload_key("uploads", "/a/", "1234", "x.png"),
            "uploads/a/1234/x.png"
        );
    }

    #[test]
    fn test_upload_key_separator_variants_agree() {
        let expected = "uploads/a/b/id/f.txt";
        for path in ["/a/b", "/a/b/", "a/b", "a/b/"] {
            assert_eq!(upload_key("uploads", path, "id", "f.txt"), expected);
        }
    }

    #[test]
    fn test_upload_key_collapses_leading_slashes() {
        assert_eq!(upload_key("files", "//a", "id", "f"), "files/a/id/f");
        assert_eq!(upload_key("", "//a", "id", "f"), "a/id/f");
    }

    #[test]
    fn test_upload_key_root_path() {
        assert_eq!(upload_key("uploads", "/", "id", "f.txt"), "uploads/id/f.txt");
    }

    #[test]
    fn test_upload_key_empty_prefix() {
        assert_eq!(upload_key("", "/a/", "id", "f.txt"), "a/id/f.txt");
        assert_eq!(upload_key("", "/", "id", "f.txt"), "id/f.txt");
    }

    #[test]
    fn test_upload_key_never_doubles_separators() {
        for path in ["/", "//", "/a", "//a", "///a/", "/a/", "/a/b/c/"] {
            let key = upload_key("pre/fix", path, "id", "f");
            assert!(!key.contains("//"), "{key}");
            assert!(!key.starts_with('/'), "{key}");
        }
    }

    #[test]
    fn test_download_key() {
        assert_eq!(download_key("/uploads/a/id/x.png"), "uploads/a/id/x.png");
        assert_eq!(download_key("/with%20space.txt"), "with space.txt");
        assert_eq!(download_key("/"), "");
    }

    #[test]
    fn test_public_url() {
        assert_eq!(
            public_url("https://cdn.example.com", "uploads/id/x.png"),
            "https://cdn.example.com/uploads/id/x.png"
        );
        assert_eq!(public_url("", "k"), "/k");
    }

    #[test]
    fn test_base_filename() {
        assert_eq!(base_filename("photo.jpg"), Some("photo.jpg"));
        assert_eq!(base_filename("dir/photo.jpg"), Some("photo.jpg"));
        assert_eq!(base_filename("C:\\Users\\me\\photo.jpg"), Some("photo.jpg"));
        assert_eq!(base_filename(""), None);
        assert_eq!(base_filename("dir/"), None);
        assert_eq!(base_filename(".."), None);
    }
}
