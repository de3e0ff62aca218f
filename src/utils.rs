use std::ffi::OsString;
use std::path::{Path, PathBuf};
use url::Url;

const TEMP_SUFFIX: &str = "-temp";
const RESUME_SUFFIX: &str = "-resume";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Where the payload is written before the final rename: `D-temp`.
pub fn temp_path(destination: &Path) -> PathBuf {
    with_suffix(destination, TEMP_SUFFIX)
}

/// Where the resume metadata lives: `D-resume`.
pub fn resume_path(destination: &Path) -> PathBuf {
    with_suffix(destination, RESUME_SUFFIX)
}

/// Absolute form of `path`, so that relative spellings of one destination share a session.
pub fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

pub fn get_filename_from_url(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    let filename = url.path_segments()?.last()?;
    if filename.is_empty() {
        None
    } else {
        Some(filename.to_string())
    }
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn companion_paths_append_suffix() {
        let dest = Path::new("/data/model.bin");
        assert_eq!(temp_path(dest), PathBuf::from("/data/model.bin-temp"));
        assert_eq!(resume_path(dest), PathBuf::from("/data/model.bin-resume"));
    }

    #[test]
    fn filename_from_url() {
        assert_eq!(
            get_filename_from_url("https://example.com/files/blob.tar?x=1").as_deref(),
            Some("blob.tar")
        );
        assert_eq!(get_filename_from_url("https://example.com/"), None);
        assert_eq!(get_filename_from_url("not a url"), None);
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_filename("a b/c?.bin"), "a_b_c_.bin");
    }

    #[test]
    fn absolute_path_keeps_absolute_input() {
        let abs = Path::new("/tmp/x");
        assert_eq!(absolute_path(abs), PathBuf::from("/tmp/x"));
        assert!(absolute_path(Path::new("rel.bin")).is_absolute());
    }
}
