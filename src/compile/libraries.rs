//! Linked-library bookkeeping.
//!
//! The library log is a plain text file of whitespace-separated library names
//! (`m pthread ssl`). A missing log means no libraries were recorded.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

/// Name of the per-variant library log inside the output directory.
pub const LIBRARY_LOG_NAME: &str = "libraries.txt";

static LIBRARY_FLAG: OnceLock<Option<Regex>> = OnceLock::new();

fn library_flag() -> Option<&'static Regex> {
    LIBRARY_FLAG
        .get_or_init(|| Regex::new(r"(?:^|\s)-l([A-Za-z0-9_+.\-]+)").ok())
        .as_ref()
}

/// Library names passed as `-l<name>` in captured build output.
pub fn parse_library_flags(output: &str) -> BTreeSet<String> {
    let Some(re) = library_flag() else {
        return BTreeSet::new();
    };
    re.captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Read a library log, deduplicating names.
pub fn read_library_log(path: &Path) -> std::io::Result<BTreeSet<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.split_whitespace().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(e) => Err(e),
    }
}

/// Overwrite a library log with one name per line.
pub fn write_library_log(path: &Path, libraries: &BTreeSet<String>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut content = libraries.iter().cloned().collect::<Vec<_>>().join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    std::fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_library_flags() {
        let output = "gcc -o app main.o -lm -lpthread -L/usr/lib\ncc -lssl -lm foo.c\n-lz";
        let libs = parse_library_flags(output);
        assert_eq!(
            libs,
            BTreeSet::from(["m", "pthread", "ssl", "z"].map(String::from))
        );
    }

    #[test]
    fn test_parse_ignores_embedded_flags() {
        assert!(parse_library_flags("gcc -Wl,-rpath foo-lbar").is_empty());
    }

    #[test]
    fn test_read_missing_log_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let libs = read_library_log(&dir.path().join(LIBRARY_LOG_NAME)).expect("read");
        assert!(libs.is_empty());
    }

    #[test]
    fn test_write_then_read_deduplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(LIBRARY_LOG_NAME);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "m pthread\nm  ssl\n").expect("write");
        let libs = read_library_log(&path).expect("read");
        assert_eq!(libs.len(), 3);

        write_library_log(&path, &libs).expect("write");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "m\npthread\nssl\n");
    }
}
