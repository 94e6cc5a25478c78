//! Post-compilation check that source rewriting actually took effect.

use std::path::Path;

use walkdir::WalkDir;

/// Returns true if at least one `.c` file under `repo_path` contains `marker`.
pub fn contains_marker(repo_path: &Path, marker: &str) -> std::io::Result<bool> {
    let needle = marker.as_bytes();
    for entry in WalkDir::new(repo_path).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|e| e.to_str()) != Some("c") {
            continue;
        }
        let content = std::fs::read(entry.path())?;
        if content.windows(needle.len()).any(|w| w == needle) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::ADV_MARKER;

    #[test]
    fn test_marker_found_in_nested_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).expect("mkdir");
        std::fs::write(src.join("plain.c"), "int main(void) { return 0; }\n").expect("write");
        std::fs::write(
            src.join("rewritten.c"),
            format!("#ifndef HEADERFILE\n{ADV_MARKER}\n#endif\nint main(void) {{ return 0; }}\n"),
        )
        .expect("write");

        assert!(contains_marker(dir.path(), ADV_MARKER).expect("scan"));
    }

    #[test]
    fn test_marker_only_counts_c_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("notes.h"), ADV_MARKER).expect("write");
        std::fs::write(dir.path().join("main.c"), "int main(void) { return 0; }\n").expect("write");

        assert!(!contains_marker(dir.path(), ADV_MARKER).expect("scan"));
    }
}
