//! Repository list parsing.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::warn;

use super::RepositoryRecord;

/// Extract `(owner, name)` from a repository URL.
///
/// Trailing slashes and a trailing `.git` are stripped; owner and name are
/// the last two `/`-separated segments. Returns `None` for lines that do not
/// have two non-empty segments.
pub fn parse_repo_url(line: &str) -> Option<(String, String)> {
    let mut url = line.trim().trim_end_matches('/');
    if let Some(stripped) = url.strip_suffix(".git") {
        url = stripped;
    }
    let mut segments = url.rsplit('/');
    let name = segments.next()?;
    let owner = segments.next()?;
    if owner.is_empty() || name.is_empty() || owner.ends_with(':') {
        return None;
    }
    Some((owner.to_string(), name.to_string()))
}

/// Iterate over the repositories listed in `path`, one URL per line.
///
/// Blank and malformed lines are skipped without consuming an index. When
/// `max_count` is set, iteration stops after that many repositories.
pub fn iter_repos(
    path: &Path,
    max_count: Option<usize>,
) -> std::io::Result<impl Iterator<Item = RepositoryRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let iter = reader
        .lines()
        .map_while(Result::ok)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parsed = parse_repo_url(&line);
            if parsed.is_none() {
                warn!(line = %line, "Skipping malformed repository URL");
            }
            parsed
        })
        .enumerate()
        .map(|(idx, (owner, name))| RepositoryRecord::new(idx, owner, name))
        .take(max_count.unwrap_or(usize::MAX));
    Ok(iter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_url() {
        assert_eq!(
            parse_repo_url("https://github.com/torvalds/linux"),
            Some(("torvalds".to_string(), "linux".to_string()))
        );
    }

    #[test]
    fn test_parse_strips_git_suffix_and_slash() {
        assert_eq!(
            parse_repo_url("https://github.com/owner/name.git/\n"),
            Some(("owner".to_string(), "name".to_string()))
        );
        assert_eq!(
            parse_repo_url("https://github.com/owner/name/"),
            Some(("owner".to_string(), "name".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_single_segment() {
        assert_eq!(parse_repo_url("linux"), None);
        assert_eq!(parse_repo_url("https://github.com"), None);
        assert_eq!(parse_repo_url(""), None);
    }

    #[test]
    fn test_iter_repos_indexes_and_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let list = dir.path().join("repos.txt");
        std::fs::write(
            &list,
            "https://github.com/a/one.git\n\nnot-a-url\nhttps://github.com/b/two/\nhttps://github.com/c/three\n",
        )
        .expect("write list");

        let all: Vec<_> = iter_repos(&list, None).expect("open").collect();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].full_name(), "a/one");
        assert_eq!(all[1].idx, 1);
        assert_eq!(all[1].full_name(), "b/two");
        assert_eq!(all[2].idx, 2);

        let limited: Vec<_> = iter_repos(&list, Some(2)).expect("open").collect();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_iter_repos_missing_file() {
        assert!(iter_repos(Path::new("/nonexistent/repos.txt"), None).is_err());
    }
}
