use std::path::Path;

use git2::Repository;

/// Current HEAD branch name and commit SHA.
pub struct HeadInfo {
    pub branch: Option<String>,
    pub sha: String,
}

/// Retrieve the current HEAD's branch name and commit SHA.
/// Returns None if `root` is not inside a git repository.
pub fn current_head_info(root: &Path) -> Option<HeadInfo> {
    let repo = Repository::discover(root).ok()?;
    let head = repo.head().ok()?;
    let branch = if head.is_branch() {
        head.shorthand().map(String::from)
    } else {
        None
    };
    let sha = head.peel_to_commit().ok()?.id().to_string();
    Some(HeadInfo { branch, sha })
}

/// Best-effort capture of the current commit SHA for `base_commit`.
pub fn current_sha(root: &Path) -> Option<String> {
    current_head_info(root).map(|info| info.sha)
}

/// Best-effort capture of the current branch name for presence records.
pub fn current_branch(root: &Path) -> Option<String> {
    current_head_info(root).and_then(|info| info.branch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn non_repo_yields_none() {
        let dir = tempdir().unwrap();
        assert!(current_head_info(dir.path()).is_none());
        assert!(current_sha(dir.path()).is_none());
        assert!(current_branch(dir.path()).is_none());
    }

    #[test]
    fn fresh_repo_with_commit_yields_head() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "test").unwrap();
            config.set_str("user.email", "test@example.com").unwrap();
        }
        let sig = repo.signature().unwrap();
        let tree_id = {
            let mut index = repo.index().unwrap();
            index.write_tree().unwrap()
        };
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();

        let info = current_head_info(dir.path()).unwrap();
        assert_eq!(info.sha.len(), 40);
        assert!(info.branch.is_some());
    }
}
