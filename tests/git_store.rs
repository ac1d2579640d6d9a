//! Integration tests for the git CLI artifact store.
//!
//! Each test clones a bare repository created in a tempdir, so no network is
//! needed. Tests return early when `git` is not installed.

use std::path::Path;
use std::process::Command;

use netbk::adapters::git::GitCliStore;
use netbk::config::{GitConfig, RepositoryConfig};
use netbk::core::{ArtifactStore, RepoOperation};
use tempfile::TempDir;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn bare_remote(dir: &TempDir, name: &str) -> String {
    let path = dir.path().join(name);
    let status = Command::new("git")
        .args(["init", "--bare", "--quiet"])
        .arg(&path)
        .status()
        .unwrap();
    assert!(status.success());
    path.to_string_lossy().into_owned()
}

fn repository(url: &str) -> RepositoryConfig {
    RepositoryConfig {
        id: 1,
        name: "configs".into(),
        url: url.into(),
        branch: None,
        username: None,
        token: None,
        path: None,
    }
}

fn remote_log(remote: &str) -> String {
    let output = Command::new("git")
        .args(["--git-dir", remote, "log", "--format=%s", "main"])
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").arg("-C").arg(dir).args(args).output().unwrap();
    assert!(output.status.success(), "git {args:?} failed");
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

#[tokio::test]
async fn clone_commit_push_and_reopen() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let remote = bare_remote(&dir, "remote.git");
    let store = GitCliStore::new(dir.path().join("work"), GitConfig::default());
    let repo = repository(&remote);

    let wc = store.open_or_clone(&repo).await.unwrap();
    assert_eq!(wc.operation, RepoOperation::Cloned);
    assert_eq!(wc.branch, "main");
    assert_eq!(wc.path, dir.path().join("work").join("configs"));

    write(&wc.path, "backups/r1.running-config", "hostname r1\n");
    write(&wc.path, "backups/r1.startup-config", "hostname r1\n");
    let files = vec![
        "backups/r1.running-config".to_string(),
        "backups/r1.startup-config".to_string(),
    ];

    let outcome = store
        .commit_and_push(&wc, "Backup config 20260101_000000", &files)
        .await
        .unwrap();
    assert_eq!(outcome.commit_hash.as_deref().map(str::len), Some(8));
    assert!(outcome.pushed, "push error: {:?}", outcome.push_error);
    assert_eq!(outcome.files_changed, 2);
    assert!(remote_log(&remote).contains("Backup config 20260101_000000"));

    // Second run on the same working copy
    let wc = store.open_or_clone(&repo).await.unwrap();
    assert_eq!(wc.operation, RepoOperation::Opened);
    store.pull(&wc).await.unwrap();

    let unchanged = store
        .commit_and_push(&wc, "Backup config 20260102_000000", &files)
        .await
        .unwrap();
    assert_eq!(unchanged.commit_hash, None);
    assert!(!unchanged.pushed);
}

#[tokio::test]
async fn changed_remote_url_triggers_reclone() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let first = bare_remote(&dir, "first.git");
    let second = bare_remote(&dir, "second.git");
    let store = GitCliStore::new(dir.path().join("work"), GitConfig::default());

    let wc = store.open_or_clone(&repository(&first)).await.unwrap();
    write(&wc.path, "stale.txt", "old");

    let wc = store.open_or_clone(&repository(&second)).await.unwrap();
    assert_eq!(wc.operation, RepoOperation::Recloned);
    assert!(!wc.path.join("stale.txt").exists());
}

#[tokio::test]
async fn refuses_non_git_directory() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let remote = bare_remote(&dir, "remote.git");
    write(&dir.path().join("work"), "configs/notes.txt", "keep me");

    let store = GitCliStore::new(dir.path().join("work"), GitConfig::default());
    let err = store.open_or_clone(&repository(&remote)).await.unwrap_err();
    assert!(err.to_string().contains("not a git working copy"));
    assert!(dir.path().join("work/configs/notes.txt").exists());
}

#[tokio::test]
async fn commit_takes_only_the_batch_files() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let remote = bare_remote(&dir, "remote.git");
    let store = GitCliStore::new(dir.path().join("work"), GitConfig::default());
    let wc = store.open_or_clone(&repository(&remote)).await.unwrap();

    // Someone else's file is already staged in the shared index
    write(&wc.path, "backups/other-job.cfg", "hostname other\n");
    git(&wc.path, &["add", "backups/other-job.cfg"]);

    write(&wc.path, "backups/mine.cfg", "hostname mine\n");
    let outcome = store
        .commit_and_push(&wc, "Backup config 20260101_000000", &["backups/mine.cfg".to_string()])
        .await
        .unwrap();

    assert_eq!(outcome.files_changed, 1);
    assert!(outcome.pushed, "push error: {:?}", outcome.push_error);

    let committed = git(&wc.path, &["ls-tree", "-r", "--name-only", "HEAD"]);
    assert_eq!(committed.lines().collect::<Vec<_>>(), vec!["backups/mine.cfg"]);

    let still_staged = git(&wc.path, &["diff", "--cached", "--name-only"]);
    assert_eq!(still_staged.trim(), "backups/other-job.cfg");
}
