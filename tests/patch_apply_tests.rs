use indoc::indoc;
use repatch::{
    apply_diff, apply_hunks_to_lines, apply_patch, apply_patches, check_modification,
    correct_headers, parse_patches, preview_patches, ApplyOptions, ApplyStatus, DirWorkspace,
    ParsedPatch, PatchError, PromptChoice, Strategy, Workspace,
};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::tempdir;

// --- Test Workspace ---

/// An in-memory workspace with knobs for the modification guard tests:
/// `bumped` paths report a newer mtime than the read snapshot, `stat_errors`
/// paths fail to re-stat, and every prompt is recorded.
struct MockWorkspace {
    files: Mutex<HashMap<PathBuf, String>>,
    bumped: Mutex<HashSet<PathBuf>>,
    stat_errors: Mutex<HashSet<PathBuf>>,
    prompt_answer: PromptChoice,
    prompts: Mutex<Vec<String>>,
}

impl MockWorkspace {
    fn new(prompt_answer: PromptChoice) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            bumped: Mutex::new(HashSet::new()),
            stat_errors: Mutex::new(HashSet::new()),
            prompt_answer,
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn with_file(self, path: &str, content: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(PathBuf::from(path), content.to_string());
        self
    }

    fn bump(&self, path: &str) {
        self.bumped.lock().unwrap().insert(PathBuf::from(path));
    }

    fn fail_stat(&self, path: &str) {
        self.stat_errors.lock().unwrap().insert(PathBuf::from(path));
    }

    fn content(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(Path::new(path)).cloned()
    }

    fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn base_time() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_000_000)
    }
}

impl Workspace for MockWorkspace {
    fn read(&self, path: &Path) -> Result<(String, SystemTime), PatchError> {
        match self.files.lock().unwrap().get(path) {
            Some(content) => Ok((content.clone(), Self::base_time())),
            None => Err(PatchError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            }),
        }
    }

    fn write(&self, path: &Path, content: &str) -> Result<(), PatchError> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), content.to_string());
        Ok(())
    }

    fn stat(&self, path: &Path) -> Result<SystemTime, PatchError> {
        if self.stat_errors.lock().unwrap().contains(path) {
            return Err(PatchError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "stat failed"),
            });
        }
        if self.bumped.lock().unwrap().contains(path) {
            Ok(Self::base_time() + Duration::from_secs(1))
        } else {
            Ok(Self::base_time())
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn prompt(&self, question: &str) -> PromptChoice {
        self.prompts.lock().unwrap().push(question.to_string());
        self.prompt_answer
    }
}

fn parse_one(diff: &str) -> ParsedPatch {
    let patches = parse_patches(diff).unwrap();
    let (mut corrected, _) = correct_headers(&patches);
    assert_eq!(corrected.len(), 1);
    corrected.remove(0)
}

fn write_options() -> ApplyOptions {
    ApplyOptions::builder().preview(false).build()
}

// --- Strategy Chain ---

#[test]
fn test_strict_apply_at_declared_offset() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f.txt"), "alpha\nbeta\ngamma\n").unwrap();
    let diff = indoc! {"
        --- a/f.txt
        +++ b/f.txt
        @@ -1,3 +1,3 @@
         alpha
        -beta
        +BETA
         gamma
    "};
    let workspace = DirWorkspace::new(dir.path());
    let results = apply_diff(diff, &workspace, &write_options()).unwrap();

    assert_eq!(results[0].status, ApplyStatus::Applied);
    assert_eq!(results[0].strategy, Some(Strategy::Strict));
    assert_eq!(
        fs::read_to_string(dir.path().join("f.txt")).unwrap(),
        "alpha\nBETA\ngamma\n"
    );
}

#[test]
fn test_shifted_apply_when_content_drifted() {
    let dir = tempdir().unwrap();
    // Two lines were prepended since the diff was generated.
    fs::write(
        dir.path().join("f.txt"),
        "new1\nnew2\nalpha\nbeta\ngamma\n",
    )
    .unwrap();
    let diff = indoc! {"
        --- a/f.txt
        +++ b/f.txt
        @@ -1,3 +1,3 @@
         alpha
        -beta
        +BETA
         gamma
    "};
    let workspace = DirWorkspace::new(dir.path());
    let results = apply_diff(diff, &workspace, &write_options()).unwrap();

    assert_eq!(results[0].status, ApplyStatus::Applied);
    assert_eq!(results[0].strategy, Some(Strategy::Shifted));
    assert_eq!(
        fs::read_to_string(dir.path().join("f.txt")).unwrap(),
        "new1\nnew2\nalpha\nBETA\ngamma\n"
    );
}

#[test]
fn test_fuzz_zero_fails_drifted_content() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("f.txt"),
        "new1\nnew2\nalpha\nbeta\ngamma\n",
    )
    .unwrap();
    let diff = indoc! {"
        --- a/f.txt
        +++ b/f.txt
        @@ -1,3 +1,3 @@
         alpha
        -beta
        +BETA
         gamma
    "};
    let workspace = DirWorkspace::new(dir.path());
    let options = ApplyOptions::builder().preview(false).fuzz(0).build();
    let results = apply_diff(diff, &workspace, &options).unwrap();

    assert_eq!(results[0].status, ApplyStatus::Failed);
    let reason = results[0].reason.as_deref().unwrap();
    assert!(reason.contains("hunk 1 failed"), "reason was: {reason}");
    // Nothing written.
    assert_eq!(
        fs::read_to_string(dir.path().join("f.txt")).unwrap(),
        "new1\nnew2\nalpha\nbeta\ngamma\n"
    );
}

#[test]
fn test_greedy_apply_preserves_file_whitespace() {
    let dir = tempdir().unwrap();
    // The file's indentation disagrees with the hunk's context lines.
    fs::write(
        dir.path().join("f.rs"),
        "fn main() {\n      let x = 1;\n    println!(\"x\");\n}\n",
    )
    .unwrap();
    let diff = indoc! {r#"
        --- a/f.rs
        +++ b/f.rs
        @@ -1,4 +1,4 @@
         fn main() {
         let x = 1;
        -    println!("x");
        +    println!("y");
         }
    "#};
    let workspace = DirWorkspace::new(dir.path());
    let results = apply_diff(diff, &workspace, &write_options()).unwrap();

    assert_eq!(results[0].status, ApplyStatus::Applied);
    assert_eq!(results[0].strategy, Some(Strategy::Greedy));
    // Context lines keep the file's own whitespace, not the hunk's.
    assert_eq!(
        fs::read_to_string(dir.path().join("f.rs")).unwrap(),
        "fn main() {\n      let x = 1;\n    println!(\"y\");\n}\n"
    );
}

#[test]
fn test_failure_lists_every_strategy_attempt() {
    let lines = ["alpha", "beta", "gamma"];
    let patch = parse_one(indoc! {"
        --- a/f.txt
        +++ b/f.txt
        @@ -1,2 +1,2 @@
         nothing
        -like this
        +at all
    "});
    let failure = apply_hunks_to_lines(&patch.hunks, &lines, 2).unwrap_err();
    assert_eq!(failure.hunk_index, 1);
    let tried: Vec<Strategy> = failure.attempts.iter().map(|a| a.strategy).collect();
    assert_eq!(
        tried,
        vec![Strategy::Strict, Strategy::Shifted, Strategy::Greedy]
    );
    assert!(!failure.whitespace_only);
}

#[test]
fn test_failure_flags_whitespace_only_drift() {
    let lines = ["fn main() {", "        let x = 1;", "}"];
    let patch = parse_one(indoc! {"
        --- a/f.rs
        +++ b/f.rs
        @@ -1,3 +1,3 @@
         fn main() {
        -  let x = 1;
        +  let x = 2;
         }
    "});
    // Greedy is off at fuzz 0, so the whitespace drift is unplaceable, but
    // the diagnostics should still recognize it for what it is.
    let failure = apply_hunks_to_lines(&patch.hunks, &lines, 0).unwrap_err();
    assert!(failure.whitespace_only);
    assert!(failure.to_string().contains("whitespace-only"));
}

#[test]
fn test_pure_insertion_goes_after_declared_line() {
    let lines = ["one", "two", "four"];
    let patch = parse_one(indoc! {"
        --- a/f.txt
        +++ b/f.txt
        @@ -2,0 +3 @@
        +three
    "});
    let patched = apply_hunks_to_lines(&patch.hunks, &lines, 2).unwrap();
    assert_eq!(patched.lines, vec!["one", "two", "three", "four"]);
}

#[test]
fn test_multi_hunk_offsets_accumulate() {
    let lines = ["a", "b", "c", "d", "e", "f"];
    let patch = parse_one(indoc! {"
        --- a/f.txt
        +++ b/f.txt
        @@ -1,2 +1,3 @@
         a
        +x
         b
        @@ -5,2 +6,2 @@
         e
        -f
        +F
    "});
    let patched = apply_hunks_to_lines(&patch.hunks, &lines, 2).unwrap();
    assert_eq!(patched.lines, vec!["a", "x", "b", "c", "d", "e", "F"]);
    assert_eq!(patched.strategy(), Strategy::Strict);
}

#[test]
fn test_hunks_apply_in_ascending_order_regardless_of_input_order() {
    let lines = ["a", "b", "c", "d", "e", "f"];
    // The later hunk is listed first.
    let patch = parse_one(indoc! {"
        --- a/f.txt
        +++ b/f.txt
        @@ -5,2 +5,2 @@
         e
        -f
        +F
        @@ -1,2 +1,3 @@
         a
        +x
         b
    "});
    let patched = apply_hunks_to_lines(&patch.hunks, &lines, 2).unwrap();
    assert_eq!(patched.lines, vec!["a", "x", "b", "c", "d", "e", "F"]);
}

#[test]
fn test_failed_hunk_reports_original_index() {
    let lines = ["a", "b", "c"];
    let patch = parse_one(indoc! {"
        --- a/f.txt
        +++ b/f.txt
        @@ -1,1 +1,1 @@
        -a
        +A
        @@ -3,1 +3,1 @@
        -zzz
        +yyy
    "});
    let failure = apply_hunks_to_lines(&patch.hunks, &lines, 2).unwrap_err();
    assert_eq!(failure.hunk_index, 2);
}

#[test]
fn test_strategy_ordering_is_by_tolerance() {
    assert!(Strategy::Strict < Strategy::Shifted);
    assert!(Strategy::Shifted < Strategy::Greedy);
}

// --- Orchestrator ---

#[test]
fn test_failed_file_is_left_untouched() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f.txt"), "a\nb\nc\n").unwrap();
    let diff = indoc! {"
        --- a/f.txt
        +++ b/f.txt
        @@ -1,1 +1,1 @@
        -a
        +A
        @@ -3,1 +3,1 @@
        -zzz
        +yyy
    "};
    let workspace = DirWorkspace::new(dir.path());
    let results = apply_diff(diff, &workspace, &write_options()).unwrap();

    assert_eq!(results[0].status, ApplyStatus::Failed);
    // The first hunk applied in memory, but nothing reached the disk.
    assert_eq!(
        fs::read_to_string(dir.path().join("f.txt")).unwrap(),
        "a\nb\nc\n"
    );
}

#[test]
fn test_one_file_failing_does_not_stop_the_rest() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("good.txt"), "old\n").unwrap();
    let diff = indoc! {"
        --- a/missing.txt
        +++ b/missing.txt
        @@ -1 +1 @@
        -x
        +y
        --- a/good.txt
        +++ b/good.txt
        @@ -1 +1 @@
        -old
        +new
    "};
    let workspace = DirWorkspace::new(dir.path());
    let results = apply_diff(diff, &workspace, &write_options()).unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, ApplyStatus::Failed);
    assert_eq!(results[0].reason.as_deref(), Some("file not found"));
    assert_eq!(results[1].status, ApplyStatus::Applied);
    assert_eq!(
        fs::read_to_string(dir.path().join("good.txt")).unwrap(),
        "new\n"
    );
}

#[test]
fn test_missing_file_fails_without_creating_it() {
    let dir = tempdir().unwrap();
    let diff = indoc! {"
        --- a/nope.txt
        +++ b/nope.txt
        @@ -1 +1 @@
        -x
        +y
    "};
    let workspace = DirWorkspace::new(dir.path());
    let results = apply_diff(diff, &workspace, &write_options()).unwrap();
    assert_eq!(results[0].status, ApplyStatus::Failed);
    assert_eq!(results[0].reason.as_deref(), Some("file not found"));
    assert!(!dir.path().join("nope.txt").exists());
}

#[test]
fn test_dev_null_creates_file_and_parents() {
    let dir = tempdir().unwrap();
    let diff = indoc! {"
        --- /dev/null
        +++ b/sub/new.txt
        @@ -0,0 +1,2 @@
        +hello
        +world
    "};
    let workspace = DirWorkspace::new(dir.path());
    let results = apply_diff(diff, &workspace, &write_options()).unwrap();
    assert_eq!(results[0].status, ApplyStatus::Applied);
    assert_eq!(
        fs::read_to_string(dir.path().join("sub/new.txt")).unwrap(),
        "hello\nworld\n"
    );
}

#[test]
fn test_preview_reports_diff_and_writes_nothing() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f.txt"), "old\n").unwrap();
    let diff = indoc! {"
        --- a/f.txt
        +++ b/f.txt
        @@ -1 +1 @@
        -old
        +new
    "};
    let workspace = DirWorkspace::new(dir.path());
    let results = apply_diff(diff, &workspace, &ApplyOptions::default()).unwrap();

    assert_eq!(results[0].status, ApplyStatus::Applied);
    let rendered = results[0].diff.as_deref().unwrap();
    assert!(rendered.contains("-old"));
    assert!(rendered.contains("+new"));
    assert_eq!(
        fs::read_to_string(dir.path().join("f.txt")).unwrap(),
        "old\n"
    );
}

#[test]
fn test_preview_patches_reports_stats() {
    let workspace = MockWorkspace::new(PromptChoice::No).with_file("present.txt", "a\nb\n");
    let diff = indoc! {"
        --- a/present.txt
        +++ b/present.txt
        @@ -1,2 +1,2 @@
         a
        -b
        +B
        --- a/absent.txt
        +++ b/absent.txt
        @@ -1 +1,2 @@
         x
        +y
    "};
    let patches = parse_patches(diff).unwrap();
    let infos = preview_patches(&patches, &workspace);

    assert_eq!(infos.len(), 2);
    assert!(infos[0].exists);
    assert_eq!(infos[0].hunks, 1);
    assert_eq!((infos[0].changes.additions, infos[0].changes.deletions), (1, 1));
    assert!(!infos[1].exists);
    assert_eq!((infos[1].changes.additions, infos[1].changes.deletions), (1, 0));
}

#[test]
fn test_file_without_trailing_newline_keeps_its_eof() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f.txt"), "alpha\nbeta\ngamma").unwrap();
    // No `\ No newline` marker in the diff; the file's EOF state still wins.
    let diff = indoc! {"
        --- a/f.txt
        +++ b/f.txt
        @@ -1,3 +1,3 @@
         alpha
        -beta
        +BETA
         gamma
    "};
    let workspace = DirWorkspace::new(dir.path());
    let results = apply_diff(diff, &workspace, &write_options()).unwrap();
    assert_eq!(results[0].status, ApplyStatus::Applied);
    assert_eq!(
        fs::read_to_string(dir.path().join("f.txt")).unwrap(),
        "alpha\nBETA\ngamma"
    );
}

#[test]
fn test_no_newline_marker_strips_trailing_newline() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f.txt"), "alpha\nomega\n").unwrap();
    let diff =
        "--- a/f.txt\n+++ b/f.txt\n@@ -1,2 +1,2 @@\n alpha\n-omega\n+OMEGA\n\\ No newline at end of file\n";
    let workspace = DirWorkspace::new(dir.path());
    let results = apply_diff(diff, &workspace, &write_options()).unwrap();
    assert_eq!(results[0].status, ApplyStatus::Applied);
    assert_eq!(
        fs::read_to_string(dir.path().join("f.txt")).unwrap(),
        "alpha\nOMEGA"
    );
}

#[test]
fn test_crlf_files_stay_crlf() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f.txt"), "alpha\r\nbeta\r\n").unwrap();
    let diff = indoc! {"
        --- a/f.txt
        +++ b/f.txt
        @@ -1,2 +1,2 @@
         alpha
        -beta
        +BETA
    "};
    let workspace = DirWorkspace::new(dir.path());
    let results = apply_diff(diff, &workspace, &write_options()).unwrap();
    assert_eq!(results[0].status, ApplyStatus::Applied);
    assert_eq!(
        fs::read_to_string(dir.path().join("f.txt")).unwrap(),
        "alpha\r\nBETA\r\n"
    );
}

#[test]
fn test_path_traversal_is_refused() {
    let dir = tempdir().unwrap();
    let inner = dir.path().join("inner");
    fs::create_dir(&inner).unwrap();
    let diff = indoc! {"
        --- /dev/null
        +++ b/../escape.txt
        @@ -0,0 +1 @@
        +gotcha
    "};
    let workspace = DirWorkspace::new(&inner);
    let results = apply_diff(diff, &workspace, &write_options()).unwrap();
    assert_eq!(results[0].status, ApplyStatus::Failed);
    assert!(results[0]
        .reason
        .as_deref()
        .unwrap()
        .contains("outside the target directory"));
    assert!(!dir.path().join("escape.txt").exists());
}

// --- Modification Guard ---

fn guarded_patch() -> ParsedPatch {
    parse_one(indoc! {"
        --- a/state.txt
        +++ b/state.txt
        @@ -1 +1 @@
        -old
        +new
    "})
}

#[test]
fn test_guard_refuses_modified_file_without_prompting() {
    let workspace = MockWorkspace::new(PromptChoice::Yes).with_file("state.txt", "old\n");
    workspace.bump("state.txt");
    let options = ApplyOptions::builder()
        .preview(false)
        .mtime_prompt(false)
        .build();
    let result = apply_patch(&guarded_patch(), &workspace, &options);

    assert_eq!(result.status, ApplyStatus::Failed);
    assert_eq!(result.reason.as_deref(), Some("file modified externally"));
    assert_eq!(workspace.content("state.txt").unwrap(), "old\n");
    assert_eq!(workspace.prompt_count(), 0);
}

#[test]
fn test_guard_prompts_and_proceeds_on_yes() {
    let workspace = MockWorkspace::new(PromptChoice::Yes).with_file("state.txt", "old\n");
    workspace.bump("state.txt");
    let result = apply_patch(&guarded_patch(), &workspace, &write_options());

    assert_eq!(result.status, ApplyStatus::Applied);
    assert_eq!(workspace.content("state.txt").unwrap(), "new\n");
    assert_eq!(workspace.prompt_count(), 1);
}

#[test]
fn test_guard_prompts_and_refuses_on_no() {
    let workspace = MockWorkspace::new(PromptChoice::No).with_file("state.txt", "old\n");
    workspace.bump("state.txt");
    let result = apply_patch(&guarded_patch(), &workspace, &write_options());

    assert_eq!(result.status, ApplyStatus::Failed);
    assert_eq!(result.reason.as_deref(), Some("file modified externally"));
    assert_eq!(workspace.content("state.txt").unwrap(), "old\n");
    assert_eq!(workspace.prompt_count(), 1);
}

#[test]
fn test_guard_can_be_disabled() {
    let workspace = MockWorkspace::new(PromptChoice::No).with_file("state.txt", "old\n");
    workspace.bump("state.txt");
    let options = ApplyOptions::builder()
        .preview(false)
        .mtime_check(false)
        .build();
    let result = apply_patch(&guarded_patch(), &workspace, &options);

    assert_eq!(result.status, ApplyStatus::Applied);
    assert_eq!(workspace.content("state.txt").unwrap(), "new\n");
    assert_eq!(workspace.prompt_count(), 0);
}

#[test]
fn test_guard_treats_stat_errors_as_advisory() {
    let workspace = MockWorkspace::new(PromptChoice::No).with_file("state.txt", "old\n");
    workspace.fail_stat("state.txt");
    let result = apply_patch(&guarded_patch(), &workspace, &write_options());

    // A failing re-stat warns and proceeds rather than blocking the apply.
    assert_eq!(result.status, ApplyStatus::Applied);
    assert_eq!(workspace.content("state.txt").unwrap(), "new\n");
    assert_eq!(workspace.prompt_count(), 0);
}

#[test]
fn test_guard_flags_file_that_appeared_since_read() {
    let workspace = MockWorkspace::new(PromptChoice::No).with_file("state.txt", "surprise\n");
    let options = write_options();
    let decision = check_modification(&workspace, Path::new("state.txt"), None, &options);
    assert!(decision.modified);
    assert!(!decision.proceed);
    assert_eq!(workspace.prompt_count(), 1);
}

#[test]
fn test_unmodified_file_never_prompts() {
    let workspace = MockWorkspace::new(PromptChoice::No).with_file("state.txt", "old\n");
    let result = apply_patch(&guarded_patch(), &workspace, &write_options());

    assert_eq!(result.status, ApplyStatus::Applied);
    assert_eq!(workspace.content("state.txt").unwrap(), "new\n");
    assert_eq!(workspace.prompt_count(), 0);
}

#[test]
fn test_results_keep_input_order() {
    let workspace = MockWorkspace::new(PromptChoice::No)
        .with_file("one.txt", "a\n")
        .with_file("two.txt", "b\n")
        .with_file("three.txt", "c\n");
    let diff = indoc! {"
        --- a/one.txt
        +++ b/one.txt
        @@ -1 +1 @@
        -a
        +A
        --- a/two.txt
        +++ b/two.txt
        @@ -1 +1 @@
        -b
        +B
        --- a/three.txt
        +++ b/three.txt
        @@ -1 +1 @@
        -c
        +C
    "};
    let patches = parse_patches(diff).unwrap();
    let (patches, _) = correct_headers(&patches);
    let results = apply_patches(&patches, &workspace, &write_options());

    let order: Vec<_> = results.iter().map(|r| r.file.to_str().unwrap()).collect();
    assert_eq!(order, vec!["one.txt", "two.txt", "three.txt"]);
    assert!(results.iter().all(|r| r.status == ApplyStatus::Applied));
}
