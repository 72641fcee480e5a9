//! CLI integration tests for Munge.
//!
//! These tests run the `munge` binary against small projects on disk.

use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get the munge binary command.
fn munge() -> Command {
    Command::cargo_bin("munge").unwrap()
}

/// Keeps library resolution inside the project directory.
const PREAMBLE: &str = r#"
repository = "repo"
"#;

const STYLESHEET: &str = r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
  <xsl:output method="text"/>
  <xsl:template match="page"><xsl:value-of select="title"/></xsl:template>
</xsl:stylesheet>"#;

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// A project with one xslt set and one template set.
fn project(fail_on_error: bool) -> TempDir {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    write(root, "src/one.xml", "<page><title>One</title></page>");
    write(root, "src/two.xml", "<page><title>Two</title></page>");
    write(root, "xsl/title.xsl", STYLESHEET);
    write(root, "tpl/summary.j2", "{{ source_name }}={{ doc.root.name }}/{{ label }};");

    let manifest = format!(
        r#"fail_on_error = {fail_on_error}
{PREAMBLE}
[[set]]
backend = "xslt"
source_dirs = [{{ dir = "src", include = ["*.xml"] }}]
templates = ["xsl/title.xsl"]
output_dir = "build/titles"

[[set]]
backend = "template"
source_dirs = [{{ dir = "src", include = ["*.xml"] }}]
templates = ["tpl/summary.j2"]
output_file = "build/summary.txt"
parameters = {{ label = "x" }}
"#
    );
    write(root, "Munge.toml", &manifest);
    tmp
}

// ============================================================================
// munge transform
// ============================================================================

#[test]
fn test_transform_runs_every_set() {
    let tmp = project(false);

    munge()
        .arg("transform")
        .current_dir(tmp.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("Finished 2 transformation sets"));

    let root = tmp.path();
    assert_eq!(
        fs::read_to_string(root.join("build/titles/one.xml")).unwrap(),
        "One"
    );
    assert_eq!(
        fs::read_to_string(root.join("build/titles/two.xml")).unwrap(),
        "Two"
    );
    assert_eq!(
        fs::read_to_string(root.join("build/summary.txt")).unwrap(),
        "one.xml=page/x;two.xml=page/x;"
    );
    assert!(root.join(".munge/fingerprint.json").exists());
}

#[test]
fn test_second_run_is_up_to_date() {
    let tmp = project(false);

    munge()
        .arg("transform")
        .current_dir(tmp.path())
        .assert()
        .success();

    munge()
        .arg("transform")
        .current_dir(tmp.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("up to date"));

    // Changing an input makes the project stale again.
    write(tmp.path(), "src/one.xml", "<page><title>Uno</title></page>");
    munge()
        .arg("transform")
        .current_dir(tmp.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("up to date").not());
    assert_eq!(
        fs::read_to_string(tmp.path().join("build/titles/one.xml")).unwrap(),
        "Uno"
    );
}

#[test]
fn test_changed_include_makes_run_stale() {
    let tmp = project(false);
    write(tmp.path(), "tpl/header.j2", "[");
    write(
        tmp.path(),
        "tpl/summary.j2",
        "{% include \"header.j2\" %}{{ source_name }};",
    );

    munge()
        .arg("transform")
        .current_dir(tmp.path())
        .assert()
        .success();
    assert_eq!(
        fs::read_to_string(tmp.path().join("build/summary.txt")).unwrap(),
        "[one.xml;[two.xml;"
    );

    munge()
        .arg("transform")
        .current_dir(tmp.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("up to date"));

    write(tmp.path(), "tpl/header.j2", "<");
    munge()
        .arg("transform")
        .current_dir(tmp.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("up to date").not());
    assert_eq!(
        fs::read_to_string(tmp.path().join("build/summary.txt")).unwrap(),
        "<one.xml;<two.xml;"
    );
}

#[test]
fn test_force_ignores_fingerprint() {
    let tmp = project(false);

    munge()
        .arg("transform")
        .current_dir(tmp.path())
        .assert()
        .success();

    munge()
        .args(["transform", "--force"])
        .current_dir(tmp.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("Finished 2 transformation sets"));
}

#[test]
fn test_errors_are_reported_but_not_fatal_by_default() {
    let tmp = project(false);
    write(tmp.path(), "src/broken.xml", "<page><title>");

    munge()
        .arg("transform")
        .current_dir(tmp.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("with 2 errors"));

    // The good files were still transformed.
    assert!(tmp.path().join("build/titles/one.xml").exists());
    assert!(!tmp.path().join(".munge/fingerprint.json").exists());
}

#[test]
fn test_fail_on_error_flag_exits_nonzero() {
    let tmp = project(false);
    write(tmp.path(), "src/broken.xml", "<page><title>");

    munge()
        .args(["transform", "--fail-on-error"])
        .current_dir(tmp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("There were 2 transformation errors"));
}

#[test]
fn test_fail_on_error_from_manifest() {
    let tmp = project(true);
    write(tmp.path(), "src/broken.xml", "<page><title>");

    munge()
        .arg("transform")
        .current_dir(tmp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("transformation errors"));
}

#[test]
fn test_transform_from_subdirectory_and_explicit_manifest() {
    let tmp = project(false);
    let nested = tmp.path().join("src");

    munge()
        .arg("transform")
        .current_dir(&nested)
        .assert()
        .success();
    assert!(tmp.path().join("build/titles/one.xml").exists());

    let other = TempDir::new().unwrap();
    munge()
        .args(["transform", "--force", "--manifest"])
        .arg(tmp.path().join("Munge.toml"))
        .current_dir(other.path())
        .assert()
        .success();
}

#[test]
fn test_missing_manifest_fails() {
    let tmp = TempDir::new().unwrap();

    munge()
        .args(["transform", "--manifest", "Munge.toml"])
        .current_dir(tmp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}

#[test]
fn test_invalid_manifest_fails() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "Munge.toml", "[[set]]\nbackend = \"velocity\"\n");

    munge()
        .arg("transform")
        .current_dir(tmp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("velocity"));
}

// ============================================================================
// munge outputs / clean
// ============================================================================

#[test]
fn test_outputs_lists_mapped_files() {
    let tmp = project(false);
    let expected = [
        Path::new("build").join("titles").join("one.xml"),
        Path::new("build").join("titles").join("two.xml"),
        Path::new("build").join("summary.txt"),
        Path::new("build").join("summary.txt"),
    ]
    .iter()
    .map(|p| format!("{}\n", p.display()))
    .collect::<String>();

    munge()
        .arg("outputs")
        .current_dir(tmp.path())
        .assert()
        .success()
        .stdout(predicate::str::diff(expected));
}

#[test]
fn test_clean_removes_outputs_and_fingerprint() {
    let tmp = project(false);

    munge()
        .arg("transform")
        .current_dir(tmp.path())
        .assert()
        .success();

    munge()
        .arg("clean")
        .current_dir(tmp.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("Removed 3 output files"));

    assert!(!tmp.path().join("build/titles/one.xml").exists());
    assert!(!tmp.path().join("build/summary.txt").exists());
    assert!(!tmp.path().join(".munge/fingerprint.json").exists());
}

#[test]
fn test_completions() {
    munge()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("munge"));
}
