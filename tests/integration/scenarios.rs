//! End-to-end driver scenarios: script files in, exit status out.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use weft::Runtime;

fn write_script(
    dir: &Path,
    name: &str,
    source: &str,
) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, source).expect("write script");
    path
}

fn run(path: &Path) -> bool {
    Runtime::new().run_file(path, &[])
}

#[test]
fn required_module_is_loaded_once_and_cached() {
    let dir = TempDir::new().expect("tempdir");
    write_script(dir.path(), "a.weft", "return {x = 1}");
    let main = write_script(
        dir.path(),
        "b.weft",
        r#"
local first = require("./a")
local second = require("./a")
assert(first == second, "cache must return the identical value")
assert(first.x == 1)
return nil
"#,
    );
    assert!(run(&main));
}

#[test]
fn top_level_yield_with_values_fails_the_driver() {
    let dir = TempDir::new().expect("tempdir");
    let main = write_script(dir.path(), "yield_top.weft", "coroutine.yield(1)");
    assert!(!run(&main));
}

#[test]
fn bare_top_level_yield_continues() {
    let dir = TempDir::new().expect("tempdir");
    let marker = dir.path().join("marker.txt").display().to_string();
    let main = write_script(
        dir.path(),
        "yield_bare.weft",
        &format!("coroutine.yield()\nfs.writeFile(\"{}\", \"done\")", marker),
    );
    assert!(run(&main));
    assert_eq!(
        fs::read_to_string(dir.path().join("marker.txt")).expect("marker"),
        "done"
    );
}

#[test]
fn requiring_a_module_that_returns_a_number_fails() {
    let dir = TempDir::new().expect("tempdir");
    write_script(dir.path(), "bad_mod.weft", "return 42");
    let main = write_script(dir.path(), "main.weft", "require(\"./bad_mod\")");
    assert!(!run(&main));
}

#[test]
fn requiring_a_module_that_returns_nothing_fails() {
    let dir = TempDir::new().expect("tempdir");
    write_script(dir.path(), "empty.weft", "local unused = 1");
    let main = write_script(dir.path(), "main.weft", "require(\"./empty\")");
    assert!(!run(&main));
}

#[test]
fn script_errors_fail_the_driver() {
    let dir = TempDir::new().expect("tempdir");
    let main = write_script(dir.path(), "broken.weft", "local t = nil\nreturn t.field");
    assert!(!run(&main));
}

#[test]
fn parse_errors_fail_the_driver() {
    let dir = TempDir::new().expect("tempdir");
    let main = write_script(dir.path(), "syntax.weft", "local = 1");
    assert!(!run(&main));
}

#[test]
fn missing_files_fail_the_driver() {
    let dir = TempDir::new().expect("tempdir");
    assert!(!run(&dir.path().join("absent.weft")));
}

#[test]
fn program_arguments_reach_the_script() {
    let dir = TempDir::new().expect("tempdir");
    let main = write_script(
        dir.path(),
        "args.weft",
        r#"
local first, second = ...
assert(first == "alpha")
assert(second == "beta")
"#,
    );
    let ok = Runtime::new().run_file(&main, &["alpha".to_string(), "beta".to_string()]);
    assert!(ok);
}

#[test]
fn several_files_share_one_runtime_and_cache() {
    let dir = TempDir::new().expect("tempdir");
    write_script(dir.path(), "mod.weft", "return {stamp = {}}");
    let first = write_script(
        dir.path(),
        "one.weft",
        "shared = require(\"./mod\")\nassert(shared.stamp)",
    );
    let second = write_script(
        dir.path(),
        "two.weft",
        "local again = require(\"./mod\")\nassert(again.stamp)",
    );
    let runtime = Runtime::new();
    assert!(runtime.run_file(&first, &[]));
    assert!(runtime.run_file(&second, &[]));
}

#[test]
fn async_file_reads_park_and_resume() {
    let dir = TempDir::new().expect("tempdir");
    let data = dir.path().join("payload.txt");
    fs::write(&data, "payload contents").expect("write data");
    let main = write_script(
        dir.path(),
        "reader.weft",
        &format!(
            r#"
local contents = fs.readFileAsync("{}")
assert(contents == "payload contents")
"#,
            data.display()
        ),
    );
    assert!(run(&main));
}

#[test]
fn async_read_failures_raise_in_the_script() {
    let dir = TempDir::new().expect("tempdir");
    let main = write_script(
        dir.path(),
        "reader.weft",
        "fs.readFileAsync(\"/definitely/not/here\")",
    );
    assert!(!run(&main));
}
