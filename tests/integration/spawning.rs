//! Cross-runtime spawn and bridge-call scenarios.

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
fn bridge_calls_marshal_arguments_and_results() {
    let dir = TempDir::new().expect("tempdir");
    write_script(
        dir.path(),
        "child.weft",
        r#"
return {
    add = function(a, b) return a + b end,
    greet = function(name) return "hello " .. name end,
}
"#,
    );
    let main = write_script(
        dir.path(),
        "spawn.weft",
        r#"
local child = spawn("./child")
assert(child.add(2, 3) == 5)
assert(child.greet("weft") == "hello weft")
"#,
    );
    assert!(run(&main));
}

#[test]
fn bridge_tables_round_trip_structurally() {
    let dir = TempDir::new().expect("tempdir");
    write_script(
        dir.path(),
        "child.weft",
        r#"
return {
    pick = function(t) return t.inner.value end,
    make = function() return {a = 1, b = {c = true}} end,
}
"#,
    );
    let main = write_script(
        dir.path(),
        "spawn.weft",
        r#"
local child = spawn("./child")
assert(child.pick({inner = {value = 7}}) == 7)
local made = child.make()
assert(made.a == 1)
assert(made.b.c == true)
"#,
    );
    assert!(run(&main));
}

#[test]
fn spawning_a_failing_module_raises_in_the_parent() {
    let dir = TempDir::new().expect("tempdir");
    write_script(dir.path(), "child.weft", "error(\"child exploded\")");
    let main = write_script(dir.path(), "spawn.weft", "spawn(\"./child\")");
    assert!(!run(&main));
}

#[test]
fn spawning_a_module_that_returns_a_function_raises() {
    let dir = TempDir::new().expect("tempdir");
    write_script(dir.path(), "child.weft", "return function() end");
    let main = write_script(dir.path(), "spawn.weft", "spawn(\"./child\")");
    assert!(!run(&main));
}

#[test]
fn unmarshalable_arguments_raise_in_the_parent() {
    let dir = TempDir::new().expect("tempdir");
    write_script(
        dir.path(),
        "child.weft",
        "return {take = function(v) return true end}",
    );
    let main = write_script(
        dir.path(),
        "spawn.weft",
        "local child = spawn(\"./child\")\nchild.take({f = function() end})",
    );
    assert!(!run(&main));
}

#[test]
fn child_errors_propagate_to_the_calling_thread() {
    let dir = TempDir::new().expect("tempdir");
    write_script(
        dir.path(),
        "child.weft",
        "return {blow = function() error(\"inner fault\") end}",
    );
    let main = write_script(
        dir.path(),
        "spawn.weft",
        "local child = spawn(\"./child\")\nchild.blow()",
    );
    assert!(!run(&main));
}

#[test]
fn child_modules_may_require_their_own_dependencies() {
    let dir = TempDir::new().expect("tempdir");
    write_script(dir.path(), "math2.weft", "return {double = function(n) return n * 2 end}");
    write_script(
        dir.path(),
        "child.weft",
        r#"
local math2 = require("./math2")
return {quad = function(n) return math2.double(math2.double(n)) end}
"#,
    );
    let main = write_script(
        dir.path(),
        "spawn.weft",
        "local child = spawn(\"./child\")\nassert(child.quad(3) == 12)",
    );
    assert!(run(&main));
}

#[test]
fn sibling_spawns_are_isolated() {
    let dir = TempDir::new().expect("tempdir");
    write_script(
        dir.path(),
        "cell.weft",
        r#"
local state = {value = 0}
return {
    set = function(v) state.value = v return true end,
    get = function() return state.value end,
}
"#,
    );
    let main = write_script(
        dir.path(),
        "spawn.weft",
        r#"
local one = spawn("./cell")
local two = spawn("./cell")
one.set(5)
assert(one.get() == 5)
assert(two.get() == 0, "sibling runtimes must not share state")
"#,
    );
    assert!(run(&main));
}
