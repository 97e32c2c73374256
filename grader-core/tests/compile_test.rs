use std::fs;

use grader_core::{
    compiler::{Language, Toolchains},
    run::{sandbox::Sandbox, CancelFlag, IsolationPolicy, ResourceLimits},
    utils::find_program,
};
use tempfile::TempDir;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn submission(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
        fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

fn sandbox(dir: &TempDir) -> Sandbox {
    Sandbox::new(dir.path(), IsolationPolicy::Off, CancelFlag::new())
}

const ADDER_C: &str = r#"
#include <stdio.h>
#include <stdlib.h>
#include "adder.h"

int main(int argc, char **argv) {
    if (argc != 3) {
        printf("Wrong number of arguments!\n");
        return 1;
    }
    printf("%d\n", add(atoi(argv[1]), atoi(argv[2])));
    return 0;
}
"#;

#[test]
fn test_compile_c_omits_headers() {
    init();
    if find_program("gcc").is_none() {
        log::warn!("gcc not found, skipping");
        return;
    }
    let dir = submission(&[
        ("main.c", ADDER_C),
        ("adder.h", "int add(int a, int b);\n"),
        ("adder.c", "int add(int a, int b) { return a + b; }\n"),
    ]);
    let sandbox = sandbox(&dir);
    let build = Toolchains::default()
        .build(&sandbox, Language::C, None, &ResourceLimits::for_build(60))
        .unwrap();
    assert!(build.succeeded, "{}", build.build_log);
    let executor = build.executor.unwrap();
    let result = executor
        .execute(
            &sandbox,
            b"",
            &["3".to_string(), "4".to_string()],
            &ResourceLimits::default(),
        )
        .unwrap();
    assert_eq!(result.stdout, b"7\n");
}

#[test]
fn test_compile_c_error_is_not_a_crash() {
    init();
    if find_program("gcc").is_none() {
        log::warn!("gcc not found, skipping");
        return;
    }
    let dir = submission(&[("main.c", "int main() { return 0 }\n")]);
    let build = Toolchains::default()
        .build(
            &sandbox(&dir),
            Language::C,
            None,
            &ResourceLimits::for_build(60),
        )
        .unwrap();
    assert!(!build.succeeded);
    assert!(build.executor.is_none());
    assert!(build.build_log.contains("main.c"));
}

#[test]
fn test_makefile_takes_precedence() {
    init();
    if find_program("make").is_none() {
        log::warn!("make not found, skipping");
        return;
    }
    let dir = submission(&[
        (
            "Makefile",
            "all:\n\tprintf '#!/bin/sh\\necho built-by-make\\n' > prog\n\tchmod +x prog\n",
        ),
        ("ignored.c", "this is not C"),
    ]);
    let sandbox = sandbox(&dir);
    let build = Toolchains::default()
        .build(
            &sandbox,
            Language::C,
            Some("prog"),
            &ResourceLimits::for_build(60),
        )
        .unwrap();
    assert!(build.succeeded, "{}", build.build_log);
    let result = build
        .executor
        .unwrap()
        .execute(&sandbox, b"", &[], &ResourceLimits::default())
        .unwrap();
    assert_eq!(result.stdout, b"built-by-make\n");
}

#[test]
fn test_missing_artifact_fails_build() {
    init();
    if find_program("make").is_none() {
        log::warn!("make not found, skipping");
        return;
    }
    let dir = submission(&[("Makefile", "all:\n\ttrue\n")]);
    let build = Toolchains::default()
        .build(
            &sandbox(&dir),
            Language::C,
            None,
            &ResourceLimits::for_build(60),
        )
        .unwrap();
    assert!(!build.succeeded);
    assert!(build.build_log.contains("Build produced no `main`"));
}

#[test]
fn test_build_timeout_is_build_failure() {
    init();
    let toolchains = Toolchains::from_yaml(
        r#"
languages:
  shell:
    compile: ["sh", "-c", "sleep 30"]
    run: ["sh", "{artifact}"]
    extensions: ["sh"]
    artifact: "main.sh"
    entry: "main.sh"
"#,
    )
    .unwrap();
    let dir = submission(&[("main.sh", "echo hi\n")]);
    let build = toolchains
        .build(
            &sandbox(&dir),
            Language::Shell,
            None,
            &ResourceLimits::for_build(1),
        )
        .unwrap();
    assert!(!build.succeeded);
    assert!(build.build_log.contains("Build timed out after 1 seconds."));
}

#[test]
fn test_no_sources_is_build_failure() {
    init();
    let dir = submission(&[("README.txt", "nothing to see")]);
    let build = Toolchains::default()
        .build(
            &sandbox(&dir),
            Language::Shell,
            None,
            &ResourceLimits::for_build(60),
        )
        .unwrap();
    assert!(!build.succeeded);
    assert_eq!(build.build_log, "No source files with extension .sh found.");
}

#[test]
fn test_shell_is_available() {
    assert!(Toolchains::default()
        .available_languages()
        .contains(&Language::Shell));
}
