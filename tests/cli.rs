// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Drives the actual `thistle` binary, covering the exit-code contract
//! end-to-end.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn script(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp script");
    write!(file, "{contents}").expect("write temp script");
    file
}

#[test]
fn successful_script_exits_zero_and_prints_to_stdout() {
    let file = script("print 1 + 2 * 3;");
    Command::cargo_bin("thistle")
        .unwrap()
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("7"));
}

#[test]
fn compile_error_exits_65() {
    let file = script("let = ;");
    Command::cargo_bin("thistle")
        .unwrap()
        .arg(file.path())
        .assert()
        .code(65);
}

#[test]
fn runtime_error_exits_70_with_a_stack_trace_on_stderr() {
    let file = script("y;");
    Command::cargo_bin("thistle")
        .unwrap()
        .arg(file.path())
        .assert()
        .code(70)
        .stderr(predicate::str::contains("undefined variable"));
}

#[test]
fn missing_script_exits_66() {
    Command::cargo_bin("thistle")
        .unwrap()
        .arg("/no/such/script.th")
        .assert()
        .code(66);
}
