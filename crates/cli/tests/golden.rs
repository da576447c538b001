//! End-to-end golden scenarios: real source, run through the `lumen` binary
//! with `-e`, checked against exact stdout. These exercise the full
//! preprocess -> compile -> interpret pipeline, including the `print`
//! built-in's real stdout write, which is why they run as a subprocess
//! rather than in-process.

use assert_cmd::Command;

fn lumen() -> Command {
    Command::cargo_bin("lumen").expect("lumen binary should build")
}

#[test]
fn addition_of_two_locals() {
    lumen()
        .args(["-e", "let x = 10\nlet y = 20\nprint(x + y)"])
        .assert()
        .success()
        .stdout("30\n");
}

#[test]
fn recursive_factorial() {
    lumen()
        .args(["-e", "fn fact(n)\n  if n <= 1 then return 1 end\n  return n * fact(n - 1)\nend\nprint(fact(10))"])
        .assert()
        .success()
        .stdout("3628800\n");
}

#[test]
fn for_count_fast_path_sums_a_million() {
    lumen()
        .args(["-e", "let s = 0\nfor i in 1..1000001 do s = s + i end\nprint(s)"])
        .assert()
        .success()
        .stdout("500000500000\n");
}

#[test]
fn for_count_fast_path_with_jit_matches_interpreted_output() {
    lumen()
        .args(["-j", "-e", "let s = 0\nfor i in 1..1000001 do s = s + i end\nprint(s)"])
        .assert()
        .success()
        .stdout("500000500000\n");
}

#[test]
fn array_len() {
    lumen()
        .args(["-e", "let a = [3, 1, 4, 1, 5, 9, 2, 6]\nprint(len(a))"])
        .assert()
        .success()
        .stdout("8\n");
}

#[test]
fn fused_comparison_and_jump_inside_while() {
    lumen()
        .args(["-e", "let k = 0\nwhile k < 5 do if k == 3 then print(\"hit\") end\n k = k + 1 end"])
        .assert()
        .success()
        .stdout("hit\n");
}

#[test]
fn match_selects_matching_case() {
    lumen()
        .args(["-e", "match 2\n case 1 then print(\"one\")\n case 2 then print(\"two\")\n else print(\"other\")\nend"])
        .assert()
        .success()
        .stdout("two\n");
}
