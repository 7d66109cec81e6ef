//! End-to-end tests for the `emu` supervisor binary
//!
//! Most runs use `-m -n 1`: hotness mode skips NUMA placement and a non-zero
//! rank never samples. The sampling tests at the end read the real `/proc`
//! and sysfs node files.

use predicates::prelude::*;

fn emu() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("emu")
}

#[test]
fn test_cli_help() {
    emu()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"))
        .stdout(predicate::str::contains("--local-size"));
}

#[test]
fn test_cli_version() {
    emu()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("emu"));
}

#[test]
fn test_cli_requires_command() {
    emu().assert().code(1).stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_invalid_size_is_usage_error() {
    emu()
        .args(["-l", "12Q", "true"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid size"));
}

#[test]
fn test_runs_target_to_completion() {
    emu()
        .args(["-m", "-n", "1", "-t", "0", "--", "echo", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"));
}

#[test]
fn test_sync_line_comes_first() {
    emu()
        .args(["--sync", "0.25", "-m", "-n", "1", "echo", "payload"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("emu: sync 0.25\n"));
}

#[test]
fn test_exec_failure_is_reported() {
    emu()
        .args(["-m", "-n", "1", "/nonexistent/not-a-program"])
        .assert()
        .stderr(predicate::str::contains("emu: exec target '/nonexistent/not-a-program'"));
}

#[test]
fn test_stopped_target_is_sampled_and_continued() {
    emu()
        .args(["-m", "-n", "1", "-t", "0", "sh", "-c", "kill -STOP $$; echo resumed"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(predicate::function(|out: &str| {
            let stop = out.find("emu: stop\n");
            let cont = out.find("emu: continue\n");
            let resumed = out.find("resumed\n");
            matches!((stop, cont, resumed), (Some(s), Some(c), Some(r)) if s < c && c < r)
        }));
}

#[test]
fn test_phase_markers_follow_matching_lines() {
    emu()
        .args([
            "-m",
            "-n",
            "1",
            "-S",
            "begin*",
            "-E",
            "finish?work",
            "sh",
            "-c",
            "echo before; echo begin work; echo middle; echo finish work; echo after",
        ])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(predicate::function(|out: &str| {
            let lines: Vec<&str> = out.lines().collect();
            let pos = |p: &dyn Fn(&str) -> bool| lines.iter().position(|l| p(l));
            let begin = pos(&|l| l == "begin work");
            let start = pos(&|l| l.starts_with("emu: start "));
            let finish = pos(&|l| l == "finish work");
            let end = pos(&|l| l.starts_with("emu: end "));
            matches!(
                (begin, start, finish, end),
                (Some(b), Some(s), Some(f), Some(e)) if b < s && s < f && f < e
            ) && lines.contains(&"before")
                && lines.contains(&"after")
        }));
}

#[test]
fn test_start_marker_only_once() {
    emu()
        .args([
            "-m", "-n", "1", "-S", "go", "sh", "-c", "echo go; echo go; echo go",
        ])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(predicate::function(|out: &str| {
            out.matches("emu: start ").count() == 1 && out.matches("go\n").count() == 3
        }));
}

#[test]
fn test_unterminated_last_line_is_echoed() {
    emu()
        .args(["-m", "-n", "1", "-E", "never", "printf", "no newline"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(predicate::str::contains("no newline"));
}

#[test]
fn test_hotness_end_marker_from_exiting_target() {
    // The end marker is often handled after the target already exited
    for _ in 0..8 {
        emu()
            .args(["-m", "-t", "0", "-E", "done", "--", "sh", "-c", "echo done"])
            .timeout(std::time::Duration::from_secs(20))
            .assert()
            .success()
            .stdout(predicate::str::contains("memprof: rssKB"))
            .stdout(predicate::str::contains("emu: end "));
    }
}

#[test]
fn test_periodic_locality_samples() {
    emu()
        .args(["-t", "1", "--", "sh", "-c", "sleep 1.5"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(predicate::str::contains("emu: availGB "))
        .stdout(predicate::str::is_match(r"emu: local% \d+\.\d\d localGB \d+\.\d\d remoteGB \d+\.\d\d totalGB \d+\.\d\d time \d+\.\d\d").unwrap());
}
