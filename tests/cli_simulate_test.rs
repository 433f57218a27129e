use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_simulate_all_contenders_hold_in_turn() {
    let mut cmd = Command::cargo_bin("seqlock").unwrap();
    cmd.args(["simulate", "--contenders", "4", "--min-hold", "5ms", "--max-hold", "10ms"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0: contender"))
        .stdout(predicate::str::contains("3: contender"))
        .stdout(predicate::str::contains(
            "held: 4, timed out: 0, session lost: 0, queue entries left: 0",
        ));
}

#[test]
fn test_simulate_no_wait_times_out_with_exit_code_2() {
    let mut cmd = Command::cargo_bin("seqlock").unwrap();
    cmd.args([
        "simulate",
        "-n",
        "3",
        "--no-wait",
        "--min-hold",
        "300ms",
        "--max-hold",
        "300ms",
    ])
    .assert()
    .code(2)
    .stdout(predicate::str::contains("held: 1, timed out: 2"))
    .stdout(predicate::str::contains("queue entries left: 0"));
}

#[test]
fn test_simulate_expired_holder_passes_lock_on() {
    let mut cmd = Command::cargo_bin("seqlock").unwrap();
    cmd.args(["simulate", "-n", "3", "--expire-holder"])
        .assert()
        .success()
        .stdout(predicate::str::contains("lost its session while holding the lock"))
        .stdout(predicate::str::contains("held: 2, timed out: 0, session lost: 1"));
}

#[test]
fn test_simulate_quiet_prints_nothing() {
    let mut cmd = Command::cargo_bin("seqlock").unwrap();
    cmd.args(["-q", "simulate", "-n", "2"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_simulate_rejects_bad_duration() {
    let mut cmd = Command::cargo_bin("seqlock").unwrap();
    cmd.args(["simulate", "--min-hold", "10x"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid duration"));
}

#[test]
fn test_simulate_rejects_relative_root() {
    let mut cmd = Command::cargo_bin("seqlock").unwrap();
    cmd.args(["simulate", "--root", "lock"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("must be absolute"));
}

#[test]
fn test_timeout_conflicts_with_no_wait() {
    let mut cmd = Command::cargo_bin("seqlock").unwrap();
    cmd.args(["simulate", "--timeout", "1s", "--no-wait"])
        .assert()
        .failure();
}
