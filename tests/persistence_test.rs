#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use std::io::Write;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_rocksdb_persistence_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. First run: publish, book and settle a lesson
    let mut csv1 = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv1, "op,lesson,actor,amount,card,extra").unwrap();
    writeln!(csv1, "publish,1,10,200,,60").unwrap();
    writeln!(csv1, "checkout,1,20,,4111111111111111,").unwrap();
    writeln!(csv1, "callback,1,,,,").unwrap();

    let mut cmd1 = Command::new(cargo_bin!("tutorpay"));
    cmd1.arg(csv1.path()).arg("--db-path").arg(&db_path);

    let output1 = cmd1.output().expect("Failed to execute command");
    assert!(output1.status.success());
    let stdout1 = String::from_utf8_lossy(&output1.stdout);
    assert!(stdout1.contains("10,180.00,1"));

    // 2. Second run: withdraw against the recovered wallet
    let mut csv2 = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv2, "op,lesson,actor,amount,card,extra").unwrap();
    writeln!(csv2, "withdraw,,10,30,,").unwrap();
    writeln!(csv2, "reconcile,,,,,").unwrap();

    let mut cmd2 = Command::new(cargo_bin!("tutorpay"));
    cmd2.arg(csv2.path()).arg("--db-path").arg(&db_path);

    let output2 = cmd2.output().expect("Failed to execute command");
    assert!(output2.status.success());
    let stdout2 = String::from_utf8_lossy(&output2.stdout);
    let stderr2 = String::from_utf8_lossy(&output2.stderr);

    // 180 recovered, minus the 30 withdrawal; the reconcile finds nothing to repair
    assert!(stdout2.contains("10,150.00,2"), "{stdout2}");
    assert!(!stderr2.contains("Error processing line"), "{stderr2}");
}
