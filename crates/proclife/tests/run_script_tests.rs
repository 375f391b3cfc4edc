#![cfg(unix)]

use proclife::{ManagerConfig, ProcessManager, ProcessStatus};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_script_captures_output() {
    let _ = tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("print_lines.sh");
    std::fs::write(&script, "#!/bin/sh\nprintf 'line1\\nline2\\n'\nexit 0\n").unwrap();

    let manager = ProcessManager::new(ManagerConfig::with_capacity(2)).unwrap();
    manager.run_script(&script, "script").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), manager.wait_for_completion())
        .await
        .expect("script should finish");

    assert_eq!(
        manager.get_process_output("script").unwrap(),
        vec!["line1".to_string(), "line2".to_string()]
    );
    let snapshot = manager.get_process("script").unwrap();
    assert_eq!(snapshot.status(), ProcessStatus::Exited);
    assert_eq!(snapshot.exit_status, Some(0));
    assert!(!manager.has_process("script"));
}
