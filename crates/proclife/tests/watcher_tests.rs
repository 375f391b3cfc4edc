#![cfg(unix)]

use proclife::{PidWatcher, WatchState, WatcherConfig};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .try_init();
}

fn fast_config() -> WatcherConfig {
    WatcherConfig::builder()
        .monitor_interval_ms(20u64)
        .exit_poll_interval_ms(20u64)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_unknown_process_is_not_watched() {
    init_tracing();
    let watcher = PidWatcher::with_system_table(fast_config()).unwrap();

    assert!(!watcher.start("proclife-no-such-process").await);
    assert_eq!(watcher.state(), WatchState::Idle);
    assert_eq!(watcher.watch_task_count(), 0);
}

/// Watch a real process under a name no other process uses
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watch_real_process_until_exit() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let binary = dir.path().join("plwatch_target");
    std::fs::copy("/bin/sleep", &binary).unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut child = std::process::Command::new(&binary).arg("30").spawn().unwrap();
    let watcher = PidWatcher::with_system_table(fast_config()).unwrap();

    let ticks = Arc::new(AtomicUsize::new(0));
    let exits = Arc::new(AtomicUsize::new(0));
    {
        let ticks = ticks.clone();
        watcher.set_monitor_callback(move |_| {
            ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let exits = exits.clone();
        watcher.set_exit_callback(move |event| {
            assert_eq!(event.name, "plwatch_target");
            exits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    assert!(watcher.start("plwatch_target").await);
    assert_eq!(watcher.target().unwrap().pid, child.id());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ticks.load(Ordering::SeqCst) >= 1);

    child.kill().unwrap();
    child.wait().unwrap();

    let mut state = watcher.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WatchState::Idle),
    )
    .await
    .expect("watcher should notice the exit")
    .unwrap();

    assert_eq!(exits.load(Ordering::SeqCst), 1);
    assert_eq!(watcher.watch_task_count(), 0);
}
