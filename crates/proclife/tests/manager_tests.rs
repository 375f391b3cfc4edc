#![cfg(unix)]

use proclife::{
    ManagerConfig, NativeSignal, ProcessError, ProcessManager, ProcessState, ProcessStatus,
    ProcessTable, SysinfoProcessTable,
};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_file(true)
        .with_thread_ids(false)
        .with_target(false)
        .with_line_number(true)
        .try_init();
}

fn manager(max_processes: usize) -> ProcessManager {
    init_tracing();
    ProcessManager::new(ManagerConfig::with_capacity(max_processes)).unwrap()
}

/// Capacity is enforced and freed again by termination
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capacity_scenario() {
    let manager = manager(2);

    manager.create_process("sleep 30", "a").await.unwrap();
    manager.create_process("sleep 30", "b").await.unwrap();
    assert!(manager.has_process("a"));
    assert!(manager.has_process("b"));

    let result = manager.create_process("sleep 30", "c").await;
    assert!(matches!(result, Err(ProcessError::CapacityExceeded { max: 2 })));
    assert!(!manager.has_process("c"));

    assert!(manager
        .terminate_process_by_name("a", NativeSignal::TERM)
        .await
        .unwrap());
    assert!(!manager.has_process("a"));
    assert_eq!(manager.get_process("a").unwrap().status(), ProcessStatus::Terminated);

    manager.create_process("sleep 30", "c").await.unwrap();
    assert!(manager.has_process("c"));
    assert_eq!(manager.process_count(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_identifier_leaves_registry_unchanged() {
    let manager = manager(4);
    manager.create_process("sleep 30", "dup").await.unwrap();
    let before = manager.get_running_processes();

    let result = manager.create_process("echo other", "dup").await;
    assert!(matches!(result, Err(ProcessError::DuplicateIdentifier(id)) if id == "dup"));

    assert_eq!(manager.get_running_processes(), before);
    assert_eq!(manager.process_count(), 1);
    assert_eq!(manager.get_process("dup").unwrap().command, "sleep 30");

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_terminate_then_wait_does_not_deadlock() {
    let manager = Arc::new(manager(8));
    let names: Vec<String> = (0..4).map(|i| format!("worker-{i}")).collect();
    for name in &names {
        manager.create_process("sleep 30", name).await.unwrap();
    }

    // Two terminators race on every name
    let mut handles = Vec::new();
    for name in names.iter().chain(names.iter()) {
        let manager = manager.clone();
        let name = name.clone();
        handles.push(tokio::spawn(async move {
            manager
                .terminate_process_by_name(&name, NativeSignal::TERM)
                .await
        }));
    }

    tokio::time::timeout(Duration::from_secs(10), manager.wait_for_completion())
        .await
        .expect("wait_for_completion should return once everything is reaped");

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(manager.process_count(), 0);
    assert!(!manager
        .terminate_process_by_name("worker-0", NativeSignal::TERM)
        .await
        .unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_output_grows_as_a_prefix() {
    let manager = manager(2);
    manager
        .create_process(
            "for i in 1 2 3 4 5 6 7 8; do echo line$i; sleep 0.02; done",
            "counter",
        )
        .await
        .unwrap();

    let mut previous: Vec<String> = Vec::new();
    while manager.has_process("counter") {
        let current = manager.get_process_output("counter").unwrap();
        assert!(current.len() >= previous.len());
        assert_eq!(&current[..previous.len()], previous.as_slice());
        previous = current;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let expected: Vec<String> = (1..=8).map(|i| format!("line{i}")).collect();
    let last = manager.get_process_output("counter").unwrap();
    assert_eq!(&last[..previous.len()], previous.as_slice());
    assert_eq!(last, expected);
}

#[tokio::test]
async fn test_natural_exit_records_status() {
    let manager = manager(2);
    manager
        .create_process("printf 'partial'; exit 3", "failing")
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), manager.wait_for_completion())
        .await
        .unwrap();

    let snapshot = manager.get_process("failing").unwrap();
    assert_eq!(snapshot.state, ProcessState::Exited);
    assert_eq!(snapshot.exit_status, Some(3));
    assert_eq!(manager.get_process_output("failing").unwrap(), vec!["partial"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_tracked_pid() {
    let manager = manager(2);
    let native_id = manager.create_process("sleep 30", "target").await.unwrap();
    manager.create_process("sleep 30", "bystander").await.unwrap();

    assert!(manager
        .terminate_process(native_id.pid(), NativeSignal::TERM)
        .await
        .unwrap());

    let snapshot = manager.get_process("target").unwrap();
    assert_eq!(snapshot.state, ProcessState::Terminated);
    assert_eq!(snapshot.exit_status, None);

    let running: Vec<_> = manager
        .get_running_processes()
        .into_iter()
        .map(|s| s.identifier)
        .collect();
    assert_eq!(running, vec!["bystander"]);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_untracked_pid() {
    let manager = manager(1);
    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();

    // An unreaped child shows up as a zombie, which counts as gone
    assert!(manager
        .terminate_process(child.id(), NativeSignal::TERM)
        .await
        .unwrap());
    let status = child.wait().unwrap();
    assert!(!status.success());
}

/// Reconciliation leaves a supervised process alone, even once it has left the table
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_monitor_keeps_late_output_and_exit_status() {
    let manager = manager(2);
    manager
        .create_process("(sleep 0.5; echo late) & echo early; exit 0", "x")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(manager.monitor_processes().await.is_empty());

    tokio::time::timeout(Duration::from_secs(5), manager.wait_for_completion())
        .await
        .unwrap();

    assert_eq!(manager.get_process_output("x").unwrap(), vec!["early", "late"]);
    let snapshot = manager.get_process("x").unwrap();
    assert_eq!(snapshot.state, ProcessState::Exited);
    assert_eq!(snapshot.exit_status, Some(0));
}

#[tokio::test]
async fn test_failed_respawn_keeps_previous_output() {
    let manager = manager(2);
    manager.create_process("echo kept", "a").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), manager.wait_for_completion())
        .await
        .unwrap();
    assert_eq!(manager.get_process_output("a").unwrap(), vec!["kept"]);

    let result = manager.run_script("/no/such/script.sh", "a").await;
    assert!(matches!(result, Err(ProcessError::SpawnFailure { .. })));

    assert_eq!(manager.get_process_output("a").unwrap(), vec!["kept"]);
    assert_eq!(manager.get_process("a").unwrap().status(), ProcessStatus::Exited);
    assert!(!manager.has_process("a"));
}

/// Only the requested pid is signalled, not the rest of its process group
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_untracked_group_leader_spares_members() {
    use std::io::{BufRead, BufReader};
    use std::os::unix::process::CommandExt;

    let manager = manager(1);
    let mut leader = std::process::Command::new("sh")
        .arg("-c")
        .arg("sleep 30 & echo $!; wait")
        .stdout(std::process::Stdio::piped())
        .process_group(0)
        .spawn()
        .unwrap();

    let mut line = String::new();
    BufReader::new(leader.stdout.take().unwrap())
        .read_line(&mut line)
        .unwrap();
    let member: u32 = line.trim().parse().unwrap();

    assert!(manager
        .terminate_process(leader.id(), NativeSignal::TERM)
        .await
        .unwrap());
    assert!(!leader.wait().unwrap().success());

    assert!(SysinfoProcessTable::new().is_alive(member));
    std::process::Command::new("kill")
        .arg("-9")
        .arg(member.to_string())
        .status()
        .unwrap();
}

#[tokio::test]
async fn test_invalid_signal_restores_running_state() {
    let manager = manager(1);
    manager.create_process("sleep 30", "stubborn").await.unwrap();

    let result = manager
        .terminate_process_by_name("stubborn", NativeSignal::from_raw(4242))
        .await;
    assert!(matches!(result, Err(ProcessError::InvalidSignal(4242))));
    assert_eq!(manager.get_process("stubborn").unwrap().state, ProcessState::Running);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_kills_everything() {
    let manager = manager(4);
    manager.create_process("sleep 30", "one").await.unwrap();
    manager.create_process("sleep 30", "two").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
        .await
        .expect("shutdown should finish promptly");

    assert_eq!(manager.process_count(), 0);
    assert!(manager.get_running_processes().is_empty());
    assert!(matches!(
        manager.create_process("sleep 1", "three").await,
        Err(ProcessError::ManagerShutDown)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drop_kills_live_processes() {
    let manager = manager(1);
    let pid = manager.create_process("sleep 30", "orphan").await.unwrap().pid();
    drop(manager);

    let table = SysinfoProcessTable::new();
    let gone = async {
        while table.is_alive(pid) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), gone)
        .await
        .expect("dropped manager should kill its processes");
}
