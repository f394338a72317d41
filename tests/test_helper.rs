#![cfg(target_os = "linux")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeHelper, free_port};
use tunnel_forward::config::Config;
use tunnel_forward::exec::find_program;
use tunnel_forward::forward::{ForwardBackend, HelperBackend};
use tunnel_forward::store::{RuleStore, TunnelRecord};
use tunnel_forward::ErrorKind;

fn setup(binary: &str) -> (tempfile::TempDir, Arc<RuleStore>, HelperBackend) {
    setup_with(binary, |_| {})
}

fn setup_with(binary: &str, tune: impl FnOnce(&mut Config)) -> (tempfile::TempDir, Arc<RuleStore>, HelperBackend) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RuleStore::open(dir.path()).unwrap());
    store.upsert_tunnel(&TunnelRecord::new("site-b", "127.0.0.1")).unwrap();

    let mut cfg = Config::default();
    cfg.helper.binary = binary.to_string();
    cfg.helper.startup_wait_ms = 2000;
    cfg.helper.poll_interval_ms = 50;
    tune(&mut cfg);
    let backend = HelperBackend::new(store.clone(), &cfg).unwrap();
    (dir, store, backend)
}

#[tokio::test]
async fn test_missing_helper_binary() {
    let (_dir, store, backend) = setup("definitely-not-installed-xyz");
    let err = backend.create_forward("site-b", free_port()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyMissing);
    assert!(err.to_string().contains("is not installed"));
    assert!(store.all_rules().unwrap().is_empty());

    store.add_port("site-b", free_port()).unwrap();
    let err = backend.start_all().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyMissing);
}

#[tokio::test]
async fn test_occupied_port_is_conflict() {
    let (_dir, store, backend) = setup("sh");
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let err = backend.create_forward("site-b", port).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.to_string().contains("already in use"));
    assert!(store.all_rules().unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_unknown_port() {
    let (_dir, _store, backend) = setup("definitely-not-installed-xyz");
    for _ in 0..2 {
        let err = backend.remove_forward("site-b", 4444).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

#[tokio::test]
async fn test_remove_idle_rule() {
    let (_dir, store, backend) = setup("definitely-not-installed-xyz");
    let port = free_port();
    store.add_port("site-b", port).unwrap();

    let forwards = backend.list_forwards().await.unwrap();
    assert_eq!(forwards.len(), 1);
    assert!(!forwards[0].active);

    backend.remove_forward("site-b", port).await.unwrap();
    assert!(store.all_rules().unwrap().is_empty());
}

#[tokio::test]
async fn test_nothing_to_reload_or_stop() {
    let (_dir, _store, backend) = setup("definitely-not-installed-xyz");
    assert!(backend.validate_and_reload().await.is_ok());
    assert_eq!(backend.start_all().await.unwrap(), "No port forwards configured");
    assert_eq!(backend.stop_all().await.unwrap(), "All helper forwards stopped");
}

/// A shell renamed through a symlink poses as a helper holding
/// `TCP-LISTEN:<port>` on its command line
#[tokio::test]
async fn test_stop_all_terminates_matching_processes() {
    let sh = find_program("sh").unwrap();
    let bin_dir = tempfile::tempdir().unwrap();
    let fake = bin_dir.path().join("fakehelper");
    std::os::unix::fs::symlink(&sh, &fake).unwrap();

    let (_dir, _store, backend) = setup(fake.to_str().unwrap());
    let mut child = std::process::Command::new(&fake)
        .args(["-c", "sleep 30; true", "TCP-LISTEN:47001,fork,reuseaddr"])
        .spawn()
        .unwrap();

    let mut found = Vec::new();
    for _ in 0..50 {
        found = backend.helper_pids(Some(47001));
        if !found.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(found, vec![child.id()]);
    assert!(backend.helper_pids(Some(47002)).is_empty());

    let msg = backend.stop_all().await.unwrap();
    assert!(msg.starts_with("All helper forwards stopped"));
    assert!(!child.wait().unwrap().success());
    assert!(backend.helper_pids(None).is_empty());
}

fn tunnel_bytes(dir: &tempfile::TempDir) -> Vec<u8> {
    std::fs::read(dir.path().join("tunnels").join("site-b.yaml")).unwrap()
}

macro_rules! fake_helper {
    ($name:expr) => {
        match FakeHelper::new($name) {
            Some(fake) => fake,
            None => {
                eprintln!("perl not installed, skipping");
                return;
            }
        }
    };
}

#[tokio::test]
async fn test_create_list_remove() {
    let fake = fake_helper!("fh-roundtrip");
    let (_dir, store, backend) = setup(&fake.binary());
    let port = free_port();

    let msg = backend.create_forward("site-b", port).await.unwrap();
    assert!(msg.contains(&format!("127.0.0.1:{}", port)));
    assert_eq!(store.require_tunnel("site-b").unwrap().forwarded_ports, vec![port]);
    assert_eq!(backend.helper_pids(Some(port)).len(), 1);

    let forwards = backend.list_forwards().await.unwrap();
    assert!(forwards[0].active);
    assert_eq!(forwards[0].detail.as_deref(), Some("Active (helper)"));

    let err = backend.create_forward("site-b", port).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.to_string().contains("is already forwarded by tunnel site-b"));

    backend.remove_forward("site-b", port).await.unwrap();
    assert!(store.all_rules().unwrap().is_empty());
    assert!(backend.helper_pids(Some(port)).is_empty());
    assert!(std::net::TcpListener::bind(("0.0.0.0", port)).is_ok());
}

#[tokio::test]
async fn test_helper_exiting_early_leaves_rules_untouched() {
    let fake = fake_helper!("fh-early-exit");
    fake.set_marker("fail-start");
    let (dir, store, backend) = setup(&fake.binary());
    let before = tunnel_bytes(&dir);

    let err = backend.create_forward("site-b", free_port()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyFailure);
    assert!(err.to_string().contains("exited early"), "{}", err);
    assert_eq!(tunnel_bytes(&dir), before);
    assert!(store.all_rules().unwrap().is_empty());
}

#[tokio::test]
async fn test_helper_never_listening_is_killed() {
    let fake = fake_helper!("fh-no-listen");
    fake.set_marker("no-listen");
    let (dir, store, backend) = setup_with(&fake.binary(), |cfg| cfg.helper.startup_wait_ms = 700);
    let before = tunnel_bytes(&dir);
    let port = free_port();

    let err = backend.create_forward("site-b", port).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyFailure);
    assert!(err.to_string().contains("did not start listening"), "{}", err);
    assert_eq!(tunnel_bytes(&dir), before);
    assert!(store.all_rules().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(backend.helper_pids(Some(port)).is_empty());
}

#[tokio::test]
async fn test_remove_keeps_rule_when_helper_ignores_sigterm() {
    let fake = fake_helper!("fh-stubborn");
    fake.set_marker("ignore-term");
    let (_dir, store, backend) = setup_with(&fake.binary(), |cfg| {
        cfg.helper.startup_wait_ms = 1000;
        cfg.helper.stop_retries = 2;
    });
    let port = free_port();
    backend.create_forward("site-b", port).await.unwrap();

    let err = backend.remove_forward("site-b", port).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(store.require_tunnel("site-b").unwrap().forwarded_ports, vec![port]);

    assert_eq!(backend.stop_all().await.unwrap(), "All helper forwards stopped (forced)");
    assert!(backend.helper_pids(None).is_empty());
    assert!(std::net::TcpListener::bind(("0.0.0.0", port)).is_ok());
}

#[tokio::test]
async fn test_remove_refuses_port_held_by_other_process() {
    let (_dir, store, backend) = setup("definitely-not-installed-xyz");
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    store.add_port("site-b", port).unwrap();

    let err = backend.remove_forward("site-b", port).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyFailure);
    assert!(err.to_string().contains("not by a forward helper"));
    assert_eq!(store.require_tunnel("site-b").unwrap().forwarded_ports, vec![port]);
}

#[tokio::test]
async fn test_start_all_skips_running_helpers() {
    let fake = fake_helper!("fh-start-all");
    let (_dir, store, backend) = setup(&fake.binary());
    let ports = [free_port(), free_port()];
    for port in ports {
        store.add_port("site-b", port).unwrap();
    }

    assert_eq!(backend.start_all().await.unwrap(), "Started 2 forward(s)");
    let pids = backend.helper_pids(None);
    assert_eq!(pids.len(), 2);
    assert_eq!(backend.start_all().await.unwrap(), "Started 2 forward(s)");
    let mut again = backend.helper_pids(None);
    again.sort_unstable();
    let mut pids = pids;
    pids.sort_unstable();
    assert_eq!(again, pids);

    assert_eq!(backend.stop_all().await.unwrap(), "All helper forwards stopped");
    for port in ports {
        assert!(std::net::TcpListener::bind(("0.0.0.0", port)).is_ok());
    }
}

#[tokio::test]
async fn test_real_helper_round_trip() {
    if find_program("socat").is_none() {
        eprintln!("socat not installed, skipping");
        return;
    }
    let (_dir, store, backend) = setup("socat");
    let port = free_port();

    backend.create_forward("site-b", port).await.unwrap();
    assert_eq!(store.all_rules().unwrap().len(), 1);
    let forwards = backend.list_forwards().await.unwrap();
    assert!(forwards[0].active);
    assert_eq!(forwards[0].detail.as_deref(), Some("Active (helper)"));

    backend.remove_forward("site-b", port).await.unwrap();
    assert!(store.all_rules().unwrap().is_empty());
    assert!(std::net::TcpListener::bind(("0.0.0.0", port)).is_ok());
}
