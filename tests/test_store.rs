use tunnel_forward::store::{ForwardingMode, RuleStore, TunnelRecord};
use tunnel_forward::ErrorKind;

fn store() -> (tempfile::TempDir, RuleStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = RuleStore::open(dir.path()).unwrap();
    (dir, store)
}

#[test]
fn test_open_creates_layout() {
    let (dir, _store) = store();
    assert!(dir.path().join("tunnels").is_dir());
}

#[test]
fn test_add_and_remove_port() {
    let (_dir, store) = store();
    store.upsert_tunnel(&TunnelRecord::new("alpha", "10.0.0.2")).unwrap();

    let rule = store.add_port("alpha", 8080).unwrap();
    assert_eq!(rule.remote(), "10.0.0.2:8080");
    store.add_port("alpha", 443).unwrap();

    let record = store.require_tunnel("alpha").unwrap();
    assert_eq!(record.forwarded_ports, vec![443, 8080]);

    store.remove_port("alpha", 8080).unwrap();
    assert_eq!(store.require_tunnel("alpha").unwrap().forwarded_ports, vec![443]);
}

#[test]
fn test_port_claimed_by_one_tunnel() {
    let (_dir, store) = store();
    store.upsert_tunnel(&TunnelRecord::new("alpha", "10.0.0.2")).unwrap();
    store.upsert_tunnel(&TunnelRecord::new("beta", "10.0.0.3")).unwrap();

    store.add_port("alpha", 80).unwrap();
    let err = store.add_port("beta", 80).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(store.owner_of(80).unwrap().as_deref(), Some("alpha"));
    assert!(store.require_tunnel("beta").unwrap().forwarded_ports.is_empty());
}

#[test]
fn test_add_port_needs_remote_ip() {
    let (_dir, store) = store();
    store
        .upsert_tunnel(&TunnelRecord {
            name: "bare".into(),
            ..TunnelRecord::default()
        })
        .unwrap();

    let err = store.add_port("bare", 80).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_missing_tunnel_and_port() {
    let (_dir, store) = store();
    assert_eq!(store.add_port("ghost", 80).unwrap_err().kind(), ErrorKind::NotFound);

    store.upsert_tunnel(&TunnelRecord::new("alpha", "10.0.0.2")).unwrap();
    let err = store.remove_port("alpha", 80).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.to_string(), "Port 80 not found");
}

#[test]
fn test_snapshot_restore_is_byte_identical() {
    let (dir, store) = store();
    let path = dir.path().join("tunnels").join("alpha.yaml");
    // hand-written layout that a re-serialisation would not reproduce
    let original = "# edited by hand\nname: alpha\nremote_forward_ip: 10.0.0.2\nforwarded_ports: [22, 80]\n";
    std::fs::write(&path, original).unwrap();

    let snapshot = store.snapshot("alpha").unwrap();
    assert_eq!(snapshot.record.forwarded_ports, vec![22, 80]);

    store.add_port("alpha", 443).unwrap();
    assert_ne!(std::fs::read_to_string(&path).unwrap(), original);

    store.restore(&snapshot).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
}

#[test]
fn test_all_rules_skip_tunnels_without_ip() {
    let (_dir, store) = store();
    store.upsert_tunnel(&TunnelRecord::new("alpha", "10.0.0.2")).unwrap();
    store.add_port("alpha", 80).unwrap();
    store
        .upsert_tunnel(&TunnelRecord {
            name: "beta".into(),
            remote_forward_ip: None,
            forwarded_ports: vec![8080],
        })
        .unwrap();

    let rules = store.all_rules().unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].tunnel, "alpha");
    assert_eq!(store.list_tunnels().unwrap(), vec!["alpha", "beta"]);
}

#[test]
fn test_set_remote_ip() {
    let (_dir, store) = store();
    store.set_remote_ip("alpha", "10.0.0.9").unwrap();
    assert_eq!(
        store.require_tunnel("alpha").unwrap().remote_forward_ip.as_deref(),
        Some("10.0.0.9")
    );

    let err = store.set_remote_ip("alpha", "not-an-ip").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_forward_mode_persistence() {
    let (dir, store) = store();
    assert_eq!(store.forward_mode().unwrap(), ForwardingMode::Disabled);

    std::fs::write(dir.path().join("config.yaml"), "forward_mode: nonsense\nother: kept\n").unwrap();
    assert_eq!(store.forward_mode().unwrap(), ForwardingMode::Disabled);

    store.set_forward_mode(ForwardingMode::ProxyConfig).unwrap();
    assert_eq!(store.forward_mode().unwrap(), ForwardingMode::ProxyConfig);

    let raw = std::fs::read_to_string(dir.path().join("config.yaml")).unwrap();
    assert!(raw.contains("forward_mode: haproxy"));
    assert!(raw.contains("other: kept"));
}

#[test]
fn test_invalid_tunnel_name_rejected() {
    let (_dir, store) = store();
    let err = store.upsert_tunnel(&TunnelRecord::new("../escape", "10.0.0.2")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_reads_cannot_leave_tunnel_dir() {
    let (dir, store) = store();
    std::fs::write(dir.path().join("outside.yaml"), "remote_forward_ip: 10.0.0.9\n").unwrap();

    for name in ["../outside", "/etc/passwd", ".hidden"] {
        assert_eq!(store.tunnel(name).unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(store.require_tunnel(name).unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(store.snapshot(name).unwrap_err().kind(), ErrorKind::Validation);
    }
}

#[test]
fn test_stray_files_in_tunnel_dir_are_skipped() {
    let (dir, store) = store();
    store.upsert_tunnel(&TunnelRecord::new("alpha", "10.0.0.2")).unwrap();
    std::fs::write(dir.path().join("tunnels").join(".scratch.yaml"), "").unwrap();

    let names: Vec<String> = store.all_tunnels().unwrap().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["alpha".to_string()]);
}
