#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tunnel_forward::config::Config;
use tunnel_forward::exec::find_program;

/// Stands in for the proxy binary: `-c -f FILE` validates, anything else
/// launches a long-running dummy named `haproxy` and records its pid.
const FAKE_PROXY: &str = r#"#!/bin/sh
here="$(dirname "$0")"
if [ "$1" = "-c" ]; then
    if [ -e "$here/fail-validate" ] || grep -q MALFORMED "$3"; then
        echo "[ALERT] parsing [$3] : unknown keyword 'MALFORMED'" >&2
        exit 1
    fi
    echo "Configuration file is valid"
    exit 0
fi
if [ -e "$here/fail-launch" ]; then
    echo "[ALERT] Starting frontend: cannot bind socket" >&2
    exit 1
fi
# the daemon runs under the proxy's name, like a real one would
mkdir -p "$here/daemon"
ln -sf "$(command -v sleep)" "$here/daemon/haproxy"
"$here/daemon/haproxy" 300 </dev/null >/dev/null 2>&1 &
echo $! > "$4"
exit 0
"#;

/// Stands in for the service manager: `ctl reload|restart|stop`
const FAKE_CTL: &str = r#"#!/bin/sh
here="$(dirname "$0")"
echo "$1" >> "$here/ctl.log"
if [ -e "$here/fail-$1" ]; then
    echo "$1 failed" >&2
    exit 1
fi
exit 0
"#;

pub struct FakeProxy {
    pub dir: tempfile::TempDir,
}

impl FakeProxy {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir.path().join("haproxy"), FAKE_PROXY);
        write_script(&dir.path().join("ctl"), FAKE_CTL);
        Self { dir }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn config_path(&self) -> PathBuf {
        self.path("haproxy.cfg")
    }

    pub fn set_marker(&self, name: &str) {
        std::fs::write(self.path(name), "").unwrap();
    }

    pub fn clear_marker(&self, name: &str) {
        let _ = std::fs::remove_file(self.path(name));
    }

    pub fn ctl_log(&self) -> String {
        std::fs::read_to_string(self.path("ctl.log")).unwrap_or_default()
    }

    pub fn apply_to(&self, cfg: &mut Config) {
        let ctl = self.path("ctl").display().to_string();
        cfg.proxy.binary = self.path("haproxy").display().to_string();
        cfg.proxy.config_path = self.config_path();
        cfg.proxy.backup_path = self.path("haproxy.cfg.bak");
        cfg.proxy.pid_file = self.path("haproxy.pid");
        cfg.proxy.reload_command = vec![ctl.clone(), "reload".into()];
        cfg.proxy.restart_command = vec![ctl.clone(), "restart".into()];
        cfg.proxy.stop_command = vec![ctl, "stop".into()];
        cfg.proxy.command_timeout_secs = 5;
        cfg.proxy.restart_timeout_secs = 5;
    }
}

/// Stands in for the forward helper: binds the `TCP-LISTEN:<port>` argument
/// and accepts until signalled. Marker files next to it change its behaviour.
const FAKE_HELPER: &str = r#"
use strict;
use warnings;
use File::Basename qw(dirname);
use IO::Socket::INET;

my $here = dirname($0);
exit 3 if -e "$here/fail-start";
$SIG{TERM} = 'IGNORE' if -e "$here/ignore-term";
if (-e "$here/no-listen") {
    sleep 30;
    exit 0;
}

my ($port) = map { /^TCP6?-LISTEN:(\d+)/ ? $1 : () } @ARGV;
die "no listen address\n" unless defined $port;
my $server = IO::Socket::INET->new(
    LocalAddr => '0.0.0.0',
    LocalPort => $port,
    Listen    => 16,
    ReuseAddr => 1,
) or die "bind $port: $!\n";
while (1) {
    my $client = $server->accept or next;
    close $client;
}
"#;

pub struct FakeHelper {
    pub dir: tempfile::TempDir,
    name: String,
}

impl FakeHelper {
    /// `name` must be unique per test: stop-all matches helpers by name
    /// across the whole process table. `None` without a perl interpreter.
    pub fn new(name: &str) -> Option<Self> {
        let perl = find_program("perl")?;
        let dir = tempfile::tempdir().unwrap();
        let script = format!("#!{}{}", perl.display(), FAKE_HELPER);
        write_script(&dir.path().join(name), &script);
        Some(Self {
            dir,
            name: name.to_string(),
        })
    }

    pub fn binary(&self) -> String {
        self.dir.path().join(&self.name).display().to_string()
    }

    pub fn set_marker(&self, marker: &str) {
        std::fs::write(self.dir.path().join(marker), "").unwrap();
    }
}

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A port nothing listens on right now
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn count_frontends(config: &str) -> usize {
    config
        .lines()
        .filter(|l| l.starts_with("frontend ") && !l.starts_with("frontend stats_frontend"))
        .count()
}
