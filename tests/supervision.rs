//! End-to-end scenarios: a full core (controller + bus) driven over the
//! control socket, supervising real child processes.

#![cfg(unix)]

use pup::controller::Pup;
use pup::event::channel::{pub_sub, EventPublisher};
use pup::event::ApplicationEvent;
use pup::ipc::codec::{read_frame, write_frame};
use pup::ipc::server::BusServer;
use pup::plan::Plan;
use serde_json::{json, Value};
use std::fs;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::{Duration, Instant};

struct Core {
    bus: Option<BusServer>,
    handle: thread::JoinHandle<()>,
    // Keeps the application-event channel open for the core's lifetime, as
    // the signal handler does in the binary.
    _application_events: EventPublisher<ApplicationEvent>,
    _config_dir: tempfile::TempDir,
}

impl Core {
    fn start(config: &str) -> Self {
        let config_dir = tempfile::tempdir().unwrap();
        let config_path = config_dir.path().join("pup.json");
        fs::write(&config_path, config).unwrap();
        let plan = Plan::load(&config_path).unwrap();

        let (command_publisher, command_consumer) = pub_sub();
        let (application_events, application_event_consumer) = pub_sub();
        let bus = BusServer::start(&plan.socket_path, command_publisher).unwrap();
        let pup = Pup::new(&plan);
        let handle = thread::spawn(move || pup.run(command_consumer, application_event_consumer));

        Self {
            bus: Some(bus),
            handle,
            _application_events: application_events,
            _config_dir: config_dir,
        }
    }

    fn connect(&self) -> UnixStream {
        UnixStream::connect(self.bus.as_ref().unwrap().socket_path()).unwrap()
    }

    fn wait_until_finished(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.handle.is_finished() {
            assert!(Instant::now() < deadline, "core did not finish in time");
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn finish(mut self) {
        self.wait_until_finished(Duration::from_secs(10));
        self.handle.join().unwrap();
        self.bus.take().unwrap().stop();
    }
}

fn roundtrip(stream: &mut UnixStream, body: Value) -> Value {
    write_frame(stream, body.to_string().as_bytes()).unwrap();
    let frame = read_frame(stream).unwrap().expect("reply expected");
    serde_json::from_slice(&frame).unwrap()
}

fn wait_for_status(
    stream: &mut UnixStream,
    timeout: Duration,
    predicate: impl Fn(&Value) -> bool,
) -> Value {
    let deadline = Instant::now() + timeout;
    loop {
        let status = roundtrip(stream, json!({"type": "status"}));
        if predicate(&status) {
            return status;
        }
        assert!(
            Instant::now() < deadline,
            "condition not reached; last status: {status}"
        );
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn autostarted_process_cycles_under_restart_always() {
    let core = Core::start(
        r#"{"processes":[{
            "id": "a",
            "cmd": ["true"],
            "autostart": true,
            "restart": "always",
            "restartDelayMs": 100
        }]}"#,
    );
    let mut client = core.connect();

    let status = wait_for_status(&mut client, Duration::from_secs(10), |status| {
        status["processes"][0]["restarts"].as_u64().unwrap_or(0) >= 5
    });
    assert_ne!(status["processes"][0]["state"], "failed");

    let reply = roundtrip(&mut client, json!({"type": "terminate"}));
    assert_eq!(reply, json!({"type": "ok"}));
    core.finish();
}

#[test]
fn operator_can_stop_and_start_over_the_bus() {
    let core = Core::start(
        r#"{"processes":[{
            "id": "svc",
            "cmd": ["sleep", "30"],
            "autostart": true,
            "terminateTimeoutMs": 500
        }]}"#,
    );
    let mut client = core.connect();

    wait_for_status(&mut client, Duration::from_secs(5), |status| {
        status["processes"][0]["state"] == "running"
    });

    let reply = roundtrip(&mut client, json!({"type": "stop", "id": "svc"}));
    assert_eq!(reply, json!({"type": "ok"}));
    wait_for_status(&mut client, Duration::from_secs(5), |status| {
        status["processes"][0]["state"] == "stopped"
    });

    let reply = roundtrip(&mut client, json!({"type": "start", "id": "svc"}));
    assert_eq!(reply, json!({"type": "ok"}));
    wait_for_status(&mut client, Duration::from_secs(5), |status| {
        status["processes"][0]["state"] == "running"
    });

    roundtrip(&mut client, json!({"type": "terminate"}));
    core.finish();
}

#[test]
fn blocked_process_ignores_operator_triggers() {
    let core = Core::start(
        r#"{"processes":[{
            "id": "svc",
            "cmd": ["sleep", "30"],
            "autostart": true,
            "terminateTimeoutMs": 500
        }]}"#,
    );
    let mut client = core.connect();

    wait_for_status(&mut client, Duration::from_secs(5), |status| {
        status["processes"][0]["state"] == "running"
    });
    let pid_before = roundtrip(&mut client, json!({"type": "status"}))["processes"][0]["pid"]
        .as_u64()
        .unwrap();

    roundtrip(&mut client, json!({"type": "block", "id": "svc"}));
    wait_for_status(&mut client, Duration::from_secs(5), |status| {
        status["processes"][0]["state"] == "blocked"
    });

    // Dropped while blocked; the child keeps its pid.
    roundtrip(&mut client, json!({"type": "stop", "id": "svc"}));
    thread::sleep(Duration::from_millis(300));
    let status = roundtrip(&mut client, json!({"type": "status"}));
    assert_eq!(status["processes"][0]["state"], "blocked");
    assert_eq!(status["processes"][0]["pid"].as_u64().unwrap(), pid_before);

    roundtrip(&mut client, json!({"type": "unblock", "id": "svc"}));
    wait_for_status(&mut client, Duration::from_secs(5), |status| {
        status["processes"][0]["state"] == "running"
    });

    roundtrip(&mut client, json!({"type": "terminate"}));
    core.finish();
}

#[test]
fn terminate_reaps_children_that_ignore_the_first_signal() {
    let core = Core::start(
        r#"{"processes":[
            {"id":"s0","cmd":["sh","-c","trap '' TERM; while true; do sleep 1; done"],
             "autostart":true,"terminateTimeoutMs":200},
            {"id":"s1","cmd":["sh","-c","trap '' TERM; while true; do sleep 1; done"],
             "autostart":true,"terminateTimeoutMs":200},
            {"id":"s2","cmd":["sh","-c","trap '' TERM; while true; do sleep 1; done"],
             "autostart":true,"terminateTimeoutMs":200},
            {"id":"s3","cmd":["sh","-c","trap '' TERM; while true; do sleep 1; done"],
             "autostart":true,"terminateTimeoutMs":200},
            {"id":"s4","cmd":["sh","-c","trap '' TERM; while true; do sleep 1; done"],
             "autostart":true,"terminateTimeoutMs":200}
        ]}"#,
    );
    let mut client = core.connect();

    let status = wait_for_status(&mut client, Duration::from_secs(5), |status| {
        status["processes"]
            .as_array()
            .unwrap()
            .iter()
            .all(|p| p["state"] == "running")
    });
    // Warm-up time for the shells to install their traps.
    thread::sleep(Duration::from_millis(500));

    let pids: Vec<i32> = status["processes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["pid"].as_u64().unwrap() as i32)
        .collect();

    roundtrip(&mut client, json!({"type": "terminate"}));
    core.finish();

    for pid in pids {
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
        assert!(!alive, "pid {pid} survived terminate");
    }
}

#[test]
fn status_reports_the_last_exit() {
    let core = Core::start(
        r#"{"processes":[{
            "id": "brief",
            "cmd": ["sh", "-c", "exit 3"],
            "autostart": true
        }]}"#,
    );
    let mut client = core.connect();

    let status = wait_for_status(&mut client, Duration::from_secs(5), |status| {
        status["processes"][0]["state"] == "failed"
    });
    assert_eq!(status["processes"][0]["lastExit"]["code"], 3);

    roundtrip(&mut client, json!({"type": "terminate"}));
    core.finish();
}
