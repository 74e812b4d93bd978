use async_trait::async_trait;
use devherd::configuration::{Service, SupervisorConfig};
use devherd::launcher::{LaunchFailure, ProcessControl, SignalFailure};
use devherd::readiness::{Endpoint, Readiness};
use devherd::session::{Health, ProbeResult, Session};
use devherd::shutdown::{self, Trigger};
use devherd::state::{ProcessRecord, StateStore};
use devherd::supervisor::{DoubleStart, Stopped, Supervisor};
use matches::assert_matches;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Hands out PIDs 111, 222, ... and remembers everything it was asked to do.
#[derive(Default)]
struct FakeControl {
    missing: Vec<String>,
    gone: Vec<i32>,
    launched: Vec<String>,
    signals: Vec<(i32, Signal)>,
}

impl ProcessControl for FakeControl {
    fn launch(
        &mut self,
        service: &Service,
        _env: &HashMap<String, String>,
    ) -> Result<ProcessRecord, LaunchFailure> {
        if self.missing.contains(&service.name) {
            return Err(LaunchFailure::CommandNotFound(service.cmd[0].clone()));
        }
        self.launched.push(service.name.clone());
        let pid = 111 * self.launched.len() as i32;
        Ok(ProcessRecord::new(&service.name, Pid::from_raw(pid)))
    }

    fn signal(&mut self, pid: Pid, signal: Signal) -> Result<(), SignalFailure> {
        self.signals.push((pid.as_raw(), signal));
        if self.gone.contains(&pid.as_raw()) {
            Err(SignalFailure::Gone)
        } else {
            Ok(())
        }
    }
}

/// Answers probes from a table, keyed by endpoint port.
#[derive(Default)]
struct FakeProbe {
    ready: HashMap<u16, bool>,
}

#[async_trait(?Send)]
impl Readiness for FakeProbe {
    async fn await_ready(&self, endpoint: &Endpoint, _: Duration, _: Duration) -> bool {
        self.ready.get(&endpoint.port()).cloned().unwrap_or(false)
    }
}

/// Never answers; only a shutdown request gets the supervisor past it.
struct HangingProbe;

#[async_trait(?Send)]
impl Readiness for HangingProbe {
    async fn await_ready(&self, _: &Endpoint, _: Duration, _: Duration) -> bool {
        futures::future::pending::<bool>().await
    }
}

fn service(name: &str, port: u16, probed: bool) -> Service {
    Service {
        name: name.to_string(),
        dir: PathBuf::from("."),
        cmd: vec![format!("run-{}", name)],
        port,
        readiness: if probed {
            Some(format!("http://localhost:{}/health", port).parse().unwrap())
        } else {
            None
        },
    }
}

fn quick_settings() -> SupervisorConfig {
    SupervisorConfig {
        settle_delay: Duration::from_millis(1),
        grace_period: Duration::from_millis(1),
        readiness_timeout: Duration::from_millis(10),
        readiness_poll_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

fn supervisor<R: Readiness>(
    dir: &tempfile::TempDir,
    control: FakeControl,
    probe: R,
) -> Supervisor<FakeControl, R> {
    Supervisor::new(
        StateStore::new(dir.path().join(".pids.json")),
        control,
        probe,
        quick_settings(),
    )
}

fn pid(raw: i32) -> Pid {
    Pid::from_raw(raw)
}

fn not_interrupted() -> (Trigger, shutdown::Shutdown) {
    shutdown::channel()
}

#[test]
fn records_exactly_the_launched_services() {
    let dir = tempfile::tempdir().unwrap();
    let control = FakeControl {
        missing: vec!["b".to_string()],
        ..Default::default()
    };
    let mut sup = supervisor(&dir, control, FakeProbe::default());
    let services = vec![
        service("a", 8000, false),
        service("b", 8001, false),
        service("c", 8002, false),
    ];
    let (_trigger, shutdown) = not_interrupted();

    let progress = smol::run(sup.start(&services, &HashMap::new(), &shutdown)).unwrap();

    let expected = vec![
        ProcessRecord::new("a", pid(111)),
        ProcessRecord::new("c", pid(222)),
    ];
    assert_eq!(sup.store().read(), expected);
    assert_eq!(progress.launched, expected);
    assert_eq!(progress.failed, vec!["b".to_string()]);
    assert_eq!(sup.control().launched, vec!["a", "c"]);
    assert_matches!(sup.session(), &Session::Running(_));
}

#[test]
fn missing_command_and_healthy_service_is_degraded_but_running() {
    let dir = tempfile::tempdir().unwrap();
    let control = FakeControl {
        missing: vec!["broken".to_string()],
        ..Default::default()
    };
    let mut probe = FakeProbe::default();
    probe.ready.insert(8000, true);
    let mut sup = supervisor(&dir, control, probe);
    let services = vec![service("broken", 9000, true), service("web", 8000, true)];
    let (_trigger, shutdown) = not_interrupted();

    let progress = smol::run(sup.start(&services, &HashMap::new(), &shutdown)).unwrap();

    assert_eq!(sup.store().read().len(), 1);
    assert_eq!(
        progress.probes,
        vec![("web".to_string(), ProbeResult::Ready)]
    );
    assert_eq!(progress.health(), Health::Degraded);
    assert_eq!(progress.unhealthy(), vec!["broken"]);
    assert_matches!(sup.session(), &Session::Running(_));
}

#[test]
fn all_ready_is_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let mut probe = FakeProbe::default();
    probe.ready.insert(8000, true);
    probe.ready.insert(8001, true);
    let mut sup = supervisor(&dir, FakeControl::default(), probe);
    let services = vec![
        service("agent", 8000, true),
        service("sandbox", 8001, true),
        service("grpc", 50051, false),
    ];
    let (_trigger, shutdown) = not_interrupted();

    let progress = smol::run(sup.start(&services, &HashMap::new(), &shutdown)).unwrap();

    assert_eq!(progress.health(), Health::Healthy);
    assert_eq!(
        progress.probes,
        vec![
            ("agent".to_string(), ProbeResult::Ready),
            ("sandbox".to_string(), ProbeResult::Ready),
            ("grpc".to_string(), ProbeResult::Assumed),
        ]
    );
}

#[test]
fn services_without_endpoint_are_never_probed() {
    let dir = tempfile::tempdir().unwrap();
    let mut sup = supervisor(&dir, FakeControl::default(), HangingProbe);
    let services = vec![service("grpc", 50051, false)];
    let (_trigger, shutdown) = not_interrupted();

    let progress = smol::run(sup.start(&services, &HashMap::new(), &shutdown)).unwrap();

    assert_eq!(
        progress.probes,
        vec![("grpc".to_string(), ProbeResult::Assumed)]
    );
    assert_eq!(progress.health(), Health::Healthy);
}

#[test]
fn probe_timeouts_keep_running_degraded() {
    let dir = tempfile::tempdir().unwrap();
    let mut sup = supervisor(&dir, FakeControl::default(), FakeProbe::default());
    let services = vec![service("slow", 8000, true), service("fast", 8001, true)];
    let (_trigger, shutdown) = not_interrupted();

    let progress = smol::run(sup.start(&services, &HashMap::new(), &shutdown)).unwrap();

    assert_eq!(progress.health(), Health::Degraded);
    assert_eq!(progress.unhealthy(), vec!["slow", "fast"]);
    assert_matches!(sup.session(), &Session::Running(_));
    assert!(sup.store().exists());
}

#[test]
fn refuses_to_start_over_an_existing_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut sup = supervisor(&dir, FakeControl::default(), FakeProbe::default());
    sup.store()
        .write(&[ProcessRecord::new("old", pid(4242))])
        .unwrap();
    let (_trigger, shutdown) = not_interrupted();

    let err = smol::run(sup.start(&[service("a", 8000, false)], &HashMap::new(), &shutdown))
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<DoubleStart>(),
        Some(&DoubleStart {
            path: dir.path().join(".pids.json")
        })
    );
    assert!(sup.control().launched.is_empty());
    assert_eq!(
        sup.store().read(),
        vec![ProcessRecord::new("old", pid(4242))]
    );
    assert_matches!(sup.session(), &Session::Idle(_));
}

#[test]
fn nothing_launched_leaves_no_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let control = FakeControl {
        missing: vec!["a".to_string()],
        ..Default::default()
    };
    let mut sup = supervisor(&dir, control, FakeProbe::default());
    let (_trigger, shutdown) = not_interrupted();

    let progress = smol::run(sup.start(&[service("a", 8000, true)], &HashMap::new(), &shutdown))
        .unwrap();

    assert_eq!(progress.health(), Health::NothingStarted);
    assert!(!sup.store().exists());
    assert_matches!(sup.session(), &Session::Idle(_));
}

#[test]
fn unwritable_pid_file_stops_what_was_launched() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("no-such-dir").join(".pids.json"));
    let mut sup = Supervisor::new(
        store.clone(),
        FakeControl::default(),
        FakeProbe::default(),
        quick_settings(),
    );
    let (_trigger, shutdown) = not_interrupted();

    let services = [service("a", 8000, true), service("b", 8001, true)];
    let res = smol::run(sup.start(&services, &HashMap::new(), &shutdown));

    assert!(res.is_err());
    assert_eq!(sup.control().launched, vec!["a", "b"]);
    assert_eq!(
        sup.control().signals,
        vec![
            (222, Signal::SIGTERM),
            (111, Signal::SIGTERM),
            (111, Signal::SIGKILL),
            (222, Signal::SIGKILL),
        ]
    );
    assert!(!store.exists());
    assert!(!dir.path().join("no-such-dir").exists());
    assert_matches!(sup.session(), &Session::Idle(_));
}

#[test]
fn stop_signals_in_reverse_then_kills_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join(".pids.json"));
    store
        .write(&[
            ProcessRecord::new("A", pid(111)),
            ProcessRecord::new("B", pid(222)),
        ])
        .unwrap();

    // A fresh supervisor, like a separate `stop` invocation would have.
    let mut sup = supervisor(&dir, FakeControl::default(), FakeProbe::default());
    let stopped = smol::run(sup.stop()).unwrap();

    assert_eq!(stopped, Stopped::Stopped(2));
    assert_eq!(
        sup.control().signals,
        vec![
            (222, Signal::SIGTERM),
            (111, Signal::SIGTERM),
            (111, Signal::SIGKILL),
            (222, Signal::SIGKILL),
        ]
    );
    assert!(!store.exists());
    assert_matches!(sup.session(), &Session::Idle(_));
}

#[test]
fn stop_tolerates_dead_processes() {
    let dir = tempfile::tempdir().unwrap();
    let control = FakeControl {
        gone: vec![111, 222],
        ..Default::default()
    };
    let mut sup = supervisor(&dir, control, FakeProbe::default());
    sup.store()
        .write(&[
            ProcessRecord::new("A", pid(111)),
            ProcessRecord::new("B", pid(222)),
        ])
        .unwrap();

    assert_eq!(smol::run(sup.stop()).unwrap(), Stopped::Stopped(2));
    assert_eq!(sup.control().signals.len(), 4);
    assert!(!sup.store().exists());
}

#[test]
fn stop_without_a_session_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mut sup = supervisor(&dir, FakeControl::default(), FakeProbe::default());

    assert_eq!(smol::run(sup.stop()).unwrap(), Stopped::NothingToStop);
    assert!(sup.control().signals.is_empty());
    assert!(!sup.store().exists());

    // and again:
    assert_eq!(smol::run(sup.stop()).unwrap(), Stopped::NothingToStop);
}

#[test]
fn stop_clears_a_garbled_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut sup = supervisor(&dir, FakeControl::default(), FakeProbe::default());
    std::fs::write(sup.store().path(), "not json").unwrap();

    assert_eq!(smol::run(sup.stop()).unwrap(), Stopped::NothingToStop);
    assert!(sup.control().signals.is_empty());
    assert!(!sup.store().exists());
}

#[test]
fn start_then_stop_in_the_same_supervisor() {
    let dir = tempfile::tempdir().unwrap();
    let mut sup = supervisor(&dir, FakeControl::default(), FakeProbe::default());
    let services = vec![service("a", 8000, false), service("b", 8001, false)];
    let (_trigger, shutdown) = not_interrupted();

    smol::run(sup.start(&services, &HashMap::new(), &shutdown)).unwrap();
    assert_eq!(smol::run(sup.stop()).unwrap(), Stopped::Stopped(2));
    assert_eq!(
        sup.control().signals[..2],
        [(222, Signal::SIGTERM), (111, Signal::SIGTERM)]
    );
    assert!(!sup.store().exists());

    // the session is over, so a new one may begin:
    smol::run(sup.start(&services, &HashMap::new(), &shutdown)).unwrap();
    assert_matches!(sup.session(), &Session::Running(_));
}

#[test]
fn shutdown_during_probing_cuts_the_start_short() {
    let dir = tempfile::tempdir().unwrap();
    let mut sup = supervisor(&dir, FakeControl::default(), HangingProbe);
    let services = vec![service("a", 8000, true), service("b", 8001, true)];
    let (trigger, shutdown) = shutdown::channel();

    let progress = smol::run(async {
        let firing = async {
            smol::Timer::after(Duration::from_millis(50)).await;
            trigger.fire();
        };
        let env = HashMap::new();
        let (progress, _) = futures::join!(sup.start(&services, &env, &shutdown), firing);
        progress
    })
    .unwrap();

    assert_eq!(progress.launched.len(), 2);
    assert!(progress.probes.is_empty());
    assert_matches!(sup.session(), &Session::AwaitingReadiness(_));
    assert_eq!(sup.store().read().len(), 2);

    assert_eq!(smol::run(sup.stop()).unwrap(), Stopped::Stopped(2));
    assert!(!sup.store().exists());
}

#[test]
fn shutdown_before_settling_skips_probes() {
    let dir = tempfile::tempdir().unwrap();
    let mut sup = supervisor(&dir, FakeControl::default(), FakeProbe::default());
    let (trigger, shutdown) = shutdown::channel();
    trigger.fire();

    let progress = smol::run(sup.start(&[service("a", 8000, true)], &HashMap::new(), &shutdown))
        .unwrap();

    // Launching itself isn't a suspension point; everything after it is.
    assert_eq!(progress.launched.len(), 1);
    assert!(sup.store().exists());
    assert_matches!(sup.session(), &Session::AwaitingReadiness(_));
}
