use crate::{
    cluster::{LaunchSpec, EXIT_ABORTED},
    orchestrator::launch::{PrimaryRunner, ShellRunner},
    slot::SlotKey,
    testing::{alive, eventually, read_pid},
};
use std::{
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use tempfile::TempDir;

#[test]
pub fn stop_terminates_whole_primary_script() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("sleeper.pid");
    let script = dir.path().join("_worker0.sh");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\nsleep 4711 &\necho $! > {}\nwait\n",
            pid_file.to_string_lossy()
        ),
    )
    .unwrap();

    let launch = LaunchSpec {
        slot: SlotKey::worker(0),
        script,
        work_dir: dir.path().to_path_buf(),
        credentials: None,
    };
    let runner = Arc::new(ShellRunner::new());
    let started = Arc::new(AtomicBool::new(false));

    let worker = {
        let runner = runner.clone();
        let started = started.clone();
        thread::spawn(move || runner.run(&launch, &|| started.store(true, Ordering::SeqCst)))
    };

    let sleeper = read_pid(&pid_file);
    assert!(eventually(|| started.load(Ordering::SeqCst)));

    runner.stop();

    assert_eq!(worker.join().unwrap().unwrap(), EXIT_ABORTED);
    assert!(eventually(|| !alive(sleeper)));
}
