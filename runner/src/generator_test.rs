use crate::{
    generator::{resolve_address, CommandGenerator, GeneratorError},
    slot::Role,
    testing::config,
};
use std::{fs, os::unix::fs::PermissionsExt};
use tempfile::TempDir;

#[test]
pub fn server_script_layout() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), 2, 3);
    let generator = CommandGenerator::load(&config);

    let path = generator.server_script(1, "127.0.0.1").unwrap();

    assert_eq!(path, dir.path().join("scripts").join("_server1.sh"));
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        format!(
            "#!/bin/sh\ncd {}\n./start.sh 1 3 2 127.0.0.1:9000 2>&1\n",
            config.paths.server_dir.to_string_lossy()
        )
    );
    assert_eq!(
        fs::metadata(&path).unwrap().permissions().mode() & 0o777,
        0o755
    );
    assert_eq!(generator.work_dir(Role::Server), config.paths.server_dir);
}

#[test]
pub fn user_args_are_trimmed_and_appended() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), 1, 1);
    config.job.server_args = String::from("  --lr 0.1 ");

    let path = CommandGenerator::load(&config)
        .server_script(0, "10.0.0.7")
        .unwrap();

    assert!(fs::read_to_string(path)
        .unwrap()
        .ends_with("./start.sh 0 1 1 10.0.0.7:9000 --lr 0.1 2>&1\n"));
}

#[test]
pub fn verbose_scripts_print_diagnostics() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), 1, 2);
    config.verbose = true;
    let generator = CommandGenerator::load(&config);

    let topology = generator
        .write_topology(&[(0, String::from("10.0.0.1"))])
        .unwrap();
    let script = fs::read_to_string(generator.worker_script(1, &topology).unwrap()).unwrap();

    assert!(script.contains("\nls\n"));
    assert!(script.contains("\nwhoami\n"));
    assert!(script.contains(&format!("cat {}", topology.endpoint_list.to_string_lossy())));
    assert!(script.ends_with("1 2 1 9000 --epochs 3 2>&1\n"));
}

#[test]
pub fn topology_keeps_index_order() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), 3, 1);
    let generator = CommandGenerator::load(&config);

    let topology = generator
        .write_topology(&[
            (0, String::from("10.0.0.3")),
            (1, String::from("10.0.0.1")),
            (2, String::from("10.0.0.2")),
        ])
        .unwrap();

    assert_eq!(
        topology.endpoint_list,
        config.paths.worker_dir.join("_endpointlist")
    );
    assert_eq!(
        fs::read_to_string(&topology.endpoint_list).unwrap(),
        "0 10.0.0.3:9000\n1 10.0.0.1:9000\n2 10.0.0.2:9000\n"
    );
    assert_eq!(
        fs::read_to_string(&topology.machine_list).unwrap(),
        "10.0.0.3\n10.0.0.1\n10.0.0.2\n"
    );
    assert_eq!(topology.endpoints[2], (2, String::from("10.0.0.2:9000")));
}

#[test]
pub fn empty_topology_is_rejected() {
    let dir = TempDir::new().unwrap();
    let generator = CommandGenerator::load(&config(dir.path(), 1, 1));

    assert!(matches!(
        generator.write_topology(&[]),
        Err(GeneratorError::NoServers)
    ));
}

#[test]
pub fn unwritable_script_dir_is_an_error() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), 1, 1);
    // a file where the scripts directory should be
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "").unwrap();
    config.paths.scripts = blocker.join("scripts");

    assert!(matches!(
        CommandGenerator::load(&config).server_script(0, "127.0.0.1"),
        Err(GeneratorError::Write { .. })
    ));
}

#[test]
pub fn addresses_pass_through_or_fall_back() {
    assert_eq!(resolve_address("192.168.1.20"), "192.168.1.20");
    assert_eq!(resolve_address("::1"), "::1");
    assert_eq!(
        resolve_address("no-such-host.invalid"),
        "no-such-host.invalid"
    );
}
