use crate::{
    config::LauncherConfig,
    slot::{Role, SlotKey},
};
use itertools::Itertools;
use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    net::{IpAddr, ToSocketAddrs},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("Failed to write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Server list is empty")]
    NoServers,
}

/// Server addresses published to the workers.
///
/// Written once after every server is running and never touched again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// one `index address:port` line per server
    pub endpoint_list: PathBuf,
    /// one address line per server, same order
    pub machine_list: PathBuf,
    pub endpoints: Vec<(usize, String)>,
}

/// resolve a host name to an ip address, falls back to the host name itself
pub fn resolve_address(host: &str) -> String {
    if host.parse::<IpAddr>().is_ok() {
        return host.to_string();
    }

    match (host, 0).to_socket_addrs() {
        Ok(addresses) => {
            // prefer v4, the start scripts expect dotted quads
            let addresses = addresses.collect_vec();

            addresses
                .iter()
                .find(|address| address.is_ipv4())
                .or(addresses.first())
                .map(|address| address.ip().to_string())
                .unwrap_or_else(|| host.to_string())
        }
        Err(error) => {
            warn!(host = host, error = ?error, "Failed to resolve host, using it verbatim");

            host.to_string()
        }
    }
}

/// Generates the per slot launch scripts and the topology descriptor.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    verbose: bool,
    port: u16,
    servers: usize,
    workers: usize,
    server_args: String,
    worker_args: String,
    scripts: PathBuf,
    server_dir: PathBuf,
    worker_dir: PathBuf,
    start_file: String,
    endpoint_list: String,
    machine_list: String,
}

impl CommandGenerator {
    pub fn load(config: &LauncherConfig) -> Self {
        Self {
            verbose: config.verbose,
            port: config.job.port,
            servers: config.job.servers,
            workers: config.job.workers,
            server_args: config.job.server_args.clone(),
            worker_args: config.job.worker_args.clone(),
            scripts: config.paths.scripts.clone(),
            server_dir: config.paths.server_dir.clone(),
            worker_dir: config.paths.worker_dir.clone(),
            start_file: config.paths.start_file.clone(),
            endpoint_list: config.paths.endpoint_list.clone(),
            machine_list: config.paths.machine_list.clone(),
        }
    }

    /// directory the given role's process runs in
    pub fn work_dir(&self, role: Role) -> &Path {
        match role {
            Role::Server => &self.server_dir,
            Role::Worker => &self.worker_dir,
        }
    }

    pub fn topology_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.worker_dir.join(&self.endpoint_list),
            self.worker_dir.join(&self.machine_list),
        )
    }

    /// `start serverId workerNum serverNum ip:port serverArgs`
    pub fn server_script(&self, index: usize, host: &str) -> Result<PathBuf, GeneratorError> {
        let address = resolve_address(host);
        let path = self.scripts.join(SlotKey::server(index).script_name());

        let mut lines = vec![format!("cd {}", self.server_dir.to_string_lossy())];

        if self.verbose {
            lines.push(String::from("echo 'fileslist:'"));
            lines.push(String::from("ls"));
            lines.push(String::from("echo 'user:'"));
            lines.push(String::from("whoami"));
            lines.push(String::from("echo 'content of cmd:'"));
            lines.push(format!("cat {}", self.start_file));
        }

        lines.push(command_line(
            &self.start_file,
            [
                index.to_string(),
                self.workers.to_string(),
                self.servers.to_string(),
                format!("{address}:{}", self.port),
            ],
            &self.server_args,
        ));

        self.write_script(&path, &lines)?;
        debug!(path = ?path, "Generated launch script for server {index}");

        Ok(path)
    }

    /// `start endpointlist machinelist workerId workerNum serverNum port workerArgs`
    pub fn worker_script(
        &self,
        index: usize,
        topology: &Topology,
    ) -> Result<PathBuf, GeneratorError> {
        let path = self.scripts.join(SlotKey::worker(index).script_name());
        let endpoint_list = topology.endpoint_list.to_string_lossy();
        let machine_list = topology.machine_list.to_string_lossy();

        let mut lines = vec![format!("cd {}", self.worker_dir.to_string_lossy())];

        if self.verbose {
            lines.push(String::from("echo 'files:'"));
            lines.push(String::from("ls"));
            lines.push(String::from("echo 'user:'"));
            lines.push(String::from("whoami"));
            lines.push(String::from("echo 'content of cmd:'"));
            lines.push(format!("cat {}", self.start_file));
            lines.push(String::from("echo 'content of endpointlist:'"));
            lines.push(format!("cat {endpoint_list}"));
            lines.push(String::from("echo 'content of machinelist:'"));
            lines.push(format!("cat {machine_list}"));
        }

        lines.push(command_line(
            &self.start_file,
            [
                endpoint_list.to_string(),
                machine_list.to_string(),
                index.to_string(),
                self.workers.to_string(),
                self.servers.to_string(),
                self.port.to_string(),
            ],
            &self.worker_args,
        ));

        self.write_script(&path, &lines)?;
        debug!(path = ?path, "Generated launch script for worker {index}");

        Ok(path)
    }

    /// Write the endpoint list and the machine list for the given servers.
    ///
    /// `servers` must be ordered by server index.
    pub fn write_topology(&self, servers: &[(usize, String)]) -> Result<Topology, GeneratorError> {
        if servers.is_empty() {
            return Err(GeneratorError::NoServers);
        }

        info!("Generating server list for {} servers", servers.len());

        let (endpoint_list, machine_list) = self.topology_paths();
        let endpoints = servers
            .iter()
            .map(|(index, host)| (*index, format!("{}:{}", resolve_address(host), self.port)))
            .collect_vec();

        let endpoint_lines = endpoints
            .iter()
            .map(|(index, endpoint)| format!("{index} {endpoint}"))
            .collect_vec();
        let machine_lines = servers
            .iter()
            .map(|(_, host)| resolve_address(host))
            .collect_vec();

        write_lines(&endpoint_list, &endpoint_lines)?;
        write_lines(&machine_list, &machine_lines)?;

        Ok(Topology {
            endpoint_list,
            machine_list,
            endpoints,
        })
    }

    fn write_script(&self, path: &Path, lines: &[String]) -> Result<(), GeneratorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| GeneratorError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut script = vec![String::from("#!/bin/sh")];
        script.extend_from_slice(lines);
        write_lines(path, &script)?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|source| {
            GeneratorError::Write {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}

/// `./start a b c args 2>&1`, user args are appended verbatim when present
fn command_line(
    start_file: &str,
    positional: impl IntoIterator<Item = String>,
    args: &str,
) -> String {
    std::iter::once(format!("./{start_file}"))
        .chain(positional)
        .chain(Some(args.trim()).filter(|args| !args.is_empty()).map(String::from))
        .chain(std::iter::once(String::from("2>&1")))
        .join(" ")
}

fn write_lines(path: &Path, lines: &[String]) -> Result<(), GeneratorError> {
    let to_error = |source| GeneratorError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut out = BufWriter::new(File::create(path).map_err(to_error)?);

    for line in lines {
        writeln!(out, "{line}").map_err(to_error)?;
    }

    out.flush().map_err(to_error)
}
