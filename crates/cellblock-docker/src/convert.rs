//! Mapping between Cellblock types and Docker Engine API types.

use std::collections::HashMap;

use bollard::container::Config;
use bollard::errors::Error as BollardError;
use bollard::exec::CreateExecOptions;
use bollard::models::HostConfig;

use cellblock_core::{ChannelRequest, CreateParams, RuntimeError};

/// Container body for a sandbox. No bind mounts, no published ports.
pub fn container_config(params: &CreateParams) -> Config<String> {
    let host_config = HostConfig {
        memory: Some(params.memory_bytes),
        cpu_quota: Some(params.cpu_quota),
        cpu_period: Some(params.cpu_period),
        pids_limit: Some(params.pids_limit),
        network_mode: Some(params.network_mode.clone()),
        cap_drop: Some(params.cap_drop.clone()),
        cap_add: Some(params.cap_add.clone()),
        security_opt: Some(params.security_opt.clone()),
        tmpfs: Some(
            params
                .tmpfs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        ..HostConfig::default()
    };

    Config {
        image: Some(params.image.clone()),
        labels: Some(
            params
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
        ),
        open_stdin: Some(params.open_stdin),
        tty: Some(params.tty),
        host_config: Some(host_config),
        ..Config::default()
    }
}

/// Exec options for an interactive shell with a TTY.
pub fn exec_options(request: &ChannelRequest) -> CreateExecOptions<String> {
    CreateExecOptions {
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(true),
        cmd: Some(request.command.clone()),
        env: Some(
            request
                .env
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
        ),
        user: Some(request.user.clone()),
        working_dir: Some(request.workdir.clone()),
        ..CreateExecOptions::default()
    }
}

/// Classify an engine error.
pub fn runtime_error(operation: &str, target: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(target.to_string()),
        other => RuntimeError::Backend(format!("{operation} {target}: {other}")),
    }
}

/// Docker answers 304 when stopping a container that is not running.
pub fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}
