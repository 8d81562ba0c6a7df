// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Process launcher and supervisor.
//!
//! Starts the agent and main processes (as children running this same
//! binary) plus any configured external services, waits for each service's
//! port to accept connections, then supervises.  There is no automatic
//! restart: any child exit is logged and brings the whole launcher down so
//! the operator sees the failure.  Shutdown is SIGTERM, a 3 s grace
//! period, then SIGKILL.

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use miko_config::Config;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

const PORT_POLL: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
const SUPERVISE_TICK: Duration = Duration::from_secs(1);

struct Service {
    name: String,
    child: Child,
    port: Option<u16>,
}

pub async fn run(config: Config, config_path: Option<&Path>) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("locating own executable")?;
    let mut services: Vec<Service> = Vec::new();

    // External collaborators first (memory, monitor) — start order between
    // services does not matter, readiness is awaited for all of them.
    for external in &config.launcher.external {
        let child = Command::new(&external.command)
            .args(&external.args)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", external.name))?;
        info!(service = %external.name, pid = child.id(), "started");
        services.push(Service {
            name: external.name.clone(),
            child,
            port: external.port,
        });
    }

    for (name, subcommand, port) in [
        ("agent", "agent", config.ports.agent),
        ("main", "main", config.ports.main),
    ] {
        let mut command = Command::new(&exe);
        command.arg(subcommand);
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }
        let child = command
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {name} process"))?;
        info!(service = name, pid = child.id(), "started");
        services.push(Service {
            name: name.to_string(),
            child,
            port: Some(port),
        });
    }

    // Readiness: every service with a port must start accepting
    // connections within the shared budget, and stay alive doing so.
    let deadline = Instant::now() + Duration::from_secs(config.launcher.ready_timeout_secs);
    for service in &mut services {
        let Some(port) = service.port else { continue };
        loop {
            if let Some(status) = service.child.try_wait()? {
                anyhow::bail!("{} exited during startup with {status}", service.name);
            }
            if port_open(port).await {
                info!(service = %service.name, port, "ready");
                break;
            }
            if Instant::now() >= deadline {
                let name = service.name.clone();
                shutdown_all(&mut services).await;
                anyhow::bail!("{name} did not open port {port} in time");
            }
            tokio::time::sleep(PORT_POLL).await;
        }
    }

    info!("all services ready");
    println!("miko is ready — main on port {}", config.ports.main);

    // Supervise: first child exit (or Ctrl-C) ends everything.
    let result = supervise(&mut services).await;
    shutdown_all(&mut services).await;
    result
}

async fn supervise(services: &mut Vec<Service>) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(SUPERVISE_TICK) => {
                for service in services.iter_mut() {
                    if let Some(status) = service.child.try_wait()? {
                        error!(service = %service.name, %status, "process exited");
                        anyhow::bail!("{} exited unexpectedly with {status}", service.name);
                    }
                }
            }
        }
    }
}

pub(crate) async fn port_open(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tokio::time::timeout(PORT_POLL, TcpStream::connect(addr))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

/// SIGTERM, bounded grace, SIGKILL — in reverse start order so the main
/// process goes before its collaborators.
async fn shutdown_all(services: &mut Vec<Service>) {
    for service in services.iter_mut().rev() {
        if matches!(service.child.try_wait(), Ok(Some(_))) {
            continue;
        }

        #[cfg(unix)]
        if let Some(pid) = service.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, service.child.wait()).await {
            Ok(_) => info!(service = %service.name, "stopped"),
            Err(_) => {
                warn!(service = %service.name, "ignored SIGTERM, killing");
                let _ = service.child.start_kill();
                let _ = service.child.wait().await;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
