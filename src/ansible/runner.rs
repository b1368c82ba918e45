use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use log::{error, info};
use tempfile::NamedTempFile;
use tokio::process::Command;

use crate::ansible::models::PlayReport;
use crate::ansible::Automation;
use crate::config::Config;
use crate::errors::VmError;

/// Automation runner backed by ansible-playbook (task sequences) and ad-hoc
/// ansible (single commands), both parsed through the JSON stdout callback.
pub struct AnsibleRunner {
    user: String,
    key_file: PathBuf,
    playbook_dir: PathBuf,
    ssh_port: u16,
}

impl AnsibleRunner {
    pub fn new(config: &Config) -> Self {
        AnsibleRunner {
            user: config.ansible_user.clone(),
            key_file: config.ansible_key.clone(),
            playbook_dir: config.playbook_dir.clone(),
            ssh_port: config.ssh_port,
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<std::process::Output, VmError> {
        info!("Running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .env("ANSIBLE_STDOUT_CALLBACK", "json")
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .args(args)
            .output()
            .await
            .map_err(|e| VmError::Driver(format!("failed to run {program}: {e}")))?;
        Ok(output)
    }

    fn identity_args<'a>(&'a self, inventory: &'a str, port: &'a str) -> Vec<&'a str> {
        vec![
            "-i",
            inventory,
            "-u",
            &self.user,
            "--private-key",
            self.key_file.to_str().unwrap_or_default(),
            "-e",
            port,
        ]
    }
}

impl Automation for AnsibleRunner {
    async fn run_playbook(
        &self,
        host: Ipv4Addr,
        name: &str,
        vars: serde_json::Value,
    ) -> Result<PlayReport, VmError> {
        let playbook = self.playbook_dir.join(format!("{name}.yml"));
        let playbook = playbook.display().to_string();
        info!("Running playbook {playbook} against {host}");

        // Task parameters travel via a temp file so device paths and mount
        // points never hit the argument list unquoted.
        let mut vars_file = NamedTempFile::new()?;
        vars_file.write_all(vars.to_string().as_bytes())?;
        let extra_vars = format!("@{}", vars_file.path().display());

        let inventory = format!("{host},");
        let port = format!("ansible_port={}", self.ssh_port);
        let mut args = self.identity_args(&inventory, &port);
        args.extend_from_slice(&["--extra-vars", &extra_vars, &playbook]);

        let output = self.run("ansible-playbook", &args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let report = PlayReport::from_callback_json(&stdout, &host.to_string());
        match report {
            Ok(report) => {
                // ansible-playbook exits non-zero on task failure; the
                // per-task report already carries that, so only an empty
                // report on failure means the run never reached the host.
                if !output.status.success() && report.tasks.is_empty() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    error!("Playbook {playbook} failed before any task ran: {}", stderr.trim());
                    return Err(VmError::Driver(format!(
                        "playbook {name} failed: {}",
                        stderr.trim()
                    )));
                }
                Ok(report)
            }
            Err(e) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                error!("Playbook {playbook} produced no parseable output: {}", stderr.trim());
                Err(e)
            }
        }
    }

    async fn run_command(&self, host: Ipv4Addr, command: &str) -> Result<String, VmError> {
        info!("Running in-guest command on {host}: {command}");
        let inventory = format!("{host},");
        let port = format!("ansible_port={}", self.ssh_port);
        let mut args = vec!["all"];
        args.extend(self.identity_args(&inventory, &port));
        args.extend_from_slice(&["-m", "command", "-a", command]);

        let output = self.run("ansible", &args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("In-guest command failed on {host}: {command}");
            return Err(VmError::Driver(format!(
                "in-guest command '{command}' failed on {host}: {}",
                stderr.trim()
            )));
        }
        PlayReport::first_stdout(&stdout, &host.to_string())
    }
}
