mod ansible;
mod config;
mod confirm;
mod disks;
mod errors;
mod network;
mod power;
mod resolve;
mod resources;
#[cfg(test)]
mod testutil;
mod units;
mod virsh;
mod wait;

use clap::{Parser, Subcommand};

use crate::ansible::AnsibleRunner;
use crate::config::Config;
use crate::confirm::StdinConfirm;
use crate::disks::DiskManager;
use crate::network::NetworkManager;
use crate::power::PowerController;
use crate::resources::ResourceManager;
use crate::virsh::VirshClient;

#[derive(Parser, Debug)]
#[command(version, about = "KVM VM lifecycle and device controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Power state and lifecycle
    #[command(subcommand)]
    Vm(VmCommand),
    /// Data disks
    #[command(subcommand)]
    Disk(DiskCommand),
    /// Network interfaces
    #[command(subcommand)]
    Net(NetCommand),
    /// CPU and memory allocation
    #[command(subcommand)]
    Res(ResCommand),
}

#[derive(Subcommand, Debug)]
enum VmCommand {
    /// List all VMs grouped by power state
    List,
    /// Start a VM and wait until it is reachable
    Start { vm: String },
    /// Gracefully stop a VM, forcing power-off if it does not comply
    Stop {
        vm: String,
        /// Skip the graceful shutdown and power off immediately
        #[arg(long)]
        force: bool,
    },
    /// Reboot a VM and wait until it is reachable
    Reboot { vm: String },
    /// Graceful stop followed by a start
    ResetSoft { vm: String },
    /// Immediate reset signal, no graceful shutdown
    ResetHard { vm: String },
    /// Delete a VM and its backing storage
    Delete {
        vm: String,
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DiskCommand {
    /// List a VM's disks with serials and sizes
    List { vm: String },
    /// Create and attach a data disk, provisioning it in-guest when running
    Add {
        vm: String,
        /// Disk name; generated when omitted
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = disks::DEFAULT_SIZE)]
        size: String,
        #[arg(long, default_value = disks::DEFAULT_FILESYSTEM)]
        filesystem: String,
        /// Mount point inside the guest; defaults to /mnt/<name>
        #[arg(long)]
        mount_point: Option<String>,
    },
    /// Unmount, detach, and delete a data disk
    Remove {
        vm: String,
        target: String,
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },
    /// Unmount a disk in-guest without detaching it
    Unmount { vm: String, target: String },
    /// Mount a disk back, optionally somewhere else
    Remount {
        vm: String,
        target: String,
        #[arg(long)]
        mount_point: Option<String>,
    },
    /// Grow a disk, its partition, and its filesystem
    Resize {
        vm: String,
        target: String,
        /// Amount to add, e.g. 10G
        #[arg(long)]
        add: String,
        /// Stop a running VM without asking
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum NetCommand {
    /// List a VM's NICs (live guest state when running)
    List { vm: String },
    /// Attach a NIC on the default bridge
    Add { vm: String },
    /// Detach the NIC with this MAC
    Remove { vm: String, mac: String },
}

#[derive(Subcommand, Debug)]
enum ResCommand {
    /// Show a VM's CPU and memory allocation
    List { vm: String },
    /// Change CPU count and/or memory; restarts a running VM
    Set {
        vm: String,
        #[arg(long)]
        cpu: Option<u32>,
        /// Memory in MiB
        #[arg(long)]
        memory_mb: Option<u64>,
        /// Stop a running VM without asking
        #[arg(long)]
        force: bool,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = Config::from_env();
    let driver = VirshClient::new();
    let runner = AnsibleRunner::new(&config);
    let confirm = StdinConfirm;

    let power = PowerController::new(&driver, &confirm, &config);
    let disks = DiskManager::new(&driver, &runner, &confirm, &config);
    let network = NetworkManager::new(&driver);
    let resources = ResourceManager::new(&driver, &confirm, &config);

    match cli.command {
        Commands::Vm(command) => match command {
            VmCommand::List => print_json(&power.list().await?)?,
            VmCommand::Start { vm } => {
                if let Some(ip) = power.start(&vm).await? {
                    println!("{ip}");
                }
            }
            VmCommand::Stop { vm, force } => {
                if force {
                    power.force_stop(&vm).await?;
                } else {
                    power.stop(&vm).await?;
                }
            }
            VmCommand::Reboot { vm } => {
                println!("{}", power.reboot(&vm).await?);
            }
            VmCommand::ResetSoft { vm } => {
                println!("{}", power.reset_soft(&vm).await?);
            }
            VmCommand::ResetHard { vm } => {
                println!("{}", power.reset_hard(&vm).await?);
            }
            VmCommand::Delete { vm, force } => power.delete(&vm, force).await?,
        },
        Commands::Disk(command) => match command {
            DiskCommand::List { vm } => print_json(&disks.list(&vm).await?)?,
            DiskCommand::Add {
                vm,
                name,
                size,
                filesystem,
                mount_point,
            } => {
                let target = disks
                    .add(&vm, name.as_deref(), &size, &filesystem, mount_point.as_deref())
                    .await?;
                println!("{target}");
            }
            DiskCommand::Remove { vm, target, force } => {
                disks.remove(&vm, &target, force).await?
            }
            DiskCommand::Unmount { vm, target } => disks.unmount(&vm, &target).await?,
            DiskCommand::Remount {
                vm,
                target,
                mount_point,
            } => disks.remount(&vm, &target, mount_point.as_deref()).await?,
            DiskCommand::Resize {
                vm,
                target,
                add,
                force,
            } => disks.increase_size(&vm, &target, &add, force).await?,
        },
        Commands::Net(command) => match command {
            NetCommand::List { vm } => print_json(&network.list(&vm).await?)?,
            NetCommand::Add { vm } => print_json(&network.add(&vm).await?)?,
            NetCommand::Remove { vm, mac } => network.remove(&vm, &mac).await?,
        },
        Commands::Res(command) => match command {
            ResCommand::List { vm } => print_json(&resources.list(&vm).await?)?,
            ResCommand::Set {
                vm,
                cpu,
                memory_mb,
                force,
            } => resources.set(&vm, cpu, memory_mb, force).await?,
        },
    }
    Ok(())
}
