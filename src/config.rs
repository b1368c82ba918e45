use std::env;
use std::path::PathBuf;

const DEFAULT_VM_DIR: &str = "/kvmctl/vms";
const DEFAULT_PLAYBOOK_DIR: &str = "/kvmctl/playbooks";
const DEFAULT_ANSIBLE_USER: &str = "ansible";
const DEFAULT_ANSIBLE_KEY: &str = "/kvmctl/keys/ansible_rsa";
const DEFAULT_SSH_PORT: u16 = 22;

/// Host-side directory layout and automation identity. Everything has a fixed
/// default and an environment override so tests and non-standard hosts can
/// relocate it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-VM storage directories live under here, one directory per VM.
    pub vm_dir: PathBuf,
    /// Idempotent task sequences executed by the automation runner.
    pub playbook_dir: PathBuf,
    pub ansible_user: String,
    pub ansible_key: PathBuf,
    /// Port probed during the readiness wait and used by the runner.
    pub ssh_port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            vm_dir: path_var("KVMCTL_VM_DIR", DEFAULT_VM_DIR),
            playbook_dir: path_var("KVMCTL_PLAYBOOK_DIR", DEFAULT_PLAYBOOK_DIR),
            ansible_user: env::var("KVMCTL_ANSIBLE_USER")
                .unwrap_or_else(|_| DEFAULT_ANSIBLE_USER.to_string()),
            ansible_key: path_var("KVMCTL_ANSIBLE_KEY", DEFAULT_ANSIBLE_KEY),
            ssh_port: env::var("KVMCTL_SSH_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SSH_PORT),
        }
    }

    /// Backing storage directory for a single VM.
    pub fn vm_path(&self, vm: &str) -> PathBuf {
        self.vm_dir.join(vm)
    }
}

fn path_var(name: &str, default: &str) -> PathBuf {
    env::var(name).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}
