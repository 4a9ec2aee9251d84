use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "timelocker")]
#[command(about = "Backup orchestration, retention and tamper-evident audit", long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a backup job against one repository
    Backup(BackupArgs),
    /// Apply the retention policy and prune expired snapshots
    Prune(PruneArgs),
    /// Restore a snapshot into a local directory
    Restore(RestoreArgs),
    /// Verify one snapshot
    Verify(VerifyArgs),
    /// Inspect or export the audit ledger
    Audit(AuditArgs),
    /// Force-break the repository lock
    Unlock(UnlockArgs),
}

#[derive(clap::Args, Debug)]
pub struct BackupArgs {
    /// Repository id from the configuration
    pub repository: String,

    /// Target ids to back up (defaults to every configured target)
    #[arg(long = "target")]
    pub targets: Vec<String>,

    /// Tags to attach to the resulting snapshot
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Fail immediately instead of queueing when the repository is locked
    #[arg(long)]
    pub fail_fast: bool,
}

#[derive(clap::Args, Debug)]
pub struct PruneArgs {
    /// Repository id from the configuration
    pub repository: String,

    /// Fail immediately instead of queueing when the repository is locked
    #[arg(long)]
    pub fail_fast: bool,
}

#[derive(clap::Args, Debug)]
pub struct RestoreArgs {
    /// Repository id from the configuration
    pub repository: String,

    /// Snapshot id to restore
    pub snapshot: String,

    /// Directory to restore into
    #[arg(long)]
    pub target: PathBuf,

    /// Restrict the restore to the given paths
    #[arg(long = "include")]
    pub include: Vec<String>,

    /// Overwrite files that already exist in the target directory
    #[arg(long)]
    pub overwrite: bool,

    /// Fail immediately instead of queueing when the repository is locked
    #[arg(long)]
    pub fail_fast: bool,
}

#[derive(clap::Args, Debug)]
pub struct VerifyArgs {
    /// Repository id from the configuration
    pub repository: String,

    /// Snapshot id to verify
    pub snapshot: String,
}

#[derive(clap::Args, Debug)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand, Debug)]
pub enum AuditCommands {
    /// Re-verify the hash chain across all ledger segments
    Verify,
    /// Export the ledger to stdout
    Export(ExportArgs),
}

#[derive(clap::Args, Debug)]
pub struct ExportArgs {
    /// Output format
    #[arg(long, value_enum, default_value_t = ExportFormatArg::Jsonl)]
    pub format: ExportFormatArg,
}

#[derive(clap::Args, Debug)]
pub struct UnlockArgs {
    /// Repository id from the configuration
    pub repository: String,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ExportFormatArg {
    /// The persisted jsonl records, byte for byte
    Jsonl,
    /// A pretty-printed JSON array
    Json,
}
