use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

// CLI root definition. This is the single entrypoint for all supported modes.
#[derive(Parser, Debug)]
#[command(name = "gnss-imu-logger", version)]
#[command(about = "GNSS + IMU acquisition pipeline with NTRIP correction relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: AppCommand,
}

// Subcommands map directly to one module each under src/commands/.
#[derive(Subcommand, Debug)]
pub enum AppCommand {
    /// Log inertial records from a serial IMU to CSV
    Imu(ImuArgs),
    /// Log position records from a serial GNSS receiver to CSV
    Gnss(GnssArgs),
    /// Run both sensor pipelines with fused records and live status display
    Run(RunArgs),
    /// Save the receiver navigation state to flash once fusion has converged
    Backup(BackupArgs),
}

// IMU-only configuration.
#[derive(Args, Debug, Clone)]
pub struct ImuArgs {
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub imu_port: String,
    #[arg(long, default_value_t = 115_200)]
    pub imu_baud_rate: u32,
    #[arg(long, default_value_t = 1_000)]
    pub read_timeout_ms: u64,
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,
    #[arg(long, default_value_t = 100)]
    pub flush_threshold: usize,
    #[arg(long, default_value = "imu_log.lock")]
    pub lock_file: PathBuf,
}

// GNSS-only configuration, including the optional correction relay.
#[derive(Args, Debug, Clone)]
pub struct GnssArgs {
    #[arg(long, default_value = "/dev/ttyACM0")]
    pub gnss_port: String,
    #[arg(long, default_value_t = 115_200)]
    pub gnss_baud_rate: u32,
    #[arg(long, default_value_t = 1_000)]
    pub read_timeout_ms: u64,
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,
    #[arg(long, default_value_t = 100)]
    pub flush_threshold: usize,
    #[arg(long, default_value = "gnss_log.lock")]
    pub lock_file: PathBuf,
    #[arg(long, default_value_t = false)]
    pub high_precision: bool,
    #[arg(long, default_value_t = false)]
    pub enable_ntrip: bool,
    #[arg(long, default_value = "")]
    pub ntrip_server: String,
    #[arg(long, default_value_t = 2_101)]
    pub ntrip_port: u16,
    #[arg(long, default_value = "")]
    pub ntrip_mountpoint: String,
    #[arg(long, default_value = "RTCM")]
    pub ntrip_datatype: String,
    #[arg(long, default_value = "")]
    pub ntrip_user: String,
    #[arg(long, default_value = "none", env = "NTRIP_PASSWORD")]
    pub ntrip_password: String,
    #[arg(long, default_value_t = 1)]
    pub gga_interval_secs: u64,
    #[arg(long, default_value_t = 0)]
    pub gga_mode: u8,
}

// Combined runtime mode config. It includes all IMU + GNSS fields plus
// fusion and display controls.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub imu_port: String,
    #[arg(long, default_value_t = 115_200)]
    pub imu_baud_rate: u32,
    #[arg(long, default_value = "/dev/ttyACM0")]
    pub gnss_port: String,
    #[arg(long, default_value_t = 115_200)]
    pub gnss_baud_rate: u32,
    #[arg(long, default_value_t = 1_000)]
    pub read_timeout_ms: u64,
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,
    #[arg(long, default_value_t = 100)]
    pub flush_threshold: usize,
    #[arg(long, default_value = "imu_log.lock")]
    pub imu_lock_file: PathBuf,
    #[arg(long, default_value = "gnss_log.lock")]
    pub gnss_lock_file: PathBuf,
    #[arg(long = "no-fusion", action = ArgAction::SetFalse, default_value_t = true)]
    pub fusion: bool,
    #[arg(long, default_value_t = false)]
    pub high_precision: bool,
    #[arg(long, default_value_t = 1)]
    pub display_interval_secs: u64,
    #[arg(long, default_value_t = false)]
    pub enable_ntrip: bool,
    #[arg(long, default_value = "")]
    pub ntrip_server: String,
    #[arg(long, default_value_t = 2_101)]
    pub ntrip_port: u16,
    #[arg(long, default_value = "")]
    pub ntrip_mountpoint: String,
    #[arg(long, default_value = "RTCM")]
    pub ntrip_datatype: String,
    #[arg(long, default_value = "")]
    pub ntrip_user: String,
    #[arg(long, default_value = "none", env = "NTRIP_PASSWORD")]
    pub ntrip_password: String,
    #[arg(long, default_value_t = 1)]
    pub gga_interval_secs: u64,
    #[arg(long, default_value_t = 0)]
    pub gga_mode: u8,
}

// One-shot backup configuration.
#[derive(Args, Debug, Clone)]
pub struct BackupArgs {
    #[arg(long, default_value = "/dev/ttyACM0")]
    pub gnss_port: String,
    #[arg(long, default_value_t = 115_200)]
    pub gnss_baud_rate: u32,
    #[arg(long, default_value_t = 1_000)]
    pub read_timeout_ms: u64,
    #[arg(long, default_value_t = 300)]
    pub wait_secs: u64,
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

impl RunArgs {
    // Build ImuArgs from the shared fields so run-mode reuses the exact
    // IMU pipeline implementation.
    pub fn to_imu_args(&self) -> ImuArgs {
        ImuArgs {
            imu_port: self.imu_port.clone(),
            imu_baud_rate: self.imu_baud_rate,
            read_timeout_ms: self.read_timeout_ms,
            data_dir: self.data_dir.clone(),
            flush_threshold: self.flush_threshold,
            lock_file: self.imu_lock_file.clone(),
        }
    }

    // Build GnssArgs from the shared fields so run-mode reuses the exact
    // GNSS pipeline implementation.
    pub fn to_gnss_args(&self) -> GnssArgs {
        GnssArgs {
            gnss_port: self.gnss_port.clone(),
            gnss_baud_rate: self.gnss_baud_rate,
            read_timeout_ms: self.read_timeout_ms,
            data_dir: self.data_dir.clone(),
            flush_threshold: self.flush_threshold,
            lock_file: self.gnss_lock_file.clone(),
            high_precision: self.high_precision,
            enable_ntrip: self.enable_ntrip,
            ntrip_server: self.ntrip_server.clone(),
            ntrip_port: self.ntrip_port,
            ntrip_mountpoint: self.ntrip_mountpoint.clone(),
            ntrip_datatype: self.ntrip_datatype.clone(),
            ntrip_user: self.ntrip_user.clone(),
            ntrip_password: self.ntrip_password.clone(),
            gga_interval_secs: self.gga_interval_secs,
            gga_mode: self.gga_mode,
        }
    }
}
