// Command implementations split by subcommand for clarity.
pub mod backup;
pub mod gnss;
pub mod imu;
pub mod run;

pub use backup::run_backup;
pub use gnss::run_gnss;
pub use imu::run_imu;
pub use run::run_mode;
