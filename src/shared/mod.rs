// Cross-command utilities: process locking and clean shutdown.
pub mod lock;
pub mod signal;
