/// Generators for the security-critical system artifacts: the PAM
/// login-time rules and the systemd reset/curfew units. Both writers are
/// handed explicit paths so the whole flow runs against a scratch
/// directory in tests.
pub mod pam;
pub mod systemd;

pub use pam::PamWriter;
pub use systemd::{Systemctl, SystemdControl, SystemdWriter, TimerStatus};
