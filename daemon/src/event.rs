use crate::config::Config;

pub enum DaemonEvent {
    /// The config file changed on disk and was successfully re-parsed.
    /// Applied at the start of the next poll cycle.
    ConfigReloaded(Config),
    /// SIGINT/SIGTERM received; finish the current repository and exit.
    Shutdown,
}
