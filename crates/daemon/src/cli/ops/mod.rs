pub mod daemon;
pub mod init;
pub mod ledger;
pub mod version;

pub use daemon::Daemon;
pub use init::Init;
pub use ledger::Ledger;
pub use version::Version;
