pub mod protocol;
pub mod server;

pub use protocol::{MinerJob, StratumPush, StratumRequest, StratumResponse};
pub use server::StratumServer;
