pub mod banning;
pub mod blockchain;
pub mod config;
pub mod difficulty;
pub mod error;
pub mod metrics;
pub mod session;
pub mod shares;
pub mod stratum;
pub mod vardiff;

#[cfg(test)]
mod test_support;
