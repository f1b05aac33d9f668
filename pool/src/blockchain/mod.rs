/// Daemon communication and block templates

pub mod codec;
pub mod randomx;
pub mod rpc_client;
pub mod template_manager;

pub use codec::{BlockCodec, CryptonoteCodec, KeccakHasher, PowHasher};
pub use randomx::{pow_hasher, RandomXHasher};
pub use rpc_client::{DaemonClient, DaemonRpc, RawTemplate};
pub use template_manager::{BlockTemplate, BlockTemplateManager};
