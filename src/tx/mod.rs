//! Transaction crafting, signing and sending with per-account nonce sequencing

pub mod crafter;
pub mod gas;
pub mod nonce;
pub mod sender;
pub mod signer;

pub use crafter::TransactionCrafter;
pub use gas::{GasEstimator, GasPricer};
pub use nonce::{
    MemoryNonceCache, NonceCache, NonceSequencer, PartitionGuard, SubstringClassifier,
};
pub use sender::{JobSender, SenderContext, SenderSet};
pub use signer::{KeyManager, LocalKeyManager, TransactionSigner};
