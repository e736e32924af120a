// Application layer - use cases and orchestration.
// The ledger owns balances; identity and the desk sit in front of it.

pub mod desk;
pub mod error;
pub mod identity;
pub mod locks;
pub mod service;

pub use desk::*;
pub use error::*;
pub use identity::*;
pub use locks::*;
pub use service::*;
