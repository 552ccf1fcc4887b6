// Application layer - use cases and orchestration.
// The ledger service is the only writer; everything below it is reached
// through the storage traits.

mod balance;
pub mod error;
mod locks;
mod service;
mod users;

pub use balance::*;
pub use error::*;
pub use locks::*;
pub use service::*;
pub use users::*;
