mod balance;
mod integrity;
mod money;
mod statement;
mod transfer;
mod user;

pub use balance::*;
pub use integrity::*;
pub use money::*;
pub use statement::*;
pub use transfer::*;
pub use user::*;
