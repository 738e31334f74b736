pub mod account;
pub mod daemon;
pub mod sync;
