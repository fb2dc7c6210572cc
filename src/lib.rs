pub mod abi;
pub mod client;
pub mod contract;
pub mod deployment;
pub mod provider;
pub mod state;
pub mod types;
pub mod ui;
pub mod wallets;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
