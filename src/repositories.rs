pub mod accounts;
pub mod auth;
pub mod generation;
pub mod referrals;
pub mod store;
