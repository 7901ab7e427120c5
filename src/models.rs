pub mod accounts;
pub mod payments;
pub mod referrals;
pub mod throttle;
