#![forbid(unsafe_code)]

pub mod connection;
pub mod context;
pub mod dispatch;
pub mod gate;
pub mod health;
pub mod hub;
pub mod presence;
pub mod relay;
pub mod status;
pub mod waiter;

#[cfg(test)]
mod test_support;







#[cfg(test)]
mod status_tests;
