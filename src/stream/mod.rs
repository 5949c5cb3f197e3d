pub mod error;
pub mod receive;
pub mod send;
pub mod serve;
pub mod utils;

#[cfg(test)]
mod send_tests;
