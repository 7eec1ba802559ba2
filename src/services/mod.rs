pub mod consistency;
pub mod gateway;
pub mod jobs;
pub mod monitor;
pub mod pipeline;

#[cfg(test)]
pub mod testutil;
