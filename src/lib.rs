// src/lib.rs
pub mod ports {
    pub mod replay_gateway;
}
pub mod alert;
pub mod config;
pub mod lock;
pub mod model;
pub mod pairtrade;
pub mod rebalance;
pub mod risk;
pub mod signal;
pub mod spread;
pub mod store;
pub mod trade;
