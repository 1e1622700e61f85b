pub mod gateway;
pub mod gateway_box;
pub mod intent;
pub mod registry;
pub mod worker;
