pub mod computings;
pub mod containers;
pub mod keypairs;
pub mod tasks;
