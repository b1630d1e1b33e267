//! Test support for exercising cansdo clients and nodes together in one process
pub mod sim_bus;
