//! CSV adapters for the command-line runner.

pub mod balance_writer;
pub mod script_reader;
pub mod script_runner;
