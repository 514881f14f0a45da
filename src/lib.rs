pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod extract;
pub mod generation;
pub mod hdf5;
pub mod lindi;
pub mod output;
pub mod reader;
pub mod store;
pub mod sync;
pub mod tree;
pub mod value;
