#![doc = include_str!("../README.md")]

pub mod config;
pub mod data;
pub mod pool;
pub mod producer;
pub mod upload;
