pub mod attention;
pub mod checkpoint;
pub mod commentary;
pub mod config;
pub mod error;
pub mod layers;
pub mod model;
pub mod network;
pub mod storage;
pub mod tokenizer;
pub mod transformer;
