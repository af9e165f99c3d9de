#![allow(dead_code)]

pub mod batcher;
