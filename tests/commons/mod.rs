#![allow(dead_code)]

pub mod chain;
pub mod redis_context;
