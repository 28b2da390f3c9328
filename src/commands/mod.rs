//! 供展示层调用的函数

pub mod log;
pub mod status;
