pub mod ai;
pub mod redis;

pub use self::ai::*;
pub use self::redis::*;
