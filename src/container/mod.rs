pub mod bcache;
pub mod luks;
