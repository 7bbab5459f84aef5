pub mod debugging;
pub mod hashing;
pub mod utils;
