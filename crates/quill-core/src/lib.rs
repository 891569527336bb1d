pub mod conversation;
pub mod errors;
pub mod ids;
pub mod model;
pub mod stream;
pub mod tools;
pub mod transport;
pub mod turns;
