pub mod command;
pub mod compress;
pub mod connection;
pub mod packet;
pub mod primitive;
pub mod response;
pub mod value;
