pub mod background;
pub mod notify;
pub mod page;
pub mod port;
pub mod settings;
