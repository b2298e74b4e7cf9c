pub mod keep_open;
pub mod lifecycle;
pub mod monotime;
pub mod scanbuf;
