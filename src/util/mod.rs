pub mod buf_ext;
pub mod clock;
