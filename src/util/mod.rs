pub mod atomic_map;
pub mod buf;
